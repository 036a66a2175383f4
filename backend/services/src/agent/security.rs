//! Host side enforcement of a container's security config: kernel
//! whitelists, opensnitch rules, iptables rule files and the authz plugin's
//! sensitive container list.

use anyhow::{Context, Result};
use async_trait::async_trait;
use fleetwarden_shared::rpc::{AuthzUpdateReply, AuthzUpdateRequest, SensitiveAction};
use fleetwarden_shared::{NetworkRule, NetworkRuleList, ProcProtection, SecurityConfig};
use serde::Serialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::error::{ServiceError, ServiceResult};

pub const UUID_ENV: &str = "FW_UUID";

const AUTHZ_TIMEOUT: Duration = Duration::from_secs(1);
const INPUT_STATE_RULE: &str = "-A INPUT -m state --state RELATED,ESTABLISHED -j ACCEPT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum KernelCom {
    Hello = 1,
    Quit = 2,
    Request = 3,
    Notify = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum KernelFunc {
    /// Executable whitelist.
    Whitelist = 1,
    /// File access control.
    FileAccess = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum KernelAction {
    Add = 1,
    Del = 2,
    Free = 3,
    Enabled = 4,
}

/// One command for the kernel module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelMessage {
    pub com: KernelCom,
    pub func: KernelFunc,
    pub action: KernelAction,
    pub container_id: String,
    /// Path for add/del, `"1"`/`"0"` for enabled, empty for free.
    pub data: String,
}

impl KernelMessage {
    pub fn request(func: KernelFunc, action: KernelAction, container_id: &str, data: &str) -> Self {
        Self {
            com: KernelCom::Request,
            func,
            action,
            container_id: container_id.to_owned(),
            data: data.to_owned(),
        }
    }

    pub fn msg_type(&self) -> u16 {
        ((self.com as u16) << 12) | ((self.func as u16) << 8) | ((self.action as u16) << 4)
    }
}

/// Transport to the kernel enforcement module.
#[async_trait]
pub trait KernelChannel: Send + Sync {
    async fn send(&self, msg: &KernelMessage) -> Result<()>;
}

/// Used when the host has no kernel module; commands are only logged.
pub struct LoggingKernelChannel;

#[async_trait]
impl KernelChannel for LoggingKernelChannel {
    async fn send(&self, msg: &KernelMessage) -> Result<()> {
        log::debug!(
            "kernel msg type={:#06x} container={} data={}",
            msg.msg_type(),
            msg.container_id,
            msg.data
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct OpensnitchRule {
    name: String,
    enabled: bool,
    precedence: bool,
    action: &'static str,
    duration: &'static str,
    operator: OpensnitchOperator,
}

#[derive(Serialize)]
struct OpensnitchOperator {
    #[serde(rename = "type")]
    kind: &'static str,
    operand: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    data: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    list: Vec<OpensnitchOperator>,
}

impl OpensnitchOperator {
    fn uuid(uuid: &str) -> Self {
        Self {
            kind: "simple",
            operand: format!("process.env.{}", UUID_ENV),
            data: uuid.to_owned(),
            list: Vec::new(),
        }
    }
}

pub struct SecurityPaths {
    pub opensnitch_rule_dir: PathBuf,
    pub iptables_dir: PathBuf,
    pub authz_sock: PathBuf,
}

pub struct Enforcer {
    kernel: Arc<dyn KernelChannel>,
    paths: SecurityPaths,
}

impl Enforcer {
    pub fn new(kernel: Arc<dyn KernelChannel>, paths: SecurityPaths) -> Self {
        Self { kernel, paths }
    }

    async fn send_list(
        &self,
        func: KernelFunc,
        id: &str,
        is_on: bool,
        to_add: &[String],
        to_del: &[String],
    ) -> Result<()> {
        for entry in to_add {
            self.kernel
                .send(&KernelMessage::request(func, KernelAction::Add, id, entry))
                .await?;
        }
        let flag = if is_on { "1" } else { "0" };
        self.kernel
            .send(&KernelMessage::request(func, KernelAction::Enabled, id, flag))
            .await?;
        for entry in to_del {
            self.kernel
                .send(&KernelMessage::request(func, KernelAction::Del, id, entry))
                .await?;
        }
        Ok(())
    }

    pub async fn update_whitelist(&self, id: &str, is_on: bool, to_add: &[String], to_del: &[String]) -> Result<()> {
        self.send_list(KernelFunc::Whitelist, id, is_on, to_add, to_del).await
    }

    pub async fn clean_whitelist(&self, id: &str) -> Result<()> {
        self.kernel
            .send(&KernelMessage::request(KernelFunc::Whitelist, KernelAction::Free, id, ""))
            .await
    }

    pub async fn update_file_access(&self, id: &str, is_on: bool, to_add: &[String], to_del: &[String]) -> Result<()> {
        self.send_list(KernelFunc::FileAccess, id, is_on, to_add, to_del).await
    }

    pub async fn clean_file_access(&self, id: &str) -> Result<()> {
        self.kernel
            .send(&KernelMessage::request(KernelFunc::FileAccess, KernelAction::Free, id, ""))
            .await
    }

    fn allow_rule_path(&self, id: &str) -> PathBuf {
        self.paths.opensnitch_rule_dir.join(format!("0002-{}-allow.json", id))
    }

    fn deny_rule_path(&self, id: &str) -> PathBuf {
        self.paths.opensnitch_rule_dir.join(format!("0003-{}-deny.json", id))
    }

    /// Lets only the listed executables of the container reach the network.
    /// Processes are matched through the uuid in their environment.
    pub async fn save_opensnitch_rule(&self, id: &str, uuid: &str, rule: &ProcProtection) -> Result<()> {
        // An empty uuid would match every process on the host.
        anyhow::ensure!(!uuid.is_empty(), "opensnitch rule needs a container uuid");

        let exe_pattern = rule
            .exe_list
            .iter()
            .map(|p| regex::escape(p))
            .collect::<Vec<_>>()
            .join("|");
        let allow = OpensnitchRule {
            name: format!("{}-allow", id),
            enabled: rule.is_on,
            precedence: true,
            action: "allow",
            duration: "always",
            operator: OpensnitchOperator {
                kind: "list",
                operand: "list".to_string(),
                data: String::new(),
                list: vec![
                    OpensnitchOperator {
                        kind: "regexp",
                        operand: "process.path".to_string(),
                        data: format!("^({})$", exe_pattern),
                        list: Vec::new(),
                    },
                    OpensnitchOperator::uuid(uuid),
                ],
            },
        };
        let deny = OpensnitchRule {
            name: format!("{}-deny", id),
            enabled: rule.is_on,
            precedence: false,
            action: "deny",
            duration: "always",
            operator: OpensnitchOperator::uuid(uuid),
        };

        write_json(&self.allow_rule_path(id), &allow).await?;
        write_json(&self.deny_rule_path(id), &deny).await
    }

    /// Missing rule files are ignored; other failures are logged.
    pub async fn remove_opensnitch_rule(&self, id: &str) {
        for path in [self.allow_rule_path(id), self.deny_rule_path(id)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!("remove opensnitch rule {}: {}", path.display(), e),
            }
        }
    }

    pub fn iptables_path(&self, id: &str, name: &str) -> PathBuf {
        self.paths.iptables_dir.join(format!("{}-{}", id, name))
    }

    /// Writes the container's iptables rule file and loads it into the
    /// container's network namespace when it is running (`pid != 0`).
    pub async fn update_network_rules(&self, id: &str, name: &str, rules: &NetworkRuleList, pid: i64) -> Result<()> {
        let path = self.iptables_path(id, name);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create {}", dir.display()))?;
        }
        tokio::fs::write(&path, iptables_rules(rules.is_on, &rules.rules))
            .await
            .with_context(|| format!("write {}", path.display()))?;
        if pid != 0 {
            restore_iptables(&path, pid).await?;
        }
        Ok(())
    }

    /// Reloads a previously written rule file after the container started.
    pub async fn restore_network_rules(&self, id: &str, name: &str, pid: i64) -> Result<()> {
        let path = self.iptables_path(id, name);
        if pid == 0 || !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        restore_iptables(&path, pid).await
    }

    pub async fn remove_network_rules(&self, id: &str, name: &str) {
        let path = self.iptables_path(id, name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => log::info!("removed iptables rules {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("remove iptables rules {}: {}", path.display(), e),
        }
    }

    async fn update_sensitive(&self, action: SensitiveAction, name: &str, id: &str) -> Result<()> {
        let request = AuthzUpdateRequest {
            action,
            ids: sensitive_ids(name, id),
        };
        let reply = tokio::time::timeout(AUTHZ_TIMEOUT, authz_call(&self.paths.authz_sock, &request))
            .await
            .context("authz plugin timed out")??;
        anyhow::ensure!(reply.ok, "authz plugin refused: {}", reply.error);
        Ok(())
    }

    pub async fn add_sensitive(&self, name: &str, id: &str) -> Result<()> {
        self.update_sensitive(SensitiveAction::Add, name, id).await
    }

    pub async fn del_sensitive(&self, name: &str, id: &str) -> Result<()> {
        self.update_sensitive(SensitiveAction::Del, name, id).await
    }

    /// Applies `sec` in a fixed order. Each step reports its own error kind.
    /// On update the kernel lists are cleared first and rebuilt.
    pub async fn apply(
        &self,
        id: &str,
        uuid: &str,
        name: &str,
        pid: i64,
        from_update: bool,
        sec: &SecurityConfig,
    ) -> ServiceResult<()> {
        if from_update {
            self.clean_file_access(id).await.map_err(|e| {
                log::warn!("{} clean file access: {:#}", id, e);
                ServiceError::ContainerFileProtection(e.to_string())
            })?;
            self.clean_whitelist(id).await.map_err(|e| {
                log::warn!("{} clean whitelist: {:#}", id, e);
                ServiceError::ContainerProcProtection(e.to_string())
            })?;
        }

        if let Some(proc) = &sec.proc_protection {
            self.update_whitelist(id, proc.is_on, &proc.exe_list, &[])
                .await
                .map_err(|e| {
                    log::warn!("{} update whitelist: {:#}", id, e);
                    ServiceError::ContainerProcProtection(e.to_string())
                })?;
        }

        if let Some(nproc) = &sec.nproc_protection {
            self.save_opensnitch_rule(id, uuid, nproc).await.map_err(|e| {
                log::warn!("{} save opensnitch rule: {:#}", id, e);
                ServiceError::ContainerNprocProtection(e.to_string())
            })?;
        }

        if let Some(file) = &sec.file_protection {
            self.update_file_access(id, file.is_on, &file.file_list, &[])
                .await
                .map_err(|e| {
                    log::warn!("{} update file access: {:#}", id, e);
                    ServiceError::ContainerFileProtection(e.to_string())
                })?;
        }

        if sec.disable_cmd_operation {
            self.add_sensitive(name, id).await.map_err(|e| {
                log::warn!("{} add sensitive container: {:#}", id, e);
                ServiceError::ContainerCmdOperation(e.to_string())
            })?;
        } else if from_update {
            self.del_sensitive(name, id).await.map_err(|e| {
                log::warn!("{} del sensitive container: {:#}", id, e);
                ServiceError::ContainerCmdOperation(e.to_string())
            })?;
        }

        if let Some(rules) = &sec.network_rule {
            self.update_network_rules(id, name, rules, pid).await.map_err(|e| {
                log::warn!("{} update network rules: {:#}", id, e);
                ServiceError::ContainerNetworkRule(e.to_string())
            })?;
        }
        Ok(())
    }

    /// Drops every artefact a removed container left behind. Failures are
    /// only logged.
    pub async fn cleanup(&self, id: &str, name: &str) {
        if let Err(e) = self.clean_file_access(id).await {
            log::warn!("clean file access container={}: {:#}", id, e);
        }
        if let Err(e) = self.clean_whitelist(id).await {
            log::warn!("clean whitelist container={}: {:#}", id, e);
        }
        self.remove_opensnitch_rule(id).await;
        self.remove_network_rules(id, name).await;
        if let Err(e) = self.del_sensitive(name, id).await {
            log::warn!("del sensitive container={}: {:#}", id, e);
        }
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let raw = serde_json::to_vec_pretty(value)?;
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create {}", dir.display()))?;
    }
    tokio::fs::write(path, raw)
        .await
        .with_context(|| format!("write {}", path.display()))
}

async fn restore_iptables(path: &Path, pid: i64) -> Result<()> {
    let output = tokio::process::Command::new("nsenter")
        .arg("-t")
        .arg(pid.to_string())
        .args(["-n", "iptables-restore"])
        .arg(path)
        .output()
        .await
        .context("run nsenter")?;
    anyhow::ensure!(
        output.status.success(),
        "iptables-restore {}: {}",
        path.display(),
        String::from_utf8_lossy(&output.stderr).trim()
    );
    Ok(())
}

async fn authz_call(sock: &Path, request: &AuthzUpdateRequest) -> Result<AuthzUpdateReply> {
    let mut stream = UnixStream::connect(sock)
        .await
        .with_context(|| format!("connect {}", sock.display()))?;
    let mut line = serde_json::to_vec(request)?;
    line.push(b'\n');
    stream.write_all(&line).await?;

    let mut reply = String::new();
    BufReader::new(stream).read_line(&mut reply).await?;
    Ok(serde_json::from_str(reply.trim())?)
}

/// The names the authz plugin may see a container under.
pub fn sensitive_ids(name: &str, id: &str) -> Vec<String> {
    let mut ids = vec![name.to_owned()];
    for len in [10, 11, 12] {
        if let Some(prefix) = id.get(..len) {
            ids.push(prefix.to_owned());
        }
    }
    ids.push(id.to_owned());
    ids
}

fn rule_source(addr: &str) -> String {
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => format!("{}/32", addr),
        _ => addr.to_owned(),
    }
}

/// Renders an `iptables-restore` file. With `is_on` only the listed
/// sources get in.
pub fn iptables_rules(is_on: bool, rules: &[NetworkRule]) -> String {
    let policy = if is_on { "DROP" } else { "ACCEPT" };
    let mut out = format!(
        "*filter\n:INPUT {} [0:0]\n:FORWARD ACCEPT [0:0]\n:OUTPUT ACCEPT [0:0]\n{}\n",
        policy, INPUT_STATE_RULE
    );
    for rule in rules {
        let source = rule_source(&rule.addr);
        if rule.protocols.is_empty() {
            out.push_str(&format!("-A INPUT  -s {} -j ACCEPT\n", source));
            continue;
        }
        for proto in &rule.protocols {
            let port = if rule.port != 0 && (proto == "tcp" || proto == "udp") {
                format!(" --sport {}", rule.port)
            } else {
                String::new()
            };
            out.push_str(&format!("-A INPUT  -s {} -p {}{}  -j ACCEPT\n", source, proto, port));
        }
    }
    out.push_str("COMMIT\n");
    out
}
