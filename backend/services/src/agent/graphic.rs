//! X11 passthrough: per-container host directories for the X socket and
//! the auth file, bind mounted into the container.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::engine::EngineMount;

const X11_SOCKET_TARGET: &str = "/tmp/.X11-unix";
const XAUTH_TARGET: &str = "/tmp/.xauth";

pub const DISPLAY_ENV: (&str, &str) = ("DISPLAY", ":0");
pub const XAUTHORITY_ENV: (&str, &str) = ("XAUTHORITY", "/tmp/.xauth/Xauthority");

pub fn container_dir(basedir: &Path, name: &str) -> PathBuf {
    basedir.join(name)
}

/// Creates the host directories and returns `env` and `mounts` with the
/// graphic entries added. A mount already targeting one of the graphic
/// paths is replaced, so repeated setups converge.
pub async fn setup(
    basedir: &Path,
    name: &str,
    env: &mut Vec<String>,
    mounts: &mut Vec<EngineMount>,
) -> Result<()> {
    let dir = container_dir(basedir, name);
    let socket_dir = dir.join("socket");
    let xauth_dir = dir.join("xauth");
    for d in [&socket_dir, &xauth_dir] {
        tokio::fs::create_dir_all(d)
            .await
            .with_context(|| format!("create {}", d.display()))?;
    }

    for (key, value) in [DISPLAY_ENV, XAUTHORITY_ENV] {
        let prefix = format!("{}=", key);
        env.retain(|e| !e.starts_with(&prefix));
        env.push(format!("{}{}", prefix, value));
    }

    for (source, target) in [(&socket_dir, X11_SOCKET_TARGET), (&xauth_dir, XAUTH_TARGET)] {
        mounts.retain(|m| m.target != target);
        mounts.push(EngineMount {
            kind: "bind".to_string(),
            source: source.to_string_lossy().into_owned(),
            target: target.to_string(),
            read_only: false,
        });
    }
    Ok(())
}

/// Missing directories are not an error.
pub async fn remove(basedir: &Path, name: &str) -> Result<()> {
    let dir = container_dir(basedir, name);
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", dir.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn setup_is_idempotent() {
        let base = tempfile::tempdir().unwrap();
        let mut env = vec!["LANG=C".to_string(), "DISPLAY=:9".to_string()];
        let mut mounts = vec![EngineMount {
            kind: "bind".to_string(),
            source: "/elsewhere".to_string(),
            target: X11_SOCKET_TARGET.to_string(),
            read_only: true,
        }];

        setup(base.path(), "web", &mut env, &mut mounts).await.unwrap();
        setup(base.path(), "web", &mut env, &mut mounts).await.unwrap();

        assert_eq!(
            env,
            vec![
                "LANG=C".to_string(),
                "DISPLAY=:0".to_string(),
                "XAUTHORITY=/tmp/.xauth/Xauthority".to_string()
            ]
        );
        assert_eq!(mounts.len(), 2);
        assert!(mounts.iter().all(|m| !m.read_only));
        assert!(base.path().join("web/socket").is_dir());
        assert!(base.path().join("web/xauth").is_dir());

        remove(base.path(), "web").await.unwrap();
        assert!(!base.path().join("web").exists());
        remove(base.path(), "web").await.unwrap();
    }
}
