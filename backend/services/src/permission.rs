use std::collections::HashSet;

pub const PERMISSION_CONTAINER_CONF_BASIC: &str = "container_conf_basic";
pub const PERMISSION_CONTAINER_CONF_SEC: &str = "container_conf_sec";

/// Identity of the user behind a controller request, as forwarded by the
/// authentication layer in front of the controller.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    pub user_id: Option<i64>,
    permissions: HashSet<String>,
    enforce: bool,
}

impl Caller {
    pub fn new(user_id: Option<i64>, permissions: impl IntoIterator<Item = String>, enforce: bool) -> Self {
        Self {
            user_id,
            permissions: permissions.into_iter().collect(),
            enforce,
        }
    }

    /// Internal callers such as background loops bypass permission checks.
    pub fn system() -> Self {
        Self::default()
    }

    pub fn parse_permissions(header: &str) -> Vec<String> {
        header
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_owned)
            .collect()
    }

    pub fn enforced(&self) -> bool {
        self.enforce
    }

    pub fn has(&self, perm: &str) -> bool {
        !self.enforce || self.permissions.contains(perm)
    }
}
