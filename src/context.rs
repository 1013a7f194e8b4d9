// Request context assembled by the HTTP layer and threaded through every
// subsystem: which account/repo/branch is addressed, how the request is
// rooted, and (once ACM has run) what it may see.

use std::path::PathBuf;

use serde_json::{json, Value};

use crate::acm::AuthContext;

#[derive(Clone, Debug)]
pub struct Context {
    pub account: String,
    pub repo: String,
    pub branch: String,
    /// `account/repo/branch`, the invalidation key for every per-branch
    /// cache.
    pub key: String,
    pub repo_path: PathBuf,
    pub base_path: String,
    pub hostname: String,
    pub trailing: Vec<String>,
    pub secure: bool,
    pub auth: Option<AuthContext>,
}

impl Context {
    pub fn new(
        account: impl Into<String>,
        repo: impl Into<String>,
        branch: impl Into<String>,
        repo_path: PathBuf,
        base_path: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        let account = account.into();
        let repo = repo.into();
        let branch = branch.into();
        let key = format!("{account}/{repo}/{branch}");
        Self {
            account,
            repo,
            branch,
            key,
            repo_path,
            base_path: base_path.into(),
            hostname: hostname.into(),
            trailing: Vec::new(),
            secure: false,
            auth: None,
        }
    }

    /// The ACM group fingerprint; `0` before authentication has run.
    pub fn group(&self) -> &str {
        self.auth.as_ref().map(|a| a.group.as_str()).unwrap_or("0")
    }

    pub fn user_groups(&self) -> Vec<String> {
        self.auth
            .as_ref()
            .map(|a| a.user_info.groups.clone())
            .unwrap_or_default()
    }

    /// Deterministic JSON shape for pipeline vars and path templates.
    pub fn to_value(&self) -> Value {
        json!({
            "account": self.account,
            "repo": self.repo,
            "branch": self.branch,
            "key": self.key,
            "basePath": self.base_path,
            "hostname": self.hostname,
            "auth": self.auth.as_ref().map(AuthContext::to_value).unwrap_or_else(|| json!({"group": "0", "$group": "0"})),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_joins_the_address() {
        let ctx = Context::new("acme", "site", "master", "/tmp/r.git".into(), "/acme/site", "h");
        assert_eq!(ctx.key, "acme/site/master");
        assert_eq!(ctx.group(), "0");
    }
}
