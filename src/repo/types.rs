use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One discovered content repository and its branch exposure.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RepoEntry {
    pub account: String,
    pub repo: String,
    pub repo_path: PathBuf,
    /// Branches served to clients; first entry is the default.
    pub public: Vec<String>,
    /// Branches the build workflow may produce.
    pub buildable: Vec<String>,
}

impl RepoEntry {
    pub fn key(&self, branch: &str) -> String {
        format!("{}/{}/{}", self.account, self.repo, branch)
    }
}

/// External build workflow description. Profiles either live in the server
/// settings under an id or inline on a repo manifest.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BuildProfile {
    #[serde(default)]
    pub buildable: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
}
