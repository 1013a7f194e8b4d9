// Directory of content repositories. Bare repos live two levels under the
// content root as `{account}/{repo}.git`; each repo's manifest decides
// which branches are public and which the builder may produce.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::manifest::ManifestCache;
use super::types::{BuildProfile, RepoEntry};

/// Branch metadata is read off the repo's master manifest.
const MANIFEST_BRANCH: &str = "master";

pub type RepoPool = scc::HashMap<String, Arc<RepoEntry>>;

pub struct BranchDb {
    root: PathBuf,
    profiles: HashMap<String, BuildProfile>,
    manifests: Arc<ManifestCache>,
    repos: RepoPool,
}

impl BranchDb {
    pub fn new(
        root: PathBuf,
        profiles: HashMap<String, BuildProfile>,
        manifests: Arc<ManifestCache>,
    ) -> Self {
        Self {
            root,
            profiles,
            manifests,
            repos: RepoPool::default(),
        }
    }

    /// Walk the content root and (re)load every repo's branch info.
    pub async fn scan(&self) -> anyhow::Result<()> {
        for (account, repo, repo_path) in discover(&self.root) {
            if let Err(err) = self.load_repo(&account, &repo, repo_path).await {
                warn!(account, repo, %err, "skipping repo with unreadable manifest");
            }
        }
        debug!(repos = self.repos.len(), root = %self.root.display(), "content root scanned");
        Ok(())
    }

    async fn load_repo(
        &self,
        account: &str,
        repo: &str,
        repo_path: PathBuf,
    ) -> anyhow::Result<()> {
        let manifest = self.manifests.get(&repo_path, MANIFEST_BRANCH).await?;
        let mut public = manifest.public();
        if public.is_empty() {
            public = Vec::new();
        }
        let buildable = manifest
            .build_profile(&self.profiles)
            .map(|p| p.buildable)
            .unwrap_or_default();

        let entry = Arc::new(RepoEntry {
            account: account.to_owned(),
            repo: repo.to_owned(),
            repo_path,
            public,
            buildable,
        });
        let key = format!("{account}/{repo}");
        if self.repos.update(&key, |_, v| *v = entry.clone()).is_none() {
            _ = self.repos.insert(key, entry);
        }
        Ok(())
    }

    /// Reload one repo's manifest-derived info, e.g. after a push.
    pub async fn update_branch_info(&self, account: &str, repo: &str) -> anyhow::Result<()> {
        let repo_path = self.repo_path(account, repo);
        self.manifests.invalidate_repo(&repo_path);
        if repo_path.is_dir() {
            self.load_repo(account, repo, repo_path).await?;
        } else {
            self.repos.remove(&format!("{account}/{repo}"));
        }
        Ok(())
    }

    pub fn repo_path(&self, account: &str, repo: &str) -> PathBuf {
        self.root.join(account).join(format!("{repo}.git"))
    }

    pub fn get(&self, account: &str, repo: &str) -> Option<Arc<RepoEntry>> {
        self.repos
            .read(&format!("{account}/{repo}"), |_, v| v.clone())
    }

    pub fn is_account_name(&self, name: &str) -> bool {
        let mut found = false;
        self.repos.scan(|_, entry| {
            if entry.account == name {
                found = true;
            }
        });
        found
    }

    pub fn is_repo_name(&self, account: &str, repo: &str) -> bool {
        self.get(account, repo).is_some()
    }

    pub fn default_public_branch(&self, account: &str, repo: &str) -> Option<String> {
        self.get(account, repo)?.public.first().cloned()
    }

    pub fn is_public_branch(&self, account: &str, repo: &str, branch: &str) -> bool {
        self.get(account, repo)
            .is_some_and(|entry| entry.public.iter().any(|b| b == branch))
    }

    /// Every `(repo, branch)` pair served to clients.
    pub fn list_public(&self) -> Vec<(Arc<RepoEntry>, String)> {
        let mut out = Vec::new();
        self.repos.scan(|_, entry| {
            for branch in &entry.public {
                out.push((entry.clone(), branch.clone()));
            }
        });
        out
    }

    pub fn list_buildable(&self) -> Vec<(Arc<RepoEntry>, String)> {
        let mut out = Vec::new();
        self.repos.scan(|_, entry| {
            for branch in &entry.buildable {
                out.push((entry.clone(), branch.clone()));
            }
        });
        out
    }
}

fn discover(root: &Path) -> Vec<(String, String, PathBuf)> {
    WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir())
        .filter_map(|e| {
            let repo = e.file_name().to_str()?.strip_suffix(".git")?.to_owned();
            let account = e.path().parent()?.file_name()?.to_str()?.to_owned();
            Some((account, repo, e.into_path()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovers_account_repo_layout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("acme/site.git")).unwrap();
        std::fs::create_dir_all(dir.path().join("acme/docs.git")).unwrap();
        std::fs::create_dir_all(dir.path().join("other/blog.git")).unwrap();
        // too shallow and not a .git dir, both ignored
        std::fs::create_dir_all(dir.path().join("stray.git")).unwrap();
        std::fs::create_dir_all(dir.path().join("acme/notes")).unwrap();

        let mut found = discover(dir.path());
        found.sort();
        let names: Vec<(String, String)> = found
            .into_iter()
            .map(|(a, r, _)| (a, r))
            .collect();
        assert_eq!(
            names,
            [
                ("acme".to_owned(), "docs".to_owned()),
                ("acme".to_owned(), "site".to_owned()),
                ("other".to_owned(), "blog".to_owned()),
            ]
        );
    }
}
