// Per-branch representation bundles, built from the tracked file listing
// at head and dropped on repo-update events.

use std::path::Path;
use std::sync::Arc;

use super::Resources;
use crate::tasks::CachingSingleFlight;
use crate::vcs;

pub struct ResourcesCache {
    inner: CachingSingleFlight<Arc<Resources>>,
}

impl ResourcesCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: CachingSingleFlight::new(capacity),
        }
    }

    pub async fn get(
        &self,
        key: &str,
        repo_path: &Path,
        branch: &str,
    ) -> anyhow::Result<Arc<Resources>> {
        let repo_path = repo_path.to_owned();
        let branch = branch.to_owned();
        self.inner
            .run(key, async move {
                let Some(head) = vcs::head_commit(&repo_path, &branch).await? else {
                    return Ok(Arc::new(Resources::default()));
                };
                let paths = vcs::collect_tracked(&repo_path, &head.id).await?;
                Ok(Arc::new(Resources::from_paths(
                    paths.iter().map(|(p, _)| p.as_str()),
                )))
            })
            .await
            .map_err(|err| anyhow::anyhow!(err))
    }

    pub fn invalidate(&self, key: &str) {
        self.inner.remove(key);
    }
}
