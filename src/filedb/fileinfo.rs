// Per-branch file info: for every tracked path with an owning fileset, the
// short hash of its last modifying commit and the fileset's cache-control.
// Population is single-flighted per `account/repo/branch`; repo-update
// events evict the entry and the next request rebuilds it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

use crate::content::Filesets;
use crate::tasks::CachingSingleFlight;
use crate::vcs;

#[derive(Clone, Debug)]
pub struct FileInfo {
    pub commit: String,
    pub cache_control: Option<String>,
}

pub struct FileInfoDb {
    /// Short head commit of the branch at population time.
    pub head: String,
    map: HashMap<String, FileInfo>,
}

impl FileInfoDb {
    pub fn get(&self, path: &str) -> Option<&FileInfo> {
        self.map.get(path)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.map.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    async fn populate(
        repo_path: &Path,
        branch: &str,
        filesets: &Filesets,
    ) -> anyhow::Result<Option<Self>> {
        let Some(head) = vcs::head_commit(repo_path, branch).await? else {
            return Ok(None);
        };
        let head_short: String = head.id.chars().take(7).collect();
        let scan = vcs::history_scan(repo_path, &head.id).await?;

        let (mut writer, reader) = tokio::io::duplex(64 * 1024);
        let repo = repo_path.to_owned();
        let commit = head.id.clone();
        let lister = tokio::spawn(async move {
            vcs::list_tracked_files(&repo, &commit, &mut writer).await
        });

        let mut map = HashMap::new();
        let mut lines = BufReader::new(reader).lines();
        while let Some(path) = lines.next_line().await? {
            let Some(fileset) = filesets.owner(&path) else {
                continue;
            };
            let commit = scan
                .commit_for(&path)
                .unwrap_or(head_short.as_str())
                .to_owned();
            map.insert(
                path,
                FileInfo {
                    commit,
                    cache_control: fileset.def.cache_control.clone(),
                },
            );
        }
        lister.await??;

        debug!(branch, files = map.len(), "file info populated");
        Ok(Some(Self {
            head: head_short,
            map,
        }))
    }
}

pub struct FileInfoCache {
    inner: CachingSingleFlight<Option<Arc<FileInfoDb>>>,
}

impl FileInfoCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: CachingSingleFlight::new(capacity),
        }
    }

    /// The info DB for `key` (`account/repo/branch`), or None when the
    /// branch does not exist.
    pub async fn get(
        &self,
        key: &str,
        repo_path: &Path,
        branch: &str,
        filesets: Arc<Filesets>,
    ) -> anyhow::Result<Option<Arc<FileInfoDb>>> {
        let repo_path = repo_path.to_owned();
        let branch = branch.to_owned();
        self.inner
            .run(key, async move {
                Ok(FileInfoDb::populate(&repo_path, &branch, &filesets)
                    .await?
                    .map(Arc::new))
            })
            .await
            .map_err(|err| anyhow::anyhow!(err))
    }

    pub fn invalidate(&self, key: &str) {
        self.inner.remove(key);
    }
}
