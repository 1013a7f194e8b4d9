// Multi-step streaming pipelines with per-step disk caching. Each cached
// step writes to `cache_dir/<interpolated template>`; the file on disk is
// the cache entry, and concurrent producers of the same artifact are
// coalesced through a single-flight keyed by the artifact path.

pub mod template;
pub mod transform;
pub mod vars;

use std::future::Future;
use std::path::{Path, PathBuf};

use rand::Rng;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use crate::tasks::{SharedError, SingleFlight};
pub use vars::Vars;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("path template references undefined variable `{0}`")]
    MissingVar(String),
    #[error("path template `{0}` interpolates to an unsafe path")]
    BadTemplate(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Handle to a finished pipeline artifact on disk.
#[derive(Clone, Debug)]
pub struct Artifact {
    pub file: PathBuf,
    pub commit: String,
    pub group: String,
    pub mime_type: Option<String>,
    pub cache_control: Option<String>,
}

impl Artifact {
    pub fn new(file: PathBuf, commit: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            file,
            commit: commit.into(),
            group: group.into(),
            mime_type: None,
            cache_control: None,
        }
    }

    pub fn etag(&self) -> String {
        format!("{}-{}", self.commit, self.group)
    }

    pub async fn open(&self) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(&self.file).await
    }
}

/// Writer a step produces into; handed back so the runner can flush and
/// rename the artifact into place.
pub type StepSink = BufWriter<tokio::fs::File>;

pub struct Runner {
    cache_dir: PathBuf,
    flights: SingleFlight<Option<Artifact>>,
}

impl Runner {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            flights: SingleFlight::new(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn path_for(&self, tpl: &str, vars: &Vars) -> Result<PathBuf, PipelineError> {
        Ok(self.cache_dir.join(template::interpolate(tpl, vars)?))
    }

    /// Run the whole pipeline invocation under a single-flight keyed by the
    /// final artifact path. Readers of a not-yet-complete artifact block on
    /// the producer here.
    pub async fn coalesce<F>(
        &self,
        artifact_path: &Path,
        build: F,
    ) -> Result<Option<Artifact>, SharedError>
    where
        F: Future<Output = anyhow::Result<Option<Artifact>>>,
    {
        self.flights
            .run(&artifact_path.to_string_lossy(), build)
            .await
    }

    /// Ensure `path` holds the step's output. Returns true when the
    /// producer ran, false on a cache hit. Output goes to a temporary file
    /// first and is renamed into place; a failed producer leaves nothing
    /// behind.
    pub async fn materialize<F, Fut>(&self, path: &Path, produce: F) -> anyhow::Result<bool>
    where
        F: FnOnce(StepSink) -> Fut,
        Fut: Future<Output = anyhow::Result<StepSink>>,
    {
        if tokio::fs::try_exists(path).await? {
            debug!(path = %path.display(), "pipeline step cache hit");
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let part = partial_path(path);
        let file = tokio::fs::File::create(&part).await?;
        let writer = BufWriter::new(file);

        match produce(writer).await {
            Ok(mut writer) => {
                writer.flush().await?;
                tokio::fs::rename(&part, path).await?;
                Ok(true)
            }
            Err(err) => {
                if let Err(rm) = tokio::fs::remove_file(&part).await {
                    warn!(path = %part.display(), error = %rm, "failed to remove partial artifact");
                }
                Err(err)
            }
        }
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let nonce: u64 = rand::thread_rng().gen();
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".part{nonce:016x}"));
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn materialize_writes_once_then_hits_cache() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new(dir.path().to_owned());
        let path = dir.path().join("a/b/out.txt");
        let runs = AtomicUsize::new(0);

        for _ in 0..2 {
            runner
                .materialize(&path, |mut w| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    async move {
                        w.write_all(b"hello").await?;
                        Ok(w)
                    }
                })
                .await
                .unwrap();
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn failed_producer_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new(dir.path().to_owned());
        let path = dir.path().join("broken.jsonl");

        let err = runner
            .materialize(&path, |mut w| async move {
                w.write_all(b"half a record").await?;
                anyhow::bail!("upstream died")
            })
            .await;

        assert!(err.is_err());
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn coalesced_builds_run_once() {
        let dir = tempfile::tempdir().unwrap();
        let runner = std::sync::Arc::new(Runner::new(dir.path().to_owned()));
        let path = dir.path().join("artifact.json");
        let runs = std::sync::Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let runner = runner.clone();
            let path = path.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                runner
                    .coalesce(&path, async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
                        Ok(Some(Artifact::new(path.clone(), "c1", "g1")))
                    })
                    .await
            }));
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        for handle in handles {
            let artifact = handle.await.unwrap().unwrap().unwrap();
            assert_eq!(artifact.etag(), "c1-g1");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
