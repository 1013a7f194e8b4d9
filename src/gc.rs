// Cache garbage collection: a periodic sweep deleting artifacts not read
// for N days, minus a configurable preserve set. Failures are logged and
// retried on the next pass.

use std::path::Path;
use std::time::{Duration, SystemTime};

use rand::Rng;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::content::GlobSet;

pub struct GcConfig {
    pub interval: Duration,
    pub max_age: Duration,
    pub preserve: GlobSet,
}

pub async fn run_loop(cache_dir: std::path::PathBuf, config: GcConfig) {
    loop {
        // jitter keeps multiple instances off each other's sweep schedule
        let jitter = rand::thread_rng().gen_range(0..=config.interval.as_secs() / 10 + 1);
        tokio::time::sleep(config.interval + Duration::from_secs(jitter)).await;

        let (removed, failed) = sweep(&cache_dir, config.max_age, &config.preserve);
        debug!(removed, failed, dir = %cache_dir.display(), "cache sweep done");
    }
}

/// One sweep: delete files under `cache_dir` whose last access is older
/// than `max_age`, skipping preserve-glob matches. Returns (removed,
/// failed) counts.
pub fn sweep(cache_dir: &Path, max_age: Duration, preserve: &GlobSet) -> (usize, usize) {
    let now = SystemTime::now();
    let mut removed = 0;
    let mut failed = 0;

    for entry in WalkDir::new(cache_dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(cache_dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        if preserve.matches(&relative) {
            continue;
        }

        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let atime = meta
            .accessed()
            .or_else(|_| meta.modified())
            .unwrap_or(now);
        if now.duration_since(atime).unwrap_or_default() < max_age {
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(err) => {
                warn!(path = %entry.path().display(), %err, "sweep failed to remove file");
                failed += 1;
            }
        }
    }

    (removed, failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn age(path: &Path, secs: i64) {
        let stale = chrono::Utc::now() - chrono::Duration::seconds(secs);
        let stamp = stale.format("%Y-%m-%dT%H:%M:%S").to_string();
        std::process::Command::new("touch")
            .args(["-a", "-m", "-d", &stamp, &path.to_string_lossy()])
            .status()
            .expect("touch available");
    }

    #[test]
    fn sweep_removes_old_files_and_keeps_preserved_ones() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("idb")).unwrap();
        let old = dir.path().join("stale.jsonl");
        let keep = dir.path().join("idb/persistent.json");
        let young = dir.path().join("recent.jsonl");
        std::fs::write(&old, b"x").unwrap();
        std::fs::write(&keep, b"x").unwrap();
        std::fs::write(&young, b"x").unwrap();
        age(&old, 8 * 24 * 3600);
        age(&keep, 8 * 24 * 3600);

        let preserve = GlobSet::new(&["idb/**/*".into()]).unwrap();
        let (removed, failed) = sweep(dir.path(), Duration::from_secs(7 * 24 * 3600), &preserve);

        assert_eq!((removed, failed), (1, 0));
        assert!(!old.exists());
        assert!(keep.exists());
        assert!(young.exists());
    }
}
