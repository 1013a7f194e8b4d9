// Git fixtures for integration tests: a scratch work tree whose `.git`
// directory doubles as the content repo the adapter reads.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use locomote::context::Context;
use locomote::filedb::FileDb;
use locomote::pipeline::{transform::Hooks, Runner};
use locomote::repo::ManifestCache;

pub struct Fixture {
    #[allow(dead_code)]
    dir: tempfile::TempDir,
    pub work: PathBuf,
    pub repo_path: PathBuf,
    pub cache: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        git(&work, &["init", "-q"]);
        git(&work, &["symbolic-ref", "HEAD", "refs/heads/master"]);
        git(&work, &["config", "user.email", "test@example.com"]);
        git(&work, &["config", "user.name", "Test"]);
        git(&work, &["config", "commit.gpgsign", "false"]);
        let cache = dir.path().join("cache");
        std::fs::create_dir_all(&cache).unwrap();
        Self {
            repo_path: work.join(".git"),
            work,
            cache,
            dir,
        }
    }

    pub fn write(&self, path: &str, contents: &str) {
        let full = self.work.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, contents).unwrap();
    }

    pub fn remove(&self, path: &str) {
        std::fs::remove_file(self.work.join(path)).unwrap();
    }

    pub fn rename(&self, from: &str, to: &str) {
        std::fs::rename(self.work.join(from), self.work.join(to)).unwrap();
    }

    /// Stage everything and commit; returns the full commit hash.
    pub fn commit(&self, message: &str) -> String {
        git(&self.work, &["add", "-A"]);
        git(&self.work, &["commit", "-q", "-m", message]);
        let output = Command::new("git")
            .current_dir(&self.work)
            .args(["rev-parse", "HEAD"])
            .output()
            .unwrap();
        assert!(output.status.success());
        String::from_utf8(output.stdout).unwrap().trim().to_owned()
    }

    pub fn filedb(&self) -> FileDb {
        FileDb::new(
            Arc::new(Runner::new(self.cache.clone())),
            Arc::new(ManifestCache::new(16)),
            Arc::new(Hooks::new()),
        )
    }

    pub fn ctx(&self) -> Context {
        Context::new(
            "acme",
            "site",
            "master",
            self.repo_path.clone(),
            "/acme/site",
            "localhost",
        )
    }
}

pub fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .current_dir(dir)
        .args(args)
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

pub fn short(commit: &str) -> String {
    commit.chars().take(7).collect()
}

/// Split an artifact's JSONL rows into (file records, control records).
pub async fn read_rows(
    artifact: &locomote::pipeline::Artifact,
) -> (Vec<serde_json::Value>, Vec<serde_json::Value>) {
    let raw = tokio::fs::read_to_string(&artifact.file).await.unwrap();
    let mut records = Vec::new();
    let mut controls = Vec::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        let is_control = value
            .as_object()
            .map(|map| map.keys().any(|k| k.starts_with('$')))
            .unwrap_or(false);
        if is_control {
            controls.push(value);
        } else {
            records.push(value);
        }
    }
    (records, controls)
}
