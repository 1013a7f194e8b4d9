// External build workflow. Build requests serialize on the `builder`
// queue; a request is skipped when the branch head already matches the
// recorded build, and a completed build fans out the repo-update event
// that flushes every per-branch cache.

pub mod hook;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use chrono::Utc;
use sqlx::Row;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::application::events::{Event, RepoUpdate, UpdateBus};
use crate::repo::{BranchDb, BuildProfile, ManifestCache};
use crate::search::SqlDb;
use crate::tasks::TaskQueues;
use crate::vcs;

const QUEUE: &str = "builder";

pub struct Builder {
    sql: SqlDb,
    queues: Arc<TaskQueues>,
    branch_db: Arc<BranchDb>,
    manifests: Arc<ManifestCache>,
    profiles: HashMap<String, BuildProfile>,
    workspace_home: PathBuf,
    build_command: Option<String>,
    bus: Arc<UpdateBus>,
}

impl Builder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sql: SqlDb,
        queues: Arc<TaskQueues>,
        branch_db: Arc<BranchDb>,
        manifests: Arc<ManifestCache>,
        profiles: HashMap<String, BuildProfile>,
        workspace_home: PathBuf,
        build_command: Option<String>,
        bus: Arc<UpdateBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sql,
            queues,
            branch_db,
            manifests,
            profiles,
            workspace_home,
            build_command,
            bus,
        })
    }

    /// Queue a build for one branch; requests serialize in arrival order.
    pub fn request(self: &Arc<Self>, account: &str, repo: &str, branch: &str) {
        let this = Arc::clone(self);
        let queues = Arc::clone(&self.queues);
        let account = account.to_owned();
        let repo = repo.to_owned();
        let branch = branch.to_owned();
        tokio::spawn(async move {
            let outcome = queues
                .run(QUEUE, async move {
                    this.run_build(&account, &repo, &branch).await
                })
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%err, "build failed"),
                Err(err) => warn!(%err, "build request dropped"),
            }
        });
    }

    async fn run_build(&self, account: &str, repo: &str, branch: &str) -> anyhow::Result<()> {
        self.branch_db.update_branch_info(account, repo).await?;
        let Some(entry) = self.branch_db.get(account, repo) else {
            debug!(account, repo, "unknown repo, ignoring build request");
            return Ok(());
        };

        let Some(command) = &self.build_command else {
            debug!("builds disabled, no build command configured");
            return Ok(());
        };

        let Some(head) = vcs::head_commit(&entry.repo_path, branch).await? else {
            debug!(account, repo, branch, "branch does not exist, skipping build");
            return Ok(());
        };
        let head_short: String = head.id.chars().take(7).collect();

        if self.last_build(account, repo, branch).await? == Some(head_short.clone()) {
            debug!(account, repo, branch, "already built at head");
            return Ok(());
        }

        let manifest = self.manifests.get(&entry.repo_path, branch).await?;
        let Some(profile) = manifest.build_profile(&self.profiles) else {
            debug!(account, repo, branch, "no build profile, skipping");
            return Ok(());
        };
        if !profile.buildable.iter().any(|b| b == branch) {
            debug!(account, repo, branch, "branch not buildable under profile");
            return Ok(());
        }

        let workspace = self.workspace_home.join(account);
        tokio::fs::create_dir_all(&workspace).await?;

        self.invoke(command, &entry.repo_path, &workspace, account, repo, branch)
            .await?;

        self.add_build_completion(account, repo, branch, &head_short)
            .await?;
        info!(account, repo, branch, commit = %head_short, "build completed");

        let update = RepoUpdate::new(account, repo, branch);
        self.bus.emit(Event::ContentBuild(update.clone()));
        self.bus.emit(Event::ContentRepoUpdate(update));
        Ok(())
    }

    async fn invoke(
        &self,
        command: &str,
        repo_path: &std::path::Path,
        workspace: &std::path::Path,
        account: &str,
        repo: &str,
        branch: &str,
    ) -> anyhow::Result<()> {
        let mut child = tokio::process::Command::new(command)
            .arg(repo_path)
            .arg(branch)
            .env("LOCOMOTE_ACCOUNT", account)
            .env("LOCOMOTE_REPO", repo)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // stdout then stderr into build.log, tool output order within each
        // stream preserved
        let mut log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(workspace.join("build.log"))
            .await?;
        log.write_all(
            format!("==> {} {repo}/{branch} at {}\n", command, Utc::now().to_rfc3339()).as_bytes(),
        )
        .await?;

        if let Some(mut stdout) = child.stdout.take() {
            tokio::io::copy(&mut stdout, &mut log).await?;
        }
        if let Some(mut stderr) = child.stderr.take() {
            tokio::io::copy(&mut stderr, &mut log).await?;
        }
        log.flush().await?;

        let status = child.wait().await?;
        anyhow::ensure!(status.success(), "build tool exited with {status}");
        Ok(())
    }

    async fn last_build(
        &self,
        account: &str,
        repo: &str,
        branch: &str,
    ) -> anyhow::Result<Option<String>> {
        let row = sqlx::query(
            "SELECT commit_hash FROM builds WHERE account = ? AND repo = ? AND branch = ?",
        )
        .bind(account)
        .bind(repo)
        .bind(branch)
        .fetch_optional(self.sql.as_ref())
        .await?;
        Ok(row.map(|r| r.get("commit_hash")))
    }

    async fn add_build_completion(
        &self,
        account: &str,
        repo: &str,
        branch: &str,
        commit: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO builds (account, repo, branch, commit_hash, built_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(account, repo, branch) DO UPDATE SET commit_hash = ?, built_at = ?",
        )
        .bind(account)
        .bind(repo)
        .bind(branch)
        .bind(commit)
        .bind(Utc::now().to_rfc3339())
        .bind(commit)
        .bind(Utc::now().to_rfc3339())
        .execute(self.sql.as_ref())
        .await?;
        Ok(())
    }

    /// Crash recovery: queue every buildable branch whose head moved past
    /// its recorded build.
    pub async fn startup_scan(self: &Arc<Self>) -> anyhow::Result<()> {
        for (entry, branch) in self.branch_db.list_buildable() {
            let Some(head) = vcs::head_commit(&entry.repo_path, &branch).await? else {
                continue;
            };
            let head_short: String = head.id.chars().take(7).collect();
            if self.last_build(&entry.account, &entry.repo, &branch).await? != Some(head_short) {
                debug!(account = %entry.account, repo = %entry.repo, branch, "stale at startup, queueing build");
                self.request(&entry.account, &entry.repo, &branch);
            }
        }
        Ok(())
    }
}
