// Incremental full-text indexing. One work unit per branch, serialized on
// the `indexer` queue so a branch never indexes concurrently with itself;
// each unit advances the scope's `since` watermark only when its
// transaction commits.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use sqlx::Row;
use tracing::{debug, error, info, warn};

use super::schema::SqlDb;
use crate::content::Filesets;
use crate::repo::Manifest;
use crate::tasks::TaskQueues;
use crate::vcs;

const QUEUE: &str = "indexer";

pub struct Indexer {
    sql: SqlDb,
    queues: Arc<TaskQueues>,
}

impl Indexer {
    pub fn new(sql: SqlDb, queues: Arc<TaskQueues>) -> Arc<Self> {
        Arc::new(Self { sql, queues })
    }

    /// Queue a (re)index of one branch. Fire and forget; failures are
    /// logged and the watermark stays put, so the next schedule retries.
    pub fn schedule(self: &Arc<Self>, account: &str, repo: &str, branch: &str, repo_path: &Path) {
        let this = Arc::clone(self);
        let account = account.to_owned();
        let repo = repo.to_owned();
        let branch = branch.to_owned();
        let repo_path = repo_path.to_owned();
        tokio::spawn(async move {
            if let Err(err) = this.index_now(&account, &repo, &branch, &repo_path).await {
                error!(%err, "indexing unit failed");
            }
        });
    }

    /// Run one indexing unit through the serial queue and wait for it.
    pub async fn index_now(
        self: &Arc<Self>,
        account: &str,
        repo: &str,
        branch: &str,
        repo_path: &Path,
    ) -> anyhow::Result<()> {
        let this = Arc::clone(self);
        let account = account.to_owned();
        let repo = repo.to_owned();
        let branch = branch.to_owned();
        let repo_path = repo_path.to_owned();
        self.queues
            .run(QUEUE, async move {
                this.index_unit(&account, &repo, &branch, &repo_path).await
            })
            .await?
    }

    async fn index_unit(
        &self,
        account: &str,
        repo: &str,
        branch: &str,
        repo_path: &Path,
    ) -> anyhow::Result<()> {
        let (scope_id, since) = self.ensure_scope(account, repo, branch).await?;

        let Some(head) = vcs::head_commit(repo_path, branch).await? else {
            debug!(account, repo, branch, "branch gone, nothing to index");
            return Ok(());
        };
        let head_short: String = head.id.chars().take(7).collect();
        if since.as_deref() == Some(head_short.as_str()) {
            debug!(account, repo, branch, "index already at head");
            return Ok(());
        }

        let watermark = match &since {
            Some(s) if vcs::is_valid_commit(repo_path, s).await => Some(s.as_str()),
            _ => None,
        };
        let items = match watermark {
            Some(watermark) => vcs::collect_changes(repo_path, &head.id, watermark).await?,
            None => vcs::collect_tracked(repo_path, &head.id).await?,
        };

        let manifest = Manifest::load(repo_path, branch).await?;
        let filesets = manifest
            .filesets()
            .and_then(|defs| Filesets::from_defs(defs).ok())
            .unwrap_or_else(Filesets::default_set);

        let mut tx = self.sql.begin().await?;
        let mut indexed = 0usize;
        let mut removed = 0usize;

        let result: anyhow::Result<()> = async {
            for (path, active) in &items {
                let Some(fs) = filesets.owner(path) else {
                    continue;
                };
                if !fs.def.searchable {
                    continue;
                }

                if !active {
                    removed += delete_file(&mut tx, scope_id, path).await?;
                    continue;
                }

                let Some(bytes) = vcs::read_file_at_commit(repo_path, &head.id, path).await?
                else {
                    continue;
                };
                let content = String::from_utf8_lossy(&bytes);
                let record = fs
                    .processor()
                    .make_record(repo_path, &head.id, path, fs.category(), &head_short, true)
                    .await?;
                let Some(search) = fs.processor().make_search_record(&record, &content) else {
                    continue;
                };
                upsert_file(&mut tx, scope_id, &search).await?;
                indexed += 1;
            }

            sqlx::query("UPDATE scope SET since = ?, index_date = ? WHERE id = ?")
                .bind(&head_short)
                .bind(Utc::now().to_rfc3339())
                .bind(scope_id)
                .execute(&mut *tx)
                .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit().await?;
                info!(account, repo, branch, indexed, removed, head = %head_short, "index updated");
                Ok(())
            }
            Err(err) => {
                // watermark untouched, the next run redoes this unit
                warn!(account, repo, branch, %err, "index unit rolled back");
                tx.rollback().await?;
                Err(err)
            }
        }
    }

    async fn ensure_scope(
        &self,
        account: &str,
        repo: &str,
        branch: &str,
    ) -> anyhow::Result<(i64, Option<String>)> {
        let row = sqlx::query("SELECT id, since FROM scope WHERE account = ? AND repo = ? AND branch = ?")
            .bind(account)
            .bind(repo)
            .bind(branch)
            .fetch_optional(self.sql.as_ref())
            .await?;

        if let Some(row) = row {
            return Ok((row.get("id"), row.get("since")));
        }

        let inserted =
            sqlx::query("INSERT INTO scope (account, repo, branch, since) VALUES (?, ?, ?, NULL)")
                .bind(account)
                .bind(repo)
                .bind(branch)
                .execute(self.sql.as_ref())
                .await?;
        Ok((inserted.last_insert_rowid(), None))
    }

    /// Short head commit recorded for a scope, if any.
    pub async fn scope_head(
        &self,
        account: &str,
        repo: &str,
        branch: &str,
    ) -> anyhow::Result<Option<String>> {
        let row = sqlx::query("SELECT since FROM scope WHERE account = ? AND repo = ? AND branch = ?")
            .bind(account)
            .bind(repo)
            .bind(branch)
            .fetch_optional(self.sql.as_ref())
            .await?;
        Ok(row.and_then(|r| r.get("since")))
    }
}

async fn upsert_file(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    scope_id: i64,
    search: &crate::content::SearchRecord,
) -> anyhow::Result<()> {
    let existing = sqlx::query("SELECT textid FROM files WHERE id = ? AND scopeid = ?")
        .bind(&search.id)
        .bind(scope_id)
        .fetch_optional(&mut **tx)
        .await?;

    match existing {
        Some(row) => {
            let textid: i64 = row.get("textid");
            sqlx::query("UPDATE text SET content = ? WHERE rowid = ?")
                .bind(&search.content)
                .bind(textid)
                .execute(&mut **tx)
                .await?;
            sqlx::query("UPDATE files SET path = ?, category = ?, title = ? WHERE id = ? AND scopeid = ?")
                .bind(&search.path)
                .bind(&search.category)
                .bind(&search.title)
                .bind(&search.id)
                .bind(scope_id)
                .execute(&mut **tx)
                .await?;
        }
        None => {
            let inserted = sqlx::query("INSERT INTO text (content) VALUES (?)")
                .bind(&search.content)
                .execute(&mut **tx)
                .await?;
            sqlx::query(
                "INSERT INTO files (id, scopeid, path, category, title, textid) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&search.id)
            .bind(scope_id)
            .bind(&search.path)
            .bind(&search.category)
            .bind(&search.title)
            .bind(inserted.last_insert_rowid())
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

async fn delete_file(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    scope_id: i64,
    path: &str,
) -> anyhow::Result<usize> {
    let rows = sqlx::query("SELECT textid FROM files WHERE scopeid = ? AND path = ?")
        .bind(scope_id)
        .bind(path)
        .fetch_all(&mut **tx)
        .await?;
    for row in &rows {
        let textid: i64 = row.get("textid");
        sqlx::query("DELETE FROM text WHERE rowid = ?")
            .bind(textid)
            .execute(&mut **tx)
            .await?;
    }
    sqlx::query("DELETE FROM files WHERE scopeid = ? AND path = ?")
        .bind(scope_id)
        .bind(path)
        .execute(&mut **tx)
        .await?;
    Ok(rows.len())
}

