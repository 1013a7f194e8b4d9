// Search queries: compose an FTS match from the mode, run it against the
// scope, and cache the result rows as a JSON-lines artifact keyed by the
// indexed commit and the query fingerprint. A per-branch quota evicts old
// artifacts by access time, sparing anything written in the last minute.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{debug, warn};

use super::excerpt::{excerpt, EXCERPT_LEN};
use super::schema::SqlDb;
use crate::hash::fingerprint;
use crate::tasks::SingleFlight;

const RESULT_CAP: usize = 1000;
const EVICT_GRACE: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Any,
    All,
    Exact,
}

impl SearchMode {
    pub fn parse(mode: Option<&str>) -> Self {
        match mode {
            Some("all") => Self::All,
            Some("exact") => Self::Exact,
            _ => Self::Any,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::All => "all",
            Self::Exact => "exact",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub path: String,
    pub category: String,
    pub title: String,
    pub excerpt: String,
}

pub struct SearchDb {
    sql: SqlDb,
    cache_dir: PathBuf,
    quota_bytes: u64,
    flights: SingleFlight<PathBuf>,
}

impl SearchDb {
    pub fn new(sql: SqlDb, cache_dir: PathBuf, quota_bytes: u64) -> Self {
        Self {
            sql,
            cache_dir,
            quota_bytes,
            flights: SingleFlight::new(),
        }
    }

    /// Run (or reuse) a query against one branch scope. Returns the JSONL
    /// artifact path and the etag-relevant fingerprint.
    pub async fn query(
        &self,
        account: &str,
        repo: &str,
        branch: &str,
        term: &str,
        mode: SearchMode,
        path: Option<&str>,
    ) -> anyhow::Result<(PathBuf, String)> {
        let term = term.to_lowercase();
        let print = fingerprint(format!(
            "{}|{}|{}",
            term,
            mode.as_str(),
            path.unwrap_or("")
        ));

        let commit = self
            .scope_commit(account, repo, branch)
            .await?
            .unwrap_or_else(|| "00000000".to_owned());

        let branch_dir = self.cache_dir.join(account).join(repo).join(branch);
        let artifact = branch_dir.join(format!("{commit}-{print}.json"));

        let produced = self
            .flights
            .run(&artifact.to_string_lossy(), async {
                if tokio::fs::try_exists(&artifact).await? {
                    return Ok(artifact.clone());
                }
                tokio::fs::create_dir_all(&branch_dir).await?;

                let rows = self
                    .run_query(account, repo, branch, &term, mode, path)
                    .await?;

                let tmp = artifact.with_extension("json.part");
                let mut out = Vec::new();
                for hit in &rows {
                    out.extend_from_slice(&serde_json::to_vec(hit)?);
                    out.push(b'\n');
                }
                tokio::fs::write(&tmp, out).await?;
                tokio::fs::rename(&tmp, &artifact).await?;

                enforce_quota(&branch_dir, self.quota_bytes).await;
                Ok(artifact.clone())
            })
            .await
            .map_err(|err| anyhow::anyhow!(err))?;

        Ok((produced, print))
    }

    async fn run_query(
        &self,
        account: &str,
        repo: &str,
        branch: &str,
        term: &str,
        mode: SearchMode,
        path: Option<&str>,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let terms: Vec<String> = term.split_whitespace().map(str::to_owned).collect();
        let Some(match_expr) = compose_match(&terms, mode) else {
            return Ok(Vec::new());
        };

        let mut sql = String::from(
            "SELECT files.id, files.path, files.category, files.title, text.content \
             FROM files \
             JOIN text ON text.rowid = files.textid \
             JOIN scope ON scope.id = files.scopeid \
             WHERE scope.account = ? AND scope.repo = ? AND scope.branch = ? \
               AND text MATCH ?",
        );
        if path.is_some() {
            sql.push_str(" AND files.path LIKE ?");
        }
        sql.push_str(" LIMIT ?");

        let mut query = sqlx::query(&sql)
            .bind(account)
            .bind(repo)
            .bind(branch)
            .bind(&match_expr);
        if let Some(path) = path {
            query = query.bind(format!("{path}%"));
        }
        query = query.bind(RESULT_CAP as i64);

        let rows = query.fetch_all(self.sql.as_ref()).await?;
        debug!(account, repo, branch, term, rows = rows.len(), "search executed");

        Ok(rows
            .into_iter()
            .map(|row| {
                let content: String = row.get("content");
                SearchHit {
                    id: row.get("id"),
                    path: row.get("path"),
                    category: row.get("category"),
                    title: row.get("title"),
                    excerpt: excerpt(&content, &terms, EXCERPT_LEN),
                }
            })
            .collect())
    }

    async fn scope_commit(
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

/// FTS match expression for the mode: terms OR-ed, AND-ed, or the whole
/// phrase quoted.
fn compose_match(terms: &[String], mode: SearchMode) -> Option<String> {
    if terms.is_empty() {
        return None;
    }
    let quoted: Vec<String> = terms
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect();
    Some(match mode {
        SearchMode::Any => quoted.join(" OR "),
        SearchMode::All => quoted.join(" AND "),
        SearchMode::Exact => format!("\"{}\"", terms.join(" ").replace('"', "")),
    })
}

/// LRU-by-atime eviction over one branch's result cache; files touched in
/// the last minute are never evicted, even over quota.
async fn enforce_quota(branch_dir: &Path, quota_bytes: u64) {
    let Ok(read) = std::fs::read_dir(branch_dir) else {
        return;
    };

    let now = SystemTime::now();
    let mut files: Vec<(PathBuf, u64, SystemTime, SystemTime)> = read
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            let atime = meta.accessed().or_else(|_| meta.modified()).ok()?;
            let mtime = meta.modified().ok()?;
            Some((entry.path(), meta.len(), atime, mtime))
        })
        .collect();

    let mut total: u64 = files.iter().map(|(_, len, _, _)| len).sum();
    if total <= quota_bytes {
        return;
    }

    // oldest access first
    files.sort_by_key(|(_, _, atime, _)| *atime);
    for (path, len, _, mtime) in files {
        if total <= quota_bytes {
            break;
        }
        let age = now.duration_since(mtime).unwrap_or_default();
        if age < EVICT_GRACE {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => total = total.saturating_sub(len),
            Err(err) => warn!(path = %path.display(), %err, "failed to evict search artifact"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_expression_follows_mode() {
        let terms = vec!["hot".to_owned(), "cold".to_owned()];
        assert_eq!(
            compose_match(&terms, SearchMode::Any).unwrap(),
            "\"hot\" OR \"cold\""
        );
        assert_eq!(
            compose_match(&terms, SearchMode::All).unwrap(),
            "\"hot\" AND \"cold\""
        );
        assert_eq!(
            compose_match(&terms, SearchMode::Exact).unwrap(),
            "\"hot cold\""
        );
        assert!(compose_match(&[], SearchMode::Any).is_none());
    }

    #[test]
    fn match_expression_strips_quotes() {
        let terms = vec!["a\"b".to_owned()];
        assert_eq!(compose_match(&terms, SearchMode::Any).unwrap(), "\"ab\"");
    }

    #[tokio::test]
    async fn quota_evicts_oldest_but_spares_recent_files() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.json");
        let fresh = dir.path().join("fresh.json");
        std::fs::write(&old, vec![0u8; 600]).unwrap();
        std::fs::write(&fresh, vec![0u8; 600]).unwrap();

        // age the old file's timestamps past the grace period; `touch`
        // keeps the test free of extra dev-dependencies
        let stale = chrono::Utc::now() - chrono::Duration::seconds(120);
        let stamp = stale.format("%Y-%m-%dT%H:%M:%S").to_string();
        std::process::Command::new("touch")
            .args(["-a", "-m", "-d", &stamp, &old.to_string_lossy()])
            .status()
            .expect("touch available");

        enforce_quota(dir.path(), 1000).await;

        assert!(!old.exists(), "old artifact should be evicted");
        assert!(fresh.exists(), "recent artifact survives even over quota");
    }
}
