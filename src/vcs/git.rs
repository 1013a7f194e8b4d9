// Read-only wrappers around the git CLI for bare content repositories.
// Everything runs with `--git-dir` pointing at the bare repo; nothing in
// here ever writes to a repository.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, Context};
use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::process::Command;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct CommitInfo {
    pub id: String,
    pub unix_secs: i64,
    pub committer: String,
    pub subject: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    Added(String),
    Modified(String),
    Deleted(String),
    Renamed { from: String, to: String },
    Copied(String),
    Unmerged(String),
}

fn git(repo_path: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.arg("--git-dir").arg(repo_path);
    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);
    cmd
}

async fn run_capture(mut cmd: Command) -> anyhow::Result<Option<String>> {
    let output = cmd.output().await.context("failed to spawn git")?;
    if !output.status.success() {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
}

/// Head commit of `branch`, or None if the branch does not exist.
pub async fn head_commit(repo_path: &Path, branch: &str) -> anyhow::Result<Option<CommitInfo>> {
    let mut cmd = git(repo_path);
    cmd.args(["log", "-1", "--format=%H%x09%ct%x09%cn%x09%s"])
        .arg(branch)
        .arg("--");
    let Some(out) = run_capture(cmd).await? else {
        return Ok(None);
    };
    Ok(parse_commit_line(out.lines().next().unwrap_or_default()))
}

/// Last commit that touched `path` on `branch`.
pub async fn last_commit_for_file(
    repo_path: &Path,
    branch: &str,
    path: &str,
) -> anyhow::Result<Option<CommitInfo>> {
    let mut cmd = git(repo_path);
    cmd.args(["log", "-1", "--format=%H%x09%ct%x09%cn%x09%s"])
        .arg(branch)
        .arg("--")
        .arg(path);
    let Some(out) = run_capture(cmd).await? else {
        return Ok(None);
    };
    Ok(parse_commit_line(out.lines().next().unwrap_or_default()))
}

pub async fn is_valid_commit(repo_path: &Path, id: &str) -> bool {
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return false;
    }
    let mut cmd = git(repo_path);
    cmd.args(["cat-file", "-e", &format!("{id}^{{commit}}")]);
    matches!(cmd.status().await, Ok(status) if status.success())
}

fn parse_commit_line(line: &str) -> Option<CommitInfo> {
    let mut fields = line.splitn(4, '\t');
    Some(CommitInfo {
        id: fields.next()?.to_owned(),
        unix_secs: fields.next()?.parse().ok()?,
        committer: fields.next()?.to_owned(),
        subject: fields.next().unwrap_or_default().to_owned(),
    })
}

/// Write one tracked path per line at `commit` into `out`.
pub async fn list_tracked_files<W>(
    repo_path: &Path,
    commit: &str,
    out: &mut W,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let mut cmd = git(repo_path);
    cmd.args(["ls-tree", "-r", "--name-only"]).arg(commit);
    pipe_lines_unquoted(cmd, out).await
}

/// Write `<status>\t<path>` rows for `since..commit` into `out`. Renames
/// keep git's `R<score>\t<old>\t<new>` shape here; `parse_change` splits
/// them for consumers.
pub async fn list_changes<W>(
    repo_path: &Path,
    commit: &str,
    since: &str,
    out: &mut W,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let mut cmd = git(repo_path);
    cmd.args(["diff", "--name-status", "--find-renames"])
        .arg(since)
        .arg(commit);
    pipe_lines_unquoted(cmd, out).await
}

async fn pipe_lines_unquoted<W>(mut cmd: Command, out: &mut W) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    use tokio::io::AsyncWriteExt;

    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn().context("failed to spawn git")?;
    let stdout = child.stdout.take().ok_or_else(|| anyhow!("no git stdout"))?;
    let mut lines = BufReader::new(stdout).lines();

    while let Some(line) = lines.next_line().await? {
        let line = unquote_fields(&line);
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await?;
    }

    let status = child.wait().await?;
    if !status.success() {
        return Err(anyhow!("git exited with {status}"));
    }
    Ok(())
}

/// Parse one `--name-status` row into a change; rows that carry a rename
/// score collapse into `Renamed` so callers can report delete + add.
pub fn parse_change(line: &str) -> Option<Change> {
    let mut fields = line.split('\t');
    let status = fields.next()?;
    let first = fields.next()?.to_owned();
    match status.as_bytes().first()? {
        b'A' => Some(Change::Added(first)),
        b'M' | b' ' => Some(Change::Modified(first)),
        b'D' => Some(Change::Deleted(first)),
        b'R' => Some(Change::Renamed {
            from: first,
            to: fields.next()?.to_owned(),
        }),
        b'C' => Some(Change::Copied(fields.next()?.to_owned())),
        b'U' => Some(Change::Unmerged(first)),
        _ => None,
    }
}

/// Pipe the blob at `commit:path` into `out`.
pub async fn pipe_file_at_commit<W>(
    repo_path: &Path,
    commit: &str,
    path: &str,
    out: &mut W,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let mut cmd = git(repo_path);
    cmd.args(["cat-file", "blob", &format!("{commit}:{path}")]);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd.spawn().context("failed to spawn git")?;
    let mut stdout = child.stdout.take().ok_or_else(|| anyhow!("no git stdout"))?;
    tokio::io::copy(&mut stdout, out).await?;

    let status = child.wait().await?;
    if !status.success() {
        return Err(anyhow!("git cat-file {commit}:{path} exited with {status}"));
    }
    Ok(())
}

/// Whole-file read; only for small repo files like manifests.
pub async fn read_file_at_commit(
    repo_path: &Path,
    commit: &str,
    path: &str,
) -> anyhow::Result<Option<Vec<u8>>> {
    let mut cmd = git(repo_path);
    cmd.args(["cat-file", "blob", &format!("{commit}:{path}")]);
    let output = cmd.output().await.context("failed to spawn git")?;
    if !output.status.success() {
        return Ok(None);
    }
    Ok(Some(output.stdout))
}

/// Stream a ZIP archive of `paths` at `commit` into `out`.
pub async fn zip_files_at_commit<W>(
    repo_path: &Path,
    commit: &str,
    paths: &[String],
    out: &mut W,
) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + Send + ?Sized,
{
    let mut cmd = git(repo_path);
    cmd.args(["archive", "--format=zip"]).arg(commit).arg("--");
    for path in paths {
        cmd.arg(path);
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd.spawn().context("failed to spawn git")?;
    let mut stdout = child.stdout.take().ok_or_else(|| anyhow!("no git stdout"))?;
    tokio::io::copy(&mut stdout, out).await?;

    let status = child.wait().await?;
    if !status.success() {
        return Err(anyhow!("git archive exited with {status}"));
    }
    Ok(())
}

/// Recent commits on `branch` as `(short id, subject)` rows, newest first.
pub async fn list_commits(
    repo_path: &Path,
    branch: &str,
    limit: usize,
) -> anyhow::Result<Vec<(String, String)>> {
    let mut cmd = git(repo_path);
    cmd.args(["log", &format!("-{limit}"), "--format=%h%x09%s"])
        .arg(branch)
        .arg("--");
    let Some(out) = run_capture(cmd).await? else {
        return Ok(Vec::new());
    };
    Ok(out
        .lines()
        .filter_map(|line| {
            let (id, subject) = line.split_once('\t')?;
            Some((id.to_owned(), subject.to_owned()))
        })
        .collect())
}

/// One pass over the history reachable from `commit`: which short commit
/// last modified each path (first mention wins walking backwards from the
/// head), plus the info for every commit seen.
#[derive(Debug, Default, Clone)]
pub struct HistoryScan {
    pub last_commit: HashMap<String, String>,
    pub infos: HashMap<String, CommitInfo>,
}

impl HistoryScan {
    pub fn commit_for(&self, path: &str) -> Option<&str> {
        self.last_commit.get(path).map(String::as_str)
    }
}

pub async fn history_scan(repo_path: &Path, commit: &str) -> anyhow::Result<HistoryScan> {
    let mut cmd = git(repo_path);
    cmd.args(["log", "--format=\x01%h%x09%ct%x09%cn%x09%s", "--name-only"])
        .arg(commit);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = cmd.spawn().context("failed to spawn git")?;
    let stdout = child.stdout.take().ok_or_else(|| anyhow!("no git stdout"))?;
    let mut lines = BufReader::new(stdout).lines();

    let mut scan = HistoryScan::default();
    let mut current = String::new();
    while let Some(line) = lines.next_line().await? {
        if let Some(header) = line.strip_prefix('\x01') {
            if let Some(info) = parse_commit_line(header) {
                current = info.id.clone();
                scan.infos.insert(info.id.clone(), info);
            }
        } else if !line.is_empty() {
            scan.last_commit
                .entry(unquote_path(&line))
                .or_insert_with(|| current.clone());
        }
    }

    let status = child.wait().await?;
    if !status.success() {
        return Err(anyhow!("git log exited with {status}"));
    }
    debug!(paths = scan.last_commit.len(), commit, "history scanned");
    Ok(scan)
}

/// `since..commit` as `(path, active)` items: additions and modifications
/// are active, deletions are not, and a rename contributes both halves.
pub async fn collect_changes(
    repo_path: &Path,
    commit: &str,
    since: &str,
) -> anyhow::Result<Vec<(String, bool)>> {
    let (mut writer, reader) = tokio::io::duplex(64 * 1024);
    let repo = repo_path.to_owned();
    let commit = commit.to_owned();
    let since = since.to_owned();
    let differ =
        tokio::spawn(async move { list_changes(&repo, &commit, &since, &mut writer).await });

    let mut items = Vec::new();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_change(&line) {
            Some(Change::Added(p))
            | Some(Change::Modified(p))
            | Some(Change::Copied(p))
            | Some(Change::Unmerged(p)) => items.push((p, true)),
            Some(Change::Deleted(p)) => items.push((p, false)),
            Some(Change::Renamed { from, to }) => {
                items.push((from, false));
                items.push((to, true));
            }
            None => debug!(line, "unparseable diff row"),
        }
    }
    differ.await??;
    Ok(items)
}

/// Every tracked path at `commit`, all active.
pub async fn collect_tracked(repo_path: &Path, commit: &str) -> anyhow::Result<Vec<(String, bool)>> {
    let (mut writer, reader) = tokio::io::duplex(64 * 1024);
    let repo = repo_path.to_owned();
    let commit = commit.to_owned();
    let lister = tokio::spawn(async move { list_tracked_files(&repo, &commit, &mut writer).await });

    let mut items = Vec::new();
    let mut lines = BufReader::new(reader).lines();
    while let Some(path) = lines.next_line().await? {
        items.push((path, true));
    }
    lister.await??;
    Ok(items)
}

/// Undo git's C-style quoting of non-ASCII filenames: `"a\303\251.txt"`
/// comes back as the raw byte sequence.
pub fn unquote_path(path: &str) -> String {
    let quoted = path.strip_prefix('"').and_then(|p| p.strip_suffix('"'));
    let Some(inner) = quoted else {
        return path.to_owned();
    };

    let mut bytes = Vec::with_capacity(inner.len());
    let mut chars = inner.bytes().peekable();
    while let Some(b) = chars.next() {
        if b != b'\\' {
            bytes.push(b);
            continue;
        }
        match chars.next() {
            Some(b'n') => bytes.push(b'\n'),
            Some(b't') => bytes.push(b'\t'),
            Some(b'r') => bytes.push(b'\r'),
            Some(b'\\') => bytes.push(b'\\'),
            Some(b'"') => bytes.push(b'"'),
            Some(d @ b'0'..=b'7') => {
                let mut value = (d - b'0') as u32;
                for _ in 0..2 {
                    match chars.peek() {
                        Some(d @ b'0'..=b'7') => {
                            value = value * 8 + (*d - b'0') as u32;
                            chars.next();
                        }
                        _ => break,
                    }
                }
                bytes.push(value as u8);
            }
            Some(other) => bytes.push(other),
            None => {}
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Unquote every tab-separated field of a status row, leaving the status
/// column untouched.
fn unquote_fields(line: &str) -> String {
    if !line.contains('"') {
        return line.to_owned();
    }
    line.split('\t')
        .map(unquote_path)
        .collect::<Vec<_>>()
        .join("\t")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unquotes_octal_escapes_to_utf8() {
        assert_eq!(unquote_path(r#""caf\303\251.txt""#), "café.txt");
        assert_eq!(unquote_path(r#""tab\there""#), "tab\there");
        assert_eq!(unquote_path("plain.txt"), "plain.txt");
    }

    #[test]
    fn parses_name_status_rows() {
        assert_eq!(parse_change("M\ta.html"), Some(Change::Modified("a.html".into())));
        assert_eq!(parse_change("A\tnew.json"), Some(Change::Added("new.json".into())));
        assert_eq!(parse_change("D\tgone.md"), Some(Change::Deleted("gone.md".into())));
        assert_eq!(
            parse_change("R100\told.json\tnew.json"),
            Some(Change::Renamed {
                from: "old.json".into(),
                to: "new.json".into()
            })
        );
    }

    #[test]
    fn parses_commit_line() {
        let info = parse_commit_line("abc\t1700000000\tAlice\tinitial import").unwrap();
        assert_eq!(info.id, "abc");
        assert_eq!(info.unix_secs, 1_700_000_000);
        assert_eq!(info.committer, "Alice");
        assert_eq!(info.subject, "initial import");
    }

    #[test]
    fn rejects_malformed_commit_ids() {
        // avoids handing arbitrary strings to the cat-file argv
        assert!(!futures::executor::block_on(is_valid_commit(
            Path::new("/nonexistent"),
            "--not-a-hash"
        )));
    }
}
