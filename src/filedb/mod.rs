// The file database: composed pipelines over the git adapter that produce
// cacheable artifacts (full snapshots, since-deltas, fileset archives,
// single records, file contents), each stamped with the commit and ACM
// group that determine its bytes.

pub mod fileinfo;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::content::{FileRecord, Filesets, Status};
use crate::context::Context;
use crate::hash::fingerprint;
use crate::pipeline::transform::{jsonl_each, write_jsonl, Hooks, Position};
use crate::pipeline::{Artifact, Runner, StepSink, Vars};
use crate::repo::{Manifest, ManifestCache};
use crate::tasks::{CachingSingleFlight, WorkerPool};
use crate::vcs::{self, HistoryScan};

pub use fileinfo::{FileInfoCache, FileInfoDb};

const HOOK_NS: &str = "filedb";
const POOL_SIZE: usize = 100;

const RECORDS_TPL: &str = "internal/{ctx.account}/{ctx.repo}/records-{commit}.jsonl";
const RESULTS_TPL: &str = "internal/{ctx.account}/{ctx.repo}/results-{commit}-{auth.group}.jsonl";
const UPDATES_TPL: &str =
    "internal/{ctx.account}/{ctx.repo}/updates-{since}-{commit}-{valid}-{auth.group}.jsonl";
const FILESET_TPL: &str =
    "internal/{ctx.account}/{ctx.repo}/fileset-{category}-{commit}-{auth.group}.jsonl";
const FILESET_SINCE_TPL: &str =
    "internal/{ctx.account}/{ctx.repo}/fileset-{category}-{commit}-{since}-{auth.group}.jsonl";
const ZIP_TPL: &str =
    "internal/{ctx.account}/{ctx.repo}/zips/{commit}-{category}-group-{auth.group}.zip";
const ZIP_SINCE_TPL: &str =
    "internal/{ctx.account}/{ctx.repo}/zips/{commit}-{category}-{since}-group-{auth.group}.zip";
const RECORD_TPL: &str =
    "internal/{ctx.account}/{ctx.repo}/records/{commitPath}-{pathHash}-{auth.group}.json";
const CONTENTS_TPL: &str = "external/{hostname}{basePath}/{commitPath}/{pathHash}-{auth.group}";

pub struct FileDb {
    runner: Arc<Runner>,
    manifests: Arc<ManifestCache>,
    hooks: Arc<Hooks>,
    pub fileinfo: FileInfoCache,
    fileset_lists: CachingSingleFlight<Arc<Filesets>>,
    list_pool: WorkerPool,
    since_pool: WorkerPool,
    fileset_pool: WorkerPool,
    record_pool: WorkerPool,
    contents_pool: WorkerPool,
}

impl FileDb {
    pub fn new(runner: Arc<Runner>, manifests: Arc<ManifestCache>, hooks: Arc<Hooks>) -> Self {
        Self {
            runner,
            manifests,
            hooks,
            fileinfo: FileInfoCache::new(64),
            fileset_lists: CachingSingleFlight::new(64),
            list_pool: WorkerPool::new(POOL_SIZE),
            since_pool: WorkerPool::new(POOL_SIZE),
            fileset_pool: WorkerPool::new(POOL_SIZE),
            record_pool: WorkerPool::new(POOL_SIZE),
            contents_pool: WorkerPool::new(POOL_SIZE),
        }
    }

    pub fn invalidate(&self, key: &str) {
        self.fileinfo.invalidate(key);
        self.fileset_lists.remove(key);
    }

    /// The branch's materialized fileset list, cached per
    /// `account/repo/branch`.
    pub async fn filesets(&self, ctx: &Context) -> anyhow::Result<Arc<Filesets>> {
        let manifests = Arc::clone(&self.manifests);
        let repo_path = ctx.repo_path.clone();
        let branch = ctx.branch.clone();
        self.fileset_lists
            .run(&ctx.key, async move {
                let manifest = manifests.get(&repo_path, &branch).await?;
                Ok(filesets_of(&manifest))
            })
            .await
            .map_err(|err| anyhow::anyhow!(err))
    }

    pub async fn file_info(&self, ctx: &Context) -> anyhow::Result<Option<Arc<FileInfoDb>>> {
        let filesets = self.filesets(ctx).await?;
        self.fileinfo
            .get(&ctx.key, &ctx.repo_path, &ctx.branch, filesets)
            .await
    }

    pub async fn exists(&self, ctx: &Context, path: &str) -> anyhow::Result<bool> {
        Ok(self.file_info(ctx).await?.is_some_and(|db| db.exists(path)))
    }

    /// Full manifest of the branch at `commit` (default: head), one JSON
    /// record per tracked file plus trailing control records.
    pub async fn list_all_files(
        &self,
        ctx: &Context,
        commit: Option<&str>,
    ) -> anyhow::Result<Option<Artifact>> {
        self.list_pool.run(self.list_all_inner(ctx, commit)).await
    }

    async fn list_all_inner(
        &self,
        ctx: &Context,
        commit: Option<&str>,
    ) -> anyhow::Result<Option<Artifact>> {
        let Some((full, head)) = self.resolve_commit(ctx, commit).await? else {
            return Ok(None);
        };

        let mut vars = Vars::for_ctx(ctx);
        vars.set("commit", head.as_str());
        let records_path = self.runner.path_for(RECORDS_TPL, &vars)?;
        let results_path = self.runner.path_for(RESULTS_TPL, &vars)?;

        let group = ctx.group().to_owned();
        self.runner
            .coalesce(&results_path, async {
                let filesets = self.filesets(ctx).await?;
                let scan = vcs::history_scan(&ctx.repo_path, &full).await?;

                self.runner
                    .materialize(&records_path, |w| {
                        produce_records(ctx, &full, &head, &filesets, &scan, w)
                    })
                    .await?;

                self.runner
                    .materialize(&results_path, |w| {
                        process_listing(ctx, &self.hooks, &vars, &scan, &records_path, &head, w)
                    })
                    .await?;

                Ok(Some(Artifact::new(results_path.clone(), head.clone(), group)))
            })
            .await
            .map_err(|err| anyhow::anyhow!(err))
    }

    /// Delta manifest since `since`. An unknown `since` falls back to the
    /// full listing with a leading reset control record.
    pub async fn list_updates_since(
        &self,
        ctx: &Context,
        since: &str,
        commit: Option<&str>,
    ) -> anyhow::Result<Option<Artifact>> {
        anyhow::ensure!(!since.is_empty(), "list_updates_since requires `since`");
        self.since_pool
            .run(self.list_updates_inner(ctx, since, commit))
            .await
    }

    async fn list_updates_inner(
        &self,
        ctx: &Context,
        since: &str,
        commit: Option<&str>,
    ) -> anyhow::Result<Option<Artifact>> {
        let Some((full, head)) = self.resolve_commit(ctx, commit).await? else {
            return Ok(None);
        };
        let valid = vcs::is_valid_commit(&ctx.repo_path, since).await;

        let mut vars = Vars::for_ctx(ctx);
        vars.set("commit", head.as_str());
        vars.set("since", since);
        vars.set("valid", if valid { "V" } else { "I" });
        let results_path = self.runner.path_for(UPDATES_TPL, &vars)?;

        let group = ctx.group().to_owned();
        self.runner
            .coalesce(&results_path, async {
                let filesets = self.filesets(ctx).await?;
                // fileset ownership on the `since` side decides synthetic
                // deletions when the current list disowns a path
                let previous = if valid {
                    Some(filesets_of(&Manifest::load(&ctx.repo_path, since).await?))
                } else {
                    None
                };
                let scan = vcs::history_scan(&ctx.repo_path, &full).await?;

                let items = if valid {
                    vcs::collect_changes(&ctx.repo_path, &full, since).await?
                } else {
                    vcs::collect_tracked(&ctx.repo_path, &full).await?
                };

                self.runner
                    .materialize(&results_path, |w| {
                        process_updates(
                            ctx,
                            &self.hooks,
                            &vars,
                            &scan,
                            &filesets,
                            previous.as_deref(),
                            &items,
                            &full,
                            &head,
                            !valid,
                            w,
                        )
                    })
                    .await?;

                Ok(Some(Artifact::new(results_path.clone(), head.clone(), group)))
            })
            .await
            .map_err(|err| anyhow::anyhow!(err))
    }

    /// The subset of the listing (or delta) belonging to one fileset.
    pub async fn list_fileset_files(
        &self,
        ctx: &Context,
        category: &str,
        since: Option<&str>,
    ) -> anyhow::Result<Option<Artifact>> {
        anyhow::ensure!(!category.is_empty(), "fileset operations require `category`");
        self.fileset_pool
            .run(self.list_fileset_inner(ctx, category, since))
            .await
    }

    async fn list_fileset_inner(
        &self,
        ctx: &Context,
        category: &str,
        since: Option<&str>,
    ) -> anyhow::Result<Option<Artifact>> {
        let upstream = match since {
            Some(since) => self.list_updates_since(ctx, since, None).await?,
            None => self.list_all_files(ctx, None).await?,
        };
        let Some(upstream) = upstream else {
            return Ok(None);
        };

        let mut vars = Vars::for_ctx(ctx);
        vars.set("commit", upstream.commit.as_str());
        vars.set("category", category);
        if let Some(since) = since {
            vars.set("since", since);
        }
        let tpl = if since.is_some() {
            FILESET_SINCE_TPL
        } else {
            FILESET_TPL
        };
        let listing_path = self.runner.path_for(tpl, &vars)?;

        self.runner
            .coalesce(&listing_path, async {
                self.runner
                    .materialize(&listing_path, |w| {
                        reduce_to_category(&upstream.file, category, w)
                    })
                    .await?;
                Ok(Some(Artifact::new(
                    listing_path.clone(),
                    upstream.commit.clone(),
                    upstream.group.clone(),
                )))
            })
            .await
            .map_err(|err| anyhow::anyhow!(err))
    }

    /// ZIP archive of a fileset's published files at the current commit,
    /// optionally restricted to changes since `since`.
    pub async fn get_fileset_contents(
        &self,
        ctx: &Context,
        category: &str,
        since: Option<&str>,
    ) -> anyhow::Result<Option<Artifact>> {
        anyhow::ensure!(!category.is_empty(), "fileset operations require `category`");
        self.fileset_pool
            .run(self.fileset_contents_inner(ctx, category, since))
            .await
    }

    async fn fileset_contents_inner(
        &self,
        ctx: &Context,
        category: &str,
        since: Option<&str>,
    ) -> anyhow::Result<Option<Artifact>> {
        // straight to the inner listing op, the pool permit is already held
        let Some(listing) = self.list_fileset_inner(ctx, category, since).await? else {
            return Ok(None);
        };

        let mut vars = Vars::for_ctx(ctx);
        vars.set("commit", listing.commit.as_str());
        vars.set("category", category);
        if let Some(since) = since {
            vars.set("since", since);
        }
        let tpl = if since.is_some() { ZIP_SINCE_TPL } else { ZIP_TPL };
        let zip_path = self.runner.path_for(tpl, &vars)?;

        self.runner
            .coalesce(&zip_path, async {
                let reader = BufReader::new(listing.open().await?);
                let mut paths = Vec::new();
                jsonl_each(reader, |record| {
                    if record.get("status").and_then(Value::as_str) == Some("published") {
                        if let Some(path) = record.get("path").and_then(Value::as_str) {
                            paths.push(path.to_owned());
                        }
                    }
                    Ok(())
                })
                .await?;

                self.runner
                    .materialize(&zip_path, |w| {
                        archive_paths(&ctx.repo_path, &listing.commit, &paths, w)
                    })
                    .await?;

                let mut artifact = Artifact::new(
                    zip_path.clone(),
                    listing.commit.clone(),
                    listing.group.clone(),
                );
                artifact.mime_type = Some("application/zip".to_owned());
                Ok(Some(artifact))
            })
            .await
            .map_err(|err| anyhow::anyhow!(err))
    }

    /// The JSON record of one file, or None when the path is untracked,
    /// unowned or not visible to this request.
    pub async fn get_file_record(
        &self,
        ctx: &Context,
        path: &str,
    ) -> anyhow::Result<Option<Artifact>> {
        self.record_pool.run(self.file_record_inner(ctx, path)).await
    }

    async fn file_record_inner(
        &self,
        ctx: &Context,
        path: &str,
    ) -> anyhow::Result<Option<Artifact>> {
        let Some(info) = self.file_info(ctx).await? else {
            return Ok(None);
        };
        let Some(file) = info.get(path).cloned() else {
            return Ok(None);
        };

        let mut vars = Vars::for_ctx(ctx);
        vars.set("commit", file.commit.as_str());
        vars.set("commitPath", commit_path(&file.commit));
        vars.set("pathHash", fingerprint(path));
        let record_path = self.runner.path_for(RECORD_TPL, &vars)?;

        let group = ctx.group().to_owned();
        self.runner
            .coalesce(&record_path, async {
                let filesets = self.filesets(ctx).await?;
                let Some(fs) = filesets.owner(path) else {
                    return Ok(None);
                };
                let record = fs
                    .processor()
                    .make_record(
                        &ctx.repo_path,
                        &file.commit,
                        path,
                        fs.category(),
                        &file.commit,
                        true,
                    )
                    .await?
                    .to_value();
                let Some(record) = gate(ctx, &self.hooks, &vars, record) else {
                    return Ok(None);
                };

                self.runner
                    .materialize(&record_path, |w| write_record(&record, w))
                    .await?;

                let mut artifact =
                    Artifact::new(record_path.clone(), file.commit.clone(), group.clone());
                artifact.mime_type = Some("application/json".to_owned());
                Ok(Some(artifact))
            })
            .await
            .map_err(|err| anyhow::anyhow!(err))
    }

    /// File contents through the owning fileset's processor, cached under
    /// the external tree.
    pub async fn get_file_contents(
        &self,
        ctx: &Context,
        path: &str,
    ) -> anyhow::Result<Option<Artifact>> {
        self.contents_pool
            .run(self.file_contents_inner(ctx, path))
            .await
    }

    async fn file_contents_inner(
        &self,
        ctx: &Context,
        path: &str,
    ) -> anyhow::Result<Option<Artifact>> {
        let Some(info) = self.file_info(ctx).await? else {
            return Ok(None);
        };
        let Some(file) = info.get(path).cloned() else {
            return Ok(None);
        };

        let mut vars = Vars::for_ctx(ctx);
        vars.set("commit", file.commit.as_str());
        vars.set("commitPath", commit_path(&file.commit));
        vars.set("pathHash", fingerprint(path));
        let contents_path = self.runner.path_for(CONTENTS_TPL, &vars)?;

        let group = ctx.group().to_owned();
        self.runner
            .coalesce(&contents_path, async {
                let filesets = self.filesets(ctx).await?;
                let Some(fs) = filesets.owner(path) else {
                    return Ok(None);
                };
                // visibility gate on the bare record before any bytes move
                let probe = FileRecord {
                    path: path.to_owned(),
                    category: fs.category().to_owned(),
                    status: Status::Published,
                    commit: file.commit.clone(),
                    page: None,
                    data: None,
                };
                if gate(ctx, &self.hooks, &vars, probe.to_value()).is_none() {
                    return Ok(None);
                }

                self.runner
                    .materialize(&contents_path, |w| {
                        pipe_through(fs, ctx, &file.commit, path, w)
                    })
                    .await?;

                let mut artifact =
                    Artifact::new(contents_path.clone(), file.commit.clone(), group.clone());
                artifact.mime_type = mime_guess::from_path(path)
                    .first()
                    .map(|m| m.essence_str().to_owned());
                artifact.cache_control = file.cache_control.clone();
                Ok(Some(artifact))
            })
            .await
            .map_err(|err| anyhow::anyhow!(err))
    }

    async fn resolve_commit(
        &self,
        ctx: &Context,
        commit: Option<&str>,
    ) -> anyhow::Result<Option<(String, String)>> {
        match commit {
            Some(id) => {
                if !vcs::is_valid_commit(&ctx.repo_path, id).await {
                    return Ok(None);
                }
                Ok(Some((id.to_owned(), short(id))))
            }
            None => Ok(vcs::head_commit(&ctx.repo_path, &ctx.branch)
                .await?
                .map(|info| (info.id.clone(), short(&info.id)))),
        }
    }
}

fn filesets_of(manifest: &Manifest) -> Arc<Filesets> {
    Arc::new(
        manifest
            .filesets()
            .and_then(|defs| Filesets::from_defs(defs).ok())
            .unwrap_or_else(Filesets::default_set),
    )
}

fn short(id: &str) -> String {
    id.chars().take(7).collect()
}

/// `ab/cd123` cache sharding of a short commit hash.
fn commit_path(commit: &str) -> String {
    if commit.len() > 2 {
        format!("{}/{}", &commit[..2], &commit[2..])
    } else {
        commit.to_owned()
    }
}

/// Record-stream gate shared by every listing op: pre hooks, ACM filter
/// and rewrite, post hooks.
fn gate(ctx: &Context, hooks: &Hooks, vars: &Vars, record: Value) -> Option<Value> {
    let record = hooks.apply(HOOK_NS, Position::Pre, record, vars)?;
    let record = match &ctx.auth {
        Some(auth) => auth.filter_and_rewrite(record)?,
        None => record,
    };
    hooks.apply(HOOK_NS, Position::Post, record, vars)
}

async fn produce_records(
    ctx: &Context,
    full: &str,
    head: &str,
    filesets: &Filesets,
    scan: &HistoryScan,
    mut w: StepSink,
) -> anyhow::Result<StepSink> {
    let (mut writer, reader) = tokio::io::duplex(64 * 1024);
    let repo = ctx.repo_path.clone();
    let commit = full.to_owned();
    let lister =
        tokio::spawn(async move { vcs::list_tracked_files(&repo, &commit, &mut writer).await });

    let mut lines = BufReader::new(reader).lines();
    while let Some(path) = lines.next_line().await? {
        let Some(fs) = filesets.owner(&path) else {
            continue;
        };
        let record_commit = scan.commit_for(&path).unwrap_or(head);
        let record = fs
            .processor()
            .make_record(&ctx.repo_path, full, &path, fs.category(), record_commit, true)
            .await?;
        write_jsonl(&mut w, &record.to_value()).await?;
    }
    lister.await??;
    Ok(w)
}

async fn process_listing(
    ctx: &Context,
    hooks: &Hooks,
    vars: &Vars,
    scan: &HistoryScan,
    records_path: &Path,
    head: &str,
    mut w: StepSink,
) -> anyhow::Result<StepSink> {
    let reader = BufReader::new(tokio::fs::File::open(records_path).await?);
    let mut acc = Accumulator::new(scan);
    jsonl_each(reader, |record| {
        if let Some(record) = gate(ctx, hooks, vars, record) {
            acc.push(record);
        }
        Ok(())
    })
    .await?;
    acc.write_all(&mut w, ctx.group(), head, false).await?;
    Ok(w)
}

#[allow(clippy::too_many_arguments)]
async fn process_updates(
    ctx: &Context,
    hooks: &Hooks,
    vars: &Vars,
    scan: &HistoryScan,
    filesets: &Filesets,
    previous: Option<&Filesets>,
    items: &[(String, bool)],
    full: &str,
    head: &str,
    reset: bool,
    mut w: StepSink,
) -> anyhow::Result<StepSink> {
    let mut acc = Accumulator::new(scan);
    for (path, active) in items {
        let record = match filesets.owner(path) {
            Some(fs) => {
                let record_commit = scan.commit_for(path).unwrap_or(head);
                fs.processor()
                    .make_record(
                        &ctx.repo_path,
                        full,
                        path,
                        fs.category(),
                        record_commit,
                        *active,
                    )
                    .await?
                    .to_value()
            }
            // the current fileset list no longer owns this path; if the
            // since-side list did, tell the client to prune
            None => match previous.and_then(|p| p.owner(path)) {
                Some(fs) => {
                    let record_commit = scan.commit_for(path).unwrap_or(head);
                    FileRecord::deleted(path, fs.category(), record_commit).to_value()
                }
                None => continue,
            },
        };
        if let Some(record) = gate(ctx, hooks, vars, record) {
            acc.push(record);
        }
    }
    acc.write_all(&mut w, ctx.group(), head, reset).await?;
    Ok(w)
}

async fn reduce_to_category(
    upstream: &Path,
    category: &str,
    mut w: StepSink,
) -> anyhow::Result<StepSink> {
    let reader = BufReader::new(tokio::fs::File::open(upstream).await?);
    let mut keep = Vec::new();
    jsonl_each(reader, |record| {
        if record.get("category").and_then(Value::as_str) == Some(category) {
            keep.push(record);
        }
        Ok(())
    })
    .await?;
    for record in &keep {
        write_jsonl(&mut w, record).await?;
    }
    Ok(w)
}

async fn archive_paths(
    repo_path: &Path,
    commit: &str,
    paths: &[String],
    mut w: StepSink,
) -> anyhow::Result<StepSink> {
    vcs::zip_files_at_commit(repo_path, commit, paths, &mut w).await?;
    Ok(w)
}

async fn write_record(record: &Value, mut w: StepSink) -> anyhow::Result<StepSink> {
    write_jsonl(&mut w, record).await?;
    Ok(w)
}

async fn pipe_through(
    fs: &crate::content::Fileset,
    ctx: &Context,
    commit: &str,
    path: &str,
    mut w: StepSink,
) -> anyhow::Result<StepSink> {
    fs.processor()
        .pipe_contents(&ctx.repo_path, commit, path, &ctx.base_path, &mut w)
        .await?;
    Ok(w)
}

/// Collects visible records and emits them with the trailing control
/// records: one `$category` per category, one `$commit` per distinct
/// commit, the `$acm` group and the `$latest` branch head. A reset control
/// record leads when the client's `since` was unusable.
struct Accumulator<'a> {
    scan: &'a HistoryScan,
    records: Vec<Value>,
    categories: BTreeMap<String, (i64, String)>,
    commits: BTreeSet<String>,
}

impl<'a> Accumulator<'a> {
    fn new(scan: &'a HistoryScan) -> Self {
        Self {
            scan,
            records: Vec::new(),
            categories: BTreeMap::new(),
            commits: BTreeSet::new(),
        }
    }

    fn push(&mut self, record: Value) {
        if let (Some(category), Some(commit)) = (
            record.get("category").and_then(Value::as_str),
            record.get("commit").and_then(Value::as_str),
        ) {
            let date = self
                .scan
                .infos
                .get(commit)
                .map(|info| info.unix_secs)
                .unwrap_or_default();
            let slot = self
                .categories
                .entry(category.to_owned())
                .or_insert((date, commit.to_owned()));
            if date > slot.0 {
                *slot = (date, commit.to_owned());
            }
            self.commits.insert(commit.to_owned());
        }
        self.records.push(record);
    }

    async fn write_all(
        &self,
        w: &mut StepSink,
        group: &str,
        head: &str,
        reset: bool,
    ) -> anyhow::Result<()> {
        if reset {
            write_jsonl(w, &json!({ "$control": "reset" })).await?;
        }
        for record in &self.records {
            write_jsonl(w, record).await?;
        }
        for (category, (_, commit)) in &self.categories {
            write_jsonl(
                w,
                &json!({ "$category": { "category": category, "commit": commit } }),
            )
            .await?;
        }
        for commit in &self.commits {
            let info = self.scan.infos.get(commit);
            write_jsonl(
                w,
                &json!({ "$commit": {
                    "commit": commit,
                    "date": info.map(|i| i.unix_secs),
                    "subject": info.map(|i| i.subject.as_str()),
                }}),
            )
            .await?;
        }
        write_jsonl(w, &json!({ "$acm": { "group": group } })).await?;
        write_jsonl(w, &json!({ "$latest": { "commit": head } })).await?;
        Ok(())
    }
}
