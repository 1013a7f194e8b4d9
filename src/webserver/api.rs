// Endpoint handlers under the resolved `account/repo/branch` prefix.

use axum::body::StreamBody;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes_stream::ResponseWriter;
use rand::Rng;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use super::respond::{artifact_response, etag_matches, not_modified, templated_response};
use super::types::{ApiError, ApiResult};
use super::Incoming;
use crate::application::application::Application;
use crate::context::Context;
use crate::hash::fingerprint;
use crate::search::SearchMode;
use crate::vcs;

pub async fn dispatch(
    app: &Application,
    ctx: Context,
    incoming: Incoming,
) -> Result<Response, (Option<Context>, ApiError)> {
    let endpoint = ctx.trailing.first().map(String::as_str).unwrap_or("");
    let result = match endpoint {
        "robots.txt" => Ok(robots()),
        "authenticate.api" => authenticate_api(&ctx, &incoming),
        "commits.api" => commits_api(&ctx).await,
        "updates.api" => updates_api(app, &ctx, &incoming).await,
        "filesets.api" => filesets_api(app, &ctx, &incoming).await,
        "search.api" => search_api(app, &ctx, &incoming).await,
        _ => content(app, &ctx, &incoming).await,
    };
    result.map_err(|err| (Some(ctx), err))
}

fn robots() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain")],
        "User-agent: *\nDisallow:\n",
    )
        .into_response()
}

/// Forced-secure ACM round trip; the response is the authenticated user.
fn authenticate_api(ctx: &Context, incoming: &Incoming) -> ApiResult<Response> {
    if incoming.method != Method::POST {
        return Err(ApiError::BadRequest("authenticate.api expects POST".into()));
    }
    let auth = ctx.auth.as_ref().ok_or(ApiError::NotFound)?;
    Ok(Json(json!({ "userInfo": auth.user_info })).into_response())
}

async fn commits_api(ctx: &Context) -> ApiResult<Response> {
    let commits = vcs::list_commits(&ctx.repo_path, &ctx.branch, 100)
        .await
        .map_err(ApiError::Internal)?;
    let rows: Vec<Value> = commits
        .into_iter()
        .map(|(commit, message)| json!({ "commit": commit, "message": message }))
        .collect();
    Ok(Json(rows).into_response())
}

/// File manifest streaming: full listing or since-delta, with the group
/// drift check that tells stale clients to reset.
async fn updates_api(app: &Application, ctx: &Context, incoming: &Incoming) -> ApiResult<Response> {
    let auth = ctx.auth.as_ref().ok_or(ApiError::NotFound)?;

    // a client reporting a group we no longer derive must resync from
    // scratch
    if let Some(client_group) = incoming.param("group") {
        if client_group != auth.group {
            return Ok(StatusCode::RESET_CONTENT.into_response());
        }
    }

    let since = incoming
        .param("since")
        .map(str::to_owned)
        .or_else(|| {
            incoming
                .body
                .get("since")
                .and_then(Value::as_str)
                .map(str::to_owned)
        });

    if incoming.method == Method::HEAD {
        let head = vcs::head_commit(&ctx.repo_path, &ctx.branch)
            .await
            .map_err(ApiError::Internal)?
            .ok_or(ApiError::NotFound)?;
        let short: String = head.id.chars().take(7).collect();
        let etag = format!("\"{}-{}\"", short, auth.group);
        return Ok((
            [
                (header::ETAG, etag),
                (
                    header::CACHE_CONTROL,
                    app.config.default_cache_control.clone(),
                ),
            ],
            StatusCode::OK,
        )
            .into_response());
    }

    let artifact = match &since {
        Some(since) => app.filedb.list_updates_since(ctx, since, None).await,
        None => app.filedb.list_all_files(ctx, None).await,
    }
    .map_err(ApiError::Internal)?;
    let mut artifact = artifact.ok_or(ApiError::NotFound)?;
    artifact.mime_type = Some("application/x-ndjson".to_owned());

    app.sync_set.mark(&ctx.key, &auth.group);
    artifact_response(app, ctx, &artifact, &incoming.headers, None).await
}

/// `filesets.api/:category/:mode` with `mode ∈ {list, contents}`.
async fn filesets_api(app: &Application, ctx: &Context, incoming: &Incoming) -> ApiResult<Response> {
    let category = ctx
        .trailing
        .get(1)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing fileset category".into()))?;
    let mode = ctx
        .trailing
        .get(2)
        .map(String::as_str)
        .ok_or_else(|| ApiError::BadRequest("missing fileset mode".into()))?;
    let since = incoming.param("since").or_else(|| {
        incoming
            .body
            .get("since")
            .and_then(Value::as_str)
    });

    let artifact = match mode {
        "list" => app.filedb.list_fileset_files(ctx, category, since).await,
        "contents" => app.filedb.get_fileset_contents(ctx, category, since).await,
        other => {
            return Err(ApiError::BadRequest(format!("unknown fileset mode `{other}`")));
        }
    }
    .map_err(ApiError::Internal)?;

    let mut artifact = artifact.ok_or(ApiError::NotFound)?;
    if mode == "list" {
        artifact.mime_type = Some("application/x-ndjson".to_owned());
    }
    artifact_response(app, ctx, &artifact, &incoming.headers, None).await
}

/// Stream search hits as one JSON array, with ACM and representation
/// preference applied row by row.
async fn search_api(app: &Application, ctx: &Context, incoming: &Incoming) -> ApiResult<Response> {
    let auth = ctx.auth.clone().ok_or(ApiError::NotFound)?;
    let term = incoming.param("s").unwrap_or("").to_owned();
    let mode = SearchMode::parse(incoming.param("m"));
    let path = incoming.param("p").map(str::to_owned);

    let etag = fingerprint(format!(
        "{}|{:?}|{}|{}",
        term.to_lowercase(),
        mode,
        path.as_deref().unwrap_or(""),
        auth.group
    ));
    if etag_matches(&incoming.headers, &etag) {
        let mut response = StatusCode::NOT_MODIFIED.into_response();
        if let Ok(value) = HeaderValue::from_str(&format!("\"{etag}\"")) {
            response.headers_mut().insert(header::ETAG, value);
        }
        return Ok(response);
    }

    let (artifact_path, _print) = app
        .search
        .query(
            &ctx.account,
            &ctx.repo,
            &ctx.branch,
            &term,
            mode,
            path.as_deref(),
        )
        .await
        .map_err(ApiError::Internal)?;

    let resources = app.resources_for(ctx).await.map_err(ApiError::Internal)?;
    let accept = incoming.accept.clone();
    let user_groups = ctx.user_groups();
    let queues = std::sync::Arc::clone(&app.queues);
    let nonce: u64 = rand::thread_rng().gen();
    let queue_name = format!("response:{etag}:{nonce:016x}");

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<axum::body::Bytes, std::io::Error>>(16);
    tokio::spawn(async move {
        let writer = ResponseWriter {
            queues,
            name: queue_name,
            tx,
        };

        if writer.send("[".into()).await.is_err() {
            return;
        }
        let mut first = true;

        let file = match tokio::fs::File::open(&artifact_path).await {
            Ok(file) => file,
            Err(err) => {
                warn!(%err, "search artifact unreadable");
                _ = writer.send("]".into()).await;
                return;
            }
        };
        let mut lines = BufReader::new(file).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(record) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let category = record.get("category").and_then(Value::as_str).unwrap_or("");
            if !auth.accessible.contains(category) || !auth.filter.accepts(&record) {
                continue;
            }
            let hit_path = record.get("path").and_then(Value::as_str).unwrap_or("");
            if !resources.is_preferred_path(hit_path, &accept, &user_groups) {
                continue;
            }

            let chunk = if first {
                first = false;
                line
            } else {
                format!(",{line}")
            };
            if writer.send(chunk).await.is_err() {
                // client went away; the artifact stays cached for the next
                // request
                return;
            }
        }
        _ = writer.send("]".into()).await;
    });

    let body = StreamBody::new(ReceiverStream::new(rx));
    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("\"{etag}\"")) {
        headers.insert(header::ETAG, value);
    }
    Ok(response)
}

/// Plain file fetch through content negotiation; `format=record` returns
/// the file's JSON record, `@d` substitutes query parameters into text
/// responses.
async fn content(app: &Application, ctx: &Context, incoming: &Incoming) -> ApiResult<Response> {
    let request_path = ctx.trailing.join("/");

    let resources = app.resources_for(ctx).await.map_err(ApiError::Internal)?;
    let rep_path =
        resources.representation_path(&request_path, &incoming.accept, &ctx.user_groups());

    if incoming.param("format") == Some("record") {
        let artifact = app
            .filedb
            .get_file_record(ctx, &rep_path)
            .await
            .map_err(ApiError::Internal)?
            .ok_or(ApiError::NotFound)?;
        return artifact_response(app, ctx, &artifact, &incoming.headers, Some(&rep_path)).await;
    }

    let artifact = app
        .filedb
        .get_file_contents(ctx, &rep_path)
        .await
        .map_err(ApiError::Internal)?
        .ok_or(ApiError::NotFound)?;

    let textual = artifact
        .mime_type
        .as_deref()
        .is_some_and(|m| m.starts_with("text/"));
    if incoming.has_flag("@d") && textual {
        return templated_response(app, &artifact, &incoming.param_map(), &incoming.headers).await;
    }

    if etag_matches(&incoming.headers, &artifact.etag()) {
        return Ok(not_modified(app, &artifact));
    }
    artifact_response(app, ctx, &artifact, &incoming.headers, Some(&rep_path)).await
}

/// Serializes chunk writes for one response on a named queue, preserving
/// array framing order.
mod bytes_stream {
    use std::sync::Arc;

    use crate::tasks::TaskQueues;

    pub struct ResponseWriter {
        pub queues: Arc<TaskQueues>,
        pub name: String,
        pub tx: tokio::sync::mpsc::Sender<Result<axum::body::Bytes, std::io::Error>>,
    }

    impl ResponseWriter {
        pub async fn send(&self, chunk: String) -> anyhow::Result<()> {
            let tx = self.tx.clone();
            self.queues
                .run(&self.name, async move {
                    tx.send(Ok(axum::body::Bytes::from(chunk))).await
                })
                .await??;
            Ok(())
        }
    }
}
