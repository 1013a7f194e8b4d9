// Response shaping: artifact streaming with etag/304 handling, error
// pages, and the trivial `@d` template substitution for text responses.

use std::collections::HashMap;

use axum::body::StreamBody;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio_util::io::ReaderStream;
use tracing::warn;

use super::types::ApiError;
use crate::application::application::Application;
use crate::context::Context;
use crate::negotiator::accept::AcceptHeaders;
use crate::pipeline::Artifact;
use crate::vcs;

pub fn etag_matches(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches('"') == etag || v == "*")
        .unwrap_or(false)
}

fn cache_headers(app: &Application, artifact: &Artifact) -> [(header::HeaderName, String); 2] {
    let cache_control = artifact
        .cache_control
        .clone()
        .unwrap_or_else(|| app.config.default_cache_control.clone());
    [
        (header::ETAG, format!("\"{}\"", artifact.etag())),
        (header::CACHE_CONTROL, cache_control),
    ]
}

pub fn not_modified(app: &Application, artifact: &Artifact) -> Response {
    let mut response = StatusCode::NOT_MODIFIED.into_response();
    for (name, value) in cache_headers(app, artifact) {
        if let Ok(value) = HeaderValue::from_str(&value) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

/// Stream an artifact with the common response policy: etag, cache
/// control, content type and repo-relative content location.
pub async fn artifact_response(
    app: &Application,
    ctx: &Context,
    artifact: &Artifact,
    request_headers: &HeaderMap,
    content_location: Option<&str>,
) -> Result<Response, ApiError> {
    if etag_matches(request_headers, &artifact.etag()) {
        return Ok(not_modified(app, artifact));
    }

    let file = artifact.open().await.map_err(|err| {
        warn!(path = %artifact.file.display(), %err, "artifact went missing");
        ApiError::Internal(err.into())
    })?;

    let mut response = StreamBody::new(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    for (name, value) in cache_headers(app, artifact) {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
    let mime = artifact
        .mime_type
        .as_deref()
        .unwrap_or("application/octet-stream");
    if let Ok(value) = HeaderValue::from_str(mime) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Some(location) = content_location {
        let location = format!("{}/{}", ctx.base_path.trim_end_matches('/'), location);
        if let Ok(value) = HeaderValue::from_str(&location) {
            headers.insert(header::CONTENT_LOCATION, value);
        }
    }
    Ok(response)
}

/// Buffer a text artifact and substitute `{{name}}` placeholders from the
/// request's query parameters.
pub async fn templated_response(
    app: &Application,
    artifact: &Artifact,
    params: &HashMap<String, String>,
    request_headers: &HeaderMap,
) -> Result<Response, ApiError> {
    if etag_matches(request_headers, &artifact.etag()) {
        return Ok(not_modified(app, artifact));
    }

    let raw = tokio::fs::read_to_string(&artifact.file)
        .await
        .map_err(|err| ApiError::Internal(err.into()))?;
    let mut body = raw;
    for (name, value) in params {
        body = body.replace(&format!("{{{{{name}}}}}"), value);
    }

    let mut response = body.into_response();
    let headers = response.headers_mut();
    for (name, value) in cache_headers(app, artifact) {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
    if let Some(mime) = &artifact.mime_type {
        if let Ok(value) = HeaderValue::from_str(mime) {
            headers.insert(header::CONTENT_TYPE, value);
        }
    }
    Ok(response)
}

/// Error response policy: the matching `errors/<code>.html` page from the
/// addressed branch (wildcard `errors/xxx.html` fallback) when the client
/// accepts HTML, otherwise an empty body.
pub async fn error_response(
    ctx: Option<&Context>,
    accept: &AcceptHeaders,
    err: &ApiError,
) -> Response {
    let status = err.status();

    let mut response = match (ctx, accept.accepts_html()) {
        (Some(ctx), true) => {
            let page = error_page(ctx, status.as_u16()).await;
            match page {
                Some(html) => {
                    let mut response = (status, html).into_response();
                    response.headers_mut().insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("text/html; charset=utf-8"),
                    );
                    response
                }
                None => status.into_response(),
            }
        }
        _ => status.into_response(),
    };

    if let Some(challenge) = err.challenge() {
        if let Ok(value) = HeaderValue::from_str(&challenge) {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, value);
        }
    }
    response
}

async fn error_page(ctx: &Context, code: u16) -> Option<String> {
    for name in [format!("errors/{code}.html"), "errors/xxx.html".to_owned()] {
        if let Ok(Some(bytes)) =
            vcs::read_file_at_commit(&ctx.repo_path, &ctx.branch, &name).await
        {
            return Some(String::from_utf8_lossy(&bytes).into_owned());
        }
    }
    None
}
