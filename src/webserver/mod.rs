// The HTTP surface. One fallback service owns the positional address
// grammar `/<account|@account>/<repo>?/<branch>?/<endpoint-or-path>`:
// segments resolve against the branch DB, ACM runs, and the endpoint
// dispatches into the file DB, search or negotiator.

pub mod api;
pub mod respond;
pub mod types;

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::body::{Body, HttpBody};
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, Request, Uri};
use axum::response::Response;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer};
use tracing::{error, info};

use crate::acm::{authenticate, AuthContext, DerivedAuth};
use crate::application::application::Application;
use crate::context::Context;
use crate::negotiator::accept::AcceptHeaders;
use types::{ApiError, ApiResult};

pub type Router<S = Application> = axum::Router<S>;

const MAX_BODY: usize = 1024 * 1024;

pub async fn start(app: Application) -> anyhow::Result<()> {
    let bind = SocketAddr::new(app.config.host.parse()?, app.config.port);

    let router = Router::new()
        .fallback(serve)
        .with_state(app)
        .layer(CorsLayer::permissive())
        .layer(CatchPanicLayer::new());

    info!(%bind, "content server listening");
    axum::Server::bind(&bind)
        .serve(router.into_make_service())
        .await?;
    Ok(())
}

pub async fn serve(State(app): State<Application>, req: Request<Body>) -> Response {
    let accept = AcceptHeaders::parse(
        header_str(req.headers(), header::ACCEPT),
        header_str(req.headers(), header::ACCEPT_LANGUAGE),
        header_str(req.headers(), header::ACCEPT_CHARSET),
    );

    match handle(&app, req).await {
        Ok(response) => response,
        Err((ctx, err)) => {
            if matches!(err, ApiError::Internal(_)) {
                error!(%err, "request failed");
            }
            respond::error_response(ctx.as_ref(), &accept, &err).await
        }
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Everything the dispatcher needs from one request.
pub struct Incoming {
    pub method: Method,
    pub headers: HeaderMap,
    pub accept: AcceptHeaders,
    pub params: Vec<(String, String)>,
    pub body: serde_json::Value,
}

impl Incoming {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.params.iter().any(|(k, _)| k == name)
    }

    pub fn param_map(&self) -> std::collections::HashMap<String, String> {
        self.params.iter().cloned().collect()
    }
}

async fn handle(
    app: &Application,
    req: Request<Body>,
) -> Result<Response, (Option<Context>, ApiError)> {
    let (parts, body) = req.into_parts();
    let params = parse_query(&parts.uri);
    let accept = AcceptHeaders::parse(
        header_str(&parts.headers, header::ACCEPT),
        header_str(&parts.headers, header::ACCEPT_LANGUAGE),
        header_str(&parts.headers, header::ACCEPT_CHARSET),
    );
    let body_value = read_json_body(body).await.unwrap_or(serde_json::Value::Null);

    let mut ctx = resolve_address(app, &parts.uri, &parts.headers)
        .map_err(|err| (None, err))?;

    let endpoint = ctx.trailing.first().cloned();
    ctx.secure = endpoint.as_deref() == Some("authenticate.api");

    let incoming = Incoming {
        method: parts.method,
        headers: parts.headers,
        accept,
        params,
        body: body_value,
    };

    let auth = build_auth(app, &ctx, &incoming)
        .await
        .map_err(|err| (Some(ctx.clone()), err))?;
    ctx.auth = Some(auth);

    api::dispatch(app, ctx, incoming).await
}

/// Resolve the positional address: account (or `@account`), optional repo
/// (falling back to the configured default), optional branch (falling back
/// to the default public branch), then the trailing path.
fn resolve_address(app: &Application, uri: &Uri, headers: &HeaderMap) -> ApiResult<Context> {
    let mount = app.config.mount_path.trim_end_matches('/');
    let path = uri
        .path()
        .strip_prefix(mount)
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
        .ok_or(ApiError::NotFound)?;

    let segments: Vec<String> = path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(percent_decode)
        .collect();
    let Some(first) = segments.first() else {
        return Err(ApiError::NotFound);
    };

    let account_only = first.starts_with('@');
    let account = first.trim_start_matches('@').to_owned();
    if !app.branch_db.is_account_name(&account) {
        return Err(ApiError::NotFound);
    }

    let mut consumed = vec![first.clone()];
    let mut rest = &segments[1..];

    let repo = if account_only {
        app.config.default_repo.clone().ok_or(ApiError::NotFound)?
    } else {
        match rest.first() {
            Some(name) if app.branch_db.is_repo_name(&account, name) => {
                consumed.push(name.clone());
                rest = &rest[1..];
                name.clone()
            }
            _ => app.config.default_repo.clone().ok_or(ApiError::NotFound)?,
        }
    };
    if !app.branch_db.is_repo_name(&account, &repo) {
        return Err(ApiError::NotFound);
    }

    let branch = match rest.first() {
        Some(name) if app.branch_db.is_public_branch(&account, &repo, name) => {
            consumed.push(name.clone());
            rest = &rest[1..];
            name.clone()
        }
        _ => app
            .branch_db
            .default_public_branch(&account, &repo)
            .ok_or(ApiError::NotFound)?,
    };

    let base_path = format!("{}/{}", mount, consumed.join("/"));
    let hostname = header_str(headers, header::HOST)
        .map(|h| h.split(':').next().unwrap_or(h).to_owned())
        .unwrap_or_else(|| "localhost".to_owned());

    let repo_path = app.branch_db.repo_path(&account, &repo);
    let mut ctx = Context::new(account, repo, branch, repo_path, base_path, hostname);
    ctx.trailing = rest.to_vec();
    Ok(ctx)
}

async fn build_auth(
    app: &Application,
    ctx: &Context,
    incoming: &Incoming,
) -> ApiResult<AuthContext> {
    let settings = app.auth_settings_for(ctx).await?;

    let user = authenticate(
        &settings,
        header_str(&incoming.headers, header::AUTHORIZATION),
        ctx.secure,
    )?;

    let includes = filter_patterns(incoming, "filter")
        .or_else(|| filter_patterns(incoming, "filter[includes]"));
    let excludes = filter_patterns(incoming, "filter[excludes]");

    let cvs = incoming
        .body
        .get("cvs")
        .and_then(serde_json::Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(k, v)| {
                    let version = v
                        .as_str()
                        .map(str::to_owned)
                        .unwrap_or_else(|| v.to_string());
                    (k.clone(), version)
                })
                .collect::<BTreeMap<String, String>>()
        });

    let derived = DerivedAuth::derive(
        header_str(&incoming.headers, header::ACCEPT_LANGUAGE),
        includes,
        excludes,
        cvs,
    );

    AuthContext::build(&settings, user, derived).map_err(ApiError::Internal)
}

fn filter_patterns(incoming: &Incoming, name: &str) -> Option<Vec<String>> {
    incoming.param(name).map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    })
}

fn parse_query(uri: &Uri) -> Vec<(String, String)> {
    uri.query()
        .unwrap_or_default()
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => match (hex_val(bytes.get(i + 1)), hex_val(bytes.get(i + 2))) {
                (Some(hi), Some(lo)) => {
                    out.push(hi * 16 + lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: Option<&u8>) -> Option<u8> {
    match b? {
        c @ b'0'..=b'9' => Some(c - b'0'),
        c @ b'a'..=b'f' => Some(c - b'a' + 10),
        c @ b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

async fn read_json_body(mut body: Body) -> Option<serde_json::Value> {
    let mut bytes = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.ok()?;
        if bytes.len() + chunk.len() > MAX_BODY {
            return None;
        }
        bytes.extend_from_slice(&chunk);
    }
    if bytes.is_empty() {
        return None;
    }
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_decoding_handles_escapes_and_plus() {
        assert_eq!(percent_decode("a%20b+c"), "a b c");
        assert_eq!(percent_decode("caf%C3%A9"), "café");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("plain"), "plain");
    }

    #[test]
    fn query_parsing_keeps_duplicates_in_order() {
        let uri: Uri = "/x?a=1&b=2&a=3&flag".parse().unwrap();
        let params = parse_query(&uri);
        assert_eq!(
            params,
            vec![
                ("a".into(), "1".into()),
                ("b".into(), "2".into()),
                ("a".into(), "3".into()),
                ("flag".into(), String::new()),
            ]
        );
    }
}
