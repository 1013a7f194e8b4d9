// Per-category record and content production. Three processors cover the
// repo layouts we publish: raw bytes, HTML with URL relocation + page
// metadata, and JSON embedded into the record.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncWrite, BufReader};

use super::fileset::{FileRecord, Status};
use crate::hash::fingerprint;
use crate::pipeline::transform::line_transform;
use crate::vcs;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessorKind {
    #[default]
    Raw,
    HtmlRewrite,
    JsonParse,
}

/// Row handed to the search indexer for one published file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchRecord {
    pub id: String,
    pub path: String,
    pub title: String,
    pub content: String,
    pub category: String,
}

impl ProcessorKind {
    /// Build the file record for `path` as of `commit`. `record_commit` is
    /// the short hash stamped on the record (the last commit that modified
    /// the path).
    pub async fn make_record(
        &self,
        repo_path: &Path,
        commit: &str,
        path: &str,
        category: &str,
        record_commit: &str,
        active: bool,
    ) -> anyhow::Result<FileRecord> {
        if !active {
            return Ok(FileRecord::deleted(path, category, record_commit));
        }

        let mut record = FileRecord {
            path: path.to_owned(),
            category: category.to_owned(),
            status: Status::Published,
            commit: record_commit.to_owned(),
            page: None,
            data: None,
        };

        match self {
            ProcessorKind::Raw => {}
            ProcessorKind::HtmlRewrite => {
                if let Some(bytes) = vcs::read_file_at_commit(repo_path, commit, path).await? {
                    record.page = Some(parse_page_meta(&String::from_utf8_lossy(&bytes)));
                }
            }
            ProcessorKind::JsonParse => {
                if let Some(bytes) = vcs::read_file_at_commit(repo_path, commit, path).await? {
                    match serde_json::from_slice(&bytes) {
                        Ok(data) => record.data = Some(data),
                        // one bad data file must not sink the whole listing
                        Err(err) => {
                            tracing::warn!(path, %err, "unparseable json content");
                        }
                    }
                }
            }
        }
        Ok(record)
    }

    /// Stream file contents at `commit` into `out`. HTML passing through
    /// the rewrite processor gets absolute `src`/`href` URLs prefixed with
    /// `base_path`, without buffering the document.
    pub async fn pipe_contents<W>(
        &self,
        repo_path: &Path,
        commit: &str,
        path: &str,
        base_path: &str,
        out: &mut W,
    ) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let relocate = matches!(self, ProcessorKind::HtmlRewrite) && path.ends_with(".html");
        if !relocate {
            return vcs::pipe_file_at_commit(repo_path, commit, path, out).await;
        }

        let (writer, reader) = tokio::io::duplex(64 * 1024);
        let repo_path = repo_path.to_owned();
        let commit = commit.to_owned();
        let path = path.to_owned();
        let mut writer = writer;
        let producer = tokio::spawn(async move {
            vcs::pipe_file_at_commit(&repo_path, &commit, &path, &mut writer).await
        });

        let prefix = base_path.trim_end_matches('/').to_owned();
        line_transform(BufReader::new(reader), out, |line| {
            Some(relocate_urls(line, &prefix))
        })
        .await?;

        producer.await??;
        Ok(())
    }

    /// Reduce a record + its content to the row the search indexer stores,
    /// or None when the category has nothing searchable.
    pub fn make_search_record(&self, record: &FileRecord, content: &str) -> Option<SearchRecord> {
        let (title, text) = match self {
            ProcessorKind::Raw => (record.path.clone(), content.to_owned()),
            ProcessorKind::HtmlRewrite => {
                let title = record
                    .page
                    .as_ref()
                    .and_then(|p| p.get("title"))
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| record.path.clone());
                (title, strip_tags(content))
            }
            ProcessorKind::JsonParse => (record.path.clone(), json_text(content)),
        };

        Some(SearchRecord {
            id: fingerprint(&record.path),
            path: record.path.clone(),
            title,
            content: text,
            category: record.category.clone(),
        })
    }
}

static TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap());
static H1: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<h1[^>]*>(.*?)</h1>").unwrap());
static META: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<meta\s+name=["']([^"']+)["']\s+content=["']([^"']*)["']"#).unwrap()
});
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static ABS_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\b(src|href)=(["'])/([^/])"#).unwrap());

/// Title, page type and meta fields from an HTML document head.
pub fn parse_page_meta(html: &str) -> Value {
    let title = TITLE
        .captures(html)
        .or_else(|| H1.captures(html))
        .map(|c| strip_tags(c.get(1).unwrap().as_str()))
        .unwrap_or_default();

    let mut meta = serde_json::Map::new();
    for caps in META.captures_iter(html) {
        meta.insert(caps[1].to_owned(), Value::String(caps[2].to_owned()));
    }
    let page_type = meta
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("page")
        .to_owned();

    json!({ "title": title.trim(), "type": page_type, "meta": meta })
}

/// Prefix `base` onto site-absolute src/href URLs. Protocol-relative URLs
/// (`//cdn…`) are left alone.
fn relocate_urls(line: &str, base: &str) -> String {
    ABS_URL
        .replace_all(line, |caps: &regex::Captures| {
            format!("{}={}{}/{}", &caps[1], &caps[2], base, &caps[3])
        })
        .into_owned()
}

pub fn strip_tags(html: &str) -> String {
    let text = TAG.replace_all(html, " ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn json_text(content: &str) -> String {
    fn collect(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
            Value::Object(map) => map.values().for_each(|v| collect(v, out)),
            _ => {}
        }
    }
    let mut strings = Vec::new();
    if let Ok(value) = serde_json::from_str::<Value>(content) {
        collect(&value, &mut strings);
    }
    strings.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_meta_prefers_title_tag() {
        let page = parse_page_meta(
            r#"<html><head><title>Welcome</title>
               <meta name="author" content="bea">
               <meta name="type" content="article"></head>
               <body><h1>Other</h1></body></html>"#,
        );
        assert_eq!(page["title"], "Welcome");
        assert_eq!(page["type"], "article");
        assert_eq!(page["meta"]["author"], "bea");
    }

    #[test]
    fn page_meta_falls_back_to_h1() {
        let page = parse_page_meta("<body><h1>Fallback <em>Heading</em></h1></body>");
        assert_eq!(page["title"], "Fallback Heading");
        assert_eq!(page["type"], "page");
    }

    #[test]
    fn relocation_prefixes_absolute_urls_only() {
        let line = r#"<img src="/img/a.png"> <a href="/docs">x</a> <a href="relative.html">y</a> <script src="//cdn.example/x.js">"#;
        let out = relocate_urls(line, "/acme/site");
        assert!(out.contains(r#"src="/acme/site/img/a.png""#));
        assert!(out.contains(r#"href="/acme/site/docs""#));
        assert!(out.contains(r#"href="relative.html""#));
        assert!(out.contains(r#"src="//cdn.example/x.js""#));
    }

    #[test]
    fn strip_tags_collapses_whitespace() {
        assert_eq!(
            strip_tags("<p>one\n  <b>two</b></p>\t three"),
            "one two three"
        );
    }

    #[test]
    fn json_text_walks_nested_strings() {
        assert_eq!(
            json_text(r#"{"a": "hello", "b": {"c": ["big", "world"]}, "n": 4}"#),
            "hello big world"
        );
    }

    #[test]
    fn search_record_for_html_uses_page_title() {
        let record = FileRecord {
            path: "a.html".into(),
            category: "pages".into(),
            status: Status::Published,
            commit: "c1".into(),
            page: Some(json!({"title": "Hi"})),
            data: None,
        };
        let search = ProcessorKind::HtmlRewrite
            .make_search_record(&record, "<p>Hello <b>world</b></p>")
            .unwrap();
        assert_eq!(search.title, "Hi");
        assert_eq!(search.content, "Hello world");
        assert_eq!(search.category, "pages");
    }
}
