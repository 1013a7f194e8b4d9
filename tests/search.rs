// Indexing and query behavior over a real repo and a scratch sqlite DB.

mod common;

use std::sync::Arc;

use common::{short, Fixture};
use locomote::search::{schema, Indexer, SearchDb, SearchMode};
use locomote::tasks::TaskQueues;

async fn harness(fx: &Fixture) -> (Arc<Indexer>, SearchDb) {
    let sql = schema::init(&fx.cache.join("search.sqlite")).await.unwrap();
    let indexer = Indexer::new(Arc::clone(&sql), TaskQueues::new());
    let search = SearchDb::new(sql, fx.cache.join("publish_cache/search"), 250 * 1024);
    (indexer, search)
}

#[tokio::test]
async fn index_then_query_highlights_matches() {
    let fx = Fixture::new();
    fx.write(
        "guide.html",
        "<html><head><title>Guide</title></head><body><p>Rust is wonderful for servers</p></body></html>",
    );
    fx.write("other.html", "<p>nothing to see</p>");
    let head = fx.commit("content");

    let (indexer, search) = harness(&fx).await;
    indexer
        .index_now("acme", "site", "master", &fx.repo_path)
        .await
        .unwrap();
    assert_eq!(
        indexer.scope_head("acme", "site", "master").await.unwrap(),
        Some(short(&head))
    );

    let (artifact, _print) = search
        .query("acme", "site", "master", "RUST", SearchMode::Any, None)
        .await
        .unwrap();
    let rows = tokio::fs::read_to_string(&artifact).await.unwrap();
    let hits: Vec<serde_json::Value> = rows
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["path"], "guide.html");
    assert_eq!(hits[0]["title"], "Guide");
    assert_eq!(hits[0]["category"], "pages");
    assert!(hits[0]["excerpt"]
        .as_str()
        .unwrap()
        .contains("<em>Rust</em>"));

    // artifact path is keyed by the indexed commit
    assert!(artifact
        .to_string_lossy()
        .contains(&format!("{}-", short(&head))));
}

#[tokio::test]
async fn reindex_after_deletion_removes_hits() {
    let fx = Fixture::new();
    fx.write("gone.html", "<p>transient needle</p>");
    fx.commit("add");

    let (indexer, search) = harness(&fx).await;
    indexer
        .index_now("acme", "site", "master", &fx.repo_path)
        .await
        .unwrap();

    fx.remove("gone.html");
    let c2 = fx.commit("remove");
    indexer
        .index_now("acme", "site", "master", &fx.repo_path)
        .await
        .unwrap();
    assert_eq!(
        indexer.scope_head("acme", "site", "master").await.unwrap(),
        Some(short(&c2))
    );

    let (artifact, _) = search
        .query("acme", "site", "master", "needle", SearchMode::Any, None)
        .await
        .unwrap();
    let rows = tokio::fs::read_to_string(&artifact).await.unwrap();
    assert!(rows.trim().is_empty(), "deleted file still searchable: {rows}");
}

#[tokio::test]
async fn all_mode_requires_every_term() {
    let fx = Fixture::new();
    fx.write("both.html", "<p>alpha beta</p>");
    fx.write("one.html", "<p>alpha only</p>");
    fx.commit("content");

    let (indexer, search) = harness(&fx).await;
    indexer
        .index_now("acme", "site", "master", &fx.repo_path)
        .await
        .unwrap();

    let (artifact, _) = search
        .query("acme", "site", "master", "alpha beta", SearchMode::All, None)
        .await
        .unwrap();
    let rows = tokio::fs::read_to_string(&artifact).await.unwrap();
    let hits: Vec<serde_json::Value> = rows
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["path"], "both.html");
}

#[tokio::test]
async fn path_parameter_narrows_results() {
    let fx = Fixture::new();
    fx.write("docs/a.html", "<p>shared keyword</p>");
    fx.write("blog/b.html", "<p>shared keyword</p>");
    fx.commit("content");

    let (indexer, search) = harness(&fx).await;
    indexer
        .index_now("acme", "site", "master", &fx.repo_path)
        .await
        .unwrap();

    let (artifact, _) = search
        .query(
            "acme",
            "site",
            "master",
            "shared",
            SearchMode::Any,
            Some("docs/"),
        )
        .await
        .unwrap();
    let rows = tokio::fs::read_to_string(&artifact).await.unwrap();
    let hits: Vec<serde_json::Value> = rows
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["path"], "docs/a.html");
}

#[tokio::test]
async fn repeated_queries_reuse_the_artifact() {
    let fx = Fixture::new();
    fx.write("a.html", "<p>stable</p>");
    fx.commit("content");

    let (indexer, search) = harness(&fx).await;
    indexer
        .index_now("acme", "site", "master", &fx.repo_path)
        .await
        .unwrap();

    let (first, _) = search
        .query("acme", "site", "master", "stable", SearchMode::Any, None)
        .await
        .unwrap();
    let before = std::fs::metadata(&first).unwrap().modified().unwrap();

    let (second, _) = search
        .query("acme", "site", "master", "stable", SearchMode::Any, None)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(std::fs::metadata(&second).unwrap().modified().unwrap(), before);
}
