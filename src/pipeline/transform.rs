// Line- and record-oriented adapters over the byte streams flowing between
// pipeline steps, plus the named hook registry record transforms dispatch
// through.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::vars::Vars;

pub type Hook = Arc<dyn Fn(Value, &Vars) -> Option<Value> + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Position {
    Pre,
    Post,
}

/// Hooks registered under `(namespace, position, name)`; within a slot they
/// run in registration order and may drop a record by returning None.
#[derive(Default)]
pub struct Hooks {
    slots: RwLock<HashMap<(String, Position), Vec<(String, Hook)>>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, namespace: &str, position: Position, name: &str, hook: Hook) {
        let mut slots = self.slots.write().unwrap();
        let chain = slots
            .entry((namespace.to_owned(), position))
            .or_default();
        // re-registration under the same name replaces the hook in place
        if let Some(existing) = chain.iter_mut().find(|(n, _)| n == name) {
            existing.1 = hook;
        } else {
            chain.push((name.to_owned(), hook));
        }
    }

    pub fn apply(
        &self,
        namespace: &str,
        position: Position,
        record: Value,
        vars: &Vars,
    ) -> Option<Value> {
        let slots = self.slots.read().unwrap();
        let Some(chain) = slots.get(&(namespace.to_owned(), position)) else {
            return Some(record);
        };
        let mut record = record;
        for (_, hook) in chain {
            record = hook(record, vars)?;
        }
        Some(record)
    }
}

/// Transform a line stream: `f` maps each input line to zero or one output
/// lines.
pub async fn line_transform<R, W, F>(reader: R, writer: &mut W, mut f: F) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + ?Sized,
    F: FnMut(&str) -> Option<String>,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if let Some(out) = f(&line) {
            writer.write_all(out.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
    }
    Ok(())
}

/// Iterate a JSON-lines stream, invoking `f` per parsed record. Blank lines
/// are skipped; a malformed line is a hard error since artifacts are
/// produced by this crate alone.
pub async fn jsonl_each<R, F>(reader: R, mut f: F) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(Value) -> anyhow::Result<()>,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        f(serde_json::from_str(&line)?)?;
    }
    Ok(())
}

pub async fn write_jsonl<W>(writer: &mut W, record: &Value) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = serde_json::to_vec(record)?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hooks_run_in_registration_order_and_can_filter() {
        let hooks = Hooks::new();
        hooks.register(
            "db",
            Position::Pre,
            "tag",
            Arc::new(|mut rec, _| {
                rec.as_object_mut()?.insert("tagged".into(), json!(true));
                Some(rec)
            }),
        );
        hooks.register(
            "db",
            Position::Pre,
            "drop-deleted",
            Arc::new(|rec, _| {
                if rec.get("status")?.as_str()? == "deleted" {
                    None
                } else {
                    Some(rec)
                }
            }),
        );

        let vars = Vars::new();
        let kept = hooks
            .apply("db", Position::Pre, json!({"status": "published"}), &vars)
            .unwrap();
        assert_eq!(kept["tagged"], json!(true));

        assert!(hooks
            .apply("db", Position::Pre, json!({"status": "deleted"}), &vars)
            .is_none());
    }

    #[tokio::test]
    async fn line_transform_filters_and_maps() {
        let input = b"one\nskip\ntwo\n" as &[u8];
        let mut out = Vec::new();
        line_transform(input, &mut out, |line| {
            (line != "skip").then(|| line.to_uppercase())
        })
        .await
        .unwrap();
        assert_eq!(out, b"ONE\nTWO\n");
    }

    #[tokio::test]
    async fn jsonl_round_trip() {
        let mut buf = Vec::new();
        write_jsonl(&mut buf, &json!({"path": "a.html"})).await.unwrap();
        write_jsonl(&mut buf, &json!({"path": "b.html"})).await.unwrap();

        let mut paths = Vec::new();
        jsonl_each(buf.as_slice(), |rec| {
            paths.push(rec["path"].as_str().unwrap().to_owned());
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(paths, ["a.html", "b.html"]);
    }
}
