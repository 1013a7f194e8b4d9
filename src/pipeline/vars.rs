// Per-invocation variable map threaded through pipeline steps and path
// templates. Reserved keys: ctx, commit, since, category, fileset, path,
// pathHash, commitPath, valid.

use serde_json::{Map, Value};

use crate::context::Context;

#[derive(Clone, Debug, Default)]
pub struct Vars(Map<String, Value>);

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_ctx(ctx: &Context) -> Self {
        let mut vars = Self::new();
        let value = ctx.to_value();
        // hostname, basePath and auth are addressable both through `ctx.`
        // and bare, matching the template vocabulary
        vars.set("hostname", value["hostname"].clone());
        vars.set("basePath", value["basePath"].clone());
        vars.set("auth", value["auth"].clone());
        vars.set("ctx", value);
        vars
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_owned(), value.into());
    }

    /// Dotted lookup, e.g. `ctx.auth.group`.
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        let mut parts = name.split('.');
        let mut node = self.0.get(parts.next()?)?;
        for part in parts {
            node = node.as_object()?.get(part)?;
        }
        Some(node)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.lookup(name).and_then(Value::as_str)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}
