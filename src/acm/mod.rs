// Access control & modification: who may see which categories, and how
// records are filtered or rewritten on the way out.

pub mod context;
pub mod user;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content::Filesets;
use crate::hash::{fingerprint, fingerprint_json};
use crate::repo::Manifest;
use crate::tasks::CachingSingleFlight;

pub use context::{AuthContext, DerivedAuth, FilterSpec, RecordFilter};
pub use user::{authenticate, AuthError, AuthUser};

/// Server-wide authentication defaults, overridden per repo manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthDefaults {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_realm")]
    pub realm: String,
}

impl Default for AuthDefaults {
    fn default() -> Self {
        Self {
            method: default_method(),
            realm: default_realm(),
        }
    }
}

fn default_method() -> String {
    "none".to_owned()
}

fn default_realm() -> String {
    "Locomote".to_owned()
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct UserEntry {
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Field-omission rewrite applied to records of one category. An omit list
/// of `*` drops the record entirely.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct RewriteSpec {
    #[serde(default)]
    pub omit: Vec<String>,
}

impl RewriteSpec {
    pub fn apply(&self, mut record: Value) -> Option<Value> {
        if self.omit.iter().any(|f| f == "*") {
            return None;
        }
        if let Some(map) = record.as_object_mut() {
            for field in &self.omit {
                map.remove(field);
            }
        }
        Some(record)
    }
}

/// Per-repo auth settings: global defaults merged with the manifest `auth`
/// object and the branch's fileset list.
pub struct AuthSettings {
    pub method: String,
    pub realm: String,
    pub users: HashMap<String, UserEntry>,
    pub test_groups: Vec<String>,
    pub filesets: Arc<Filesets>,
    /// category -> deterministic fingerprint, stable across requests
    pub fingerprints: HashMap<String, String>,
    pub rewrites: HashMap<String, RewriteSpec>,
    /// commit hash of the manifest these settings came from
    pub fingerprint: String,
}

impl AuthSettings {
    pub fn build(manifest: &Manifest, defaults: &AuthDefaults) -> Arc<Self> {
        let auth = manifest.auth().cloned().unwrap_or(Value::Null);

        let method = auth
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or(&defaults.method)
            .to_owned();
        let realm = auth
            .get("realm")
            .and_then(Value::as_str)
            .unwrap_or(&defaults.realm)
            .to_owned();
        let users: HashMap<String, UserEntry> = auth
            .get("users")
            .and_then(|u| serde_json::from_value(u.clone()).ok())
            .unwrap_or_default();
        let test_groups: Vec<String> = auth
            .get("groups")
            .and_then(|g| serde_json::from_value(g.clone()).ok())
            .unwrap_or_default();

        let filesets = Arc::new(
            manifest
                .filesets()
                .and_then(|defs| Filesets::from_defs(defs).ok())
                .unwrap_or_else(Filesets::default_set),
        );

        let mut fingerprints = HashMap::new();
        let mut rewrites: HashMap<String, RewriteSpec> = auth
            .get("rewrites")
            .and_then(|r| serde_json::from_value(r.clone()).ok())
            .unwrap_or_default();

        for fs in filesets.iter() {
            let category = fs.category().to_owned();
            let def = serde_json::to_value(&fs.def).unwrap_or(Value::Null);
            fingerprints.insert(
                category.clone(),
                fingerprint(format!(
                    "{}:{}",
                    manifest.fingerprint,
                    fingerprint_json(&def)
                )),
            );
            // a rewriter on the fileset definition wins over the manifest's
            if let Some(spec) = fs
                .def
                .acm
                .as_ref()
                .and_then(|v| serde_json::from_value(v.clone()).ok())
            {
                rewrites.insert(category, spec);
            }
        }

        Arc::new(Self {
            method,
            realm,
            users,
            test_groups,
            filesets,
            fingerprints,
            rewrites,
            fingerprint: manifest.fingerprint.clone(),
        })
    }
}

/// Auth settings cache keyed by `account/repo/branch`; entries drop on
/// repo-update events.
pub struct AuthSettingsCache {
    inner: CachingSingleFlight<Arc<AuthSettings>>,
}

impl AuthSettingsCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: CachingSingleFlight::new(capacity),
        }
    }

    pub async fn get<F>(&self, key: &str, build: F) -> anyhow::Result<Arc<AuthSettings>>
    where
        F: std::future::Future<Output = anyhow::Result<Arc<AuthSettings>>>,
    {
        self.inner
            .run(key, build)
            .await
            .map_err(|err| anyhow::anyhow!(err))
    }

    pub fn invalidate(&self, key: &str) {
        self.inner.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest(auth: Value) -> Manifest {
        Manifest::from_parts(json!({ "public": ["public"], "auth": auth }), "m1".to_owned())
    }

    #[test]
    fn settings_merge_defaults_and_manifest() {
        let settings = AuthSettings::build(
            &manifest(json!({
                "method": "basic",
                "users": { "alice": { "password": "pw", "groups": ["staff"] } }
            })),
            &AuthDefaults::default(),
        );
        assert_eq!(settings.method, "basic");
        assert_eq!(settings.realm, "Locomote");
        assert_eq!(settings.users["alice"].groups, ["staff"]);
        assert_eq!(settings.fingerprint, "m1");
    }

    #[test]
    fn category_fingerprints_are_stable_and_distinct() {
        let settings = AuthSettings::build(&manifest(Value::Null), &AuthDefaults::default());
        let again = AuthSettings::build(&manifest(Value::Null), &AuthDefaults::default());
        assert_eq!(settings.fingerprints, again.fingerprints);
        let values: Vec<&String> = settings.fingerprints.values().collect();
        let mut dedup = values.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(values.len(), dedup.len());
    }

    #[test]
    fn rewrite_omits_fields_or_drops_record() {
        let spec = RewriteSpec {
            omit: vec!["data".into()],
        };
        let out = spec.apply(json!({"path": "a", "data": {"x": 1}})).unwrap();
        assert!(out.get("data").is_none());

        let drop_all = RewriteSpec {
            omit: vec!["*".into()],
        };
        assert!(drop_all.apply(json!({"path": "a"})).is_none());
    }
}
