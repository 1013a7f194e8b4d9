// Repo manifests (`locomote.json`). Values may point at other parts of the
// document through `{"$ref": "#/…"}` nodes; references are resolved with
// the per-branch variable `SOURCE` substituted, so one manifest can vary
// by branch without duplication.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use super::types::BuildProfile;
use crate::content::FilesetDef;
use crate::tasks::CachingSingleFlight;
use crate::vcs;

const MANIFEST_FILE: &str = "locomote.json";
const MAX_REF_DEPTH: usize = 16;

#[derive(Debug, Clone)]
pub struct Manifest {
    root: Value,
    /// Short hash of the last commit touching the manifest, `0` when the
    /// repo has none and the defaults apply.
    pub fingerprint: String,
}

impl Manifest {
    pub fn from_parts(root: Value, fingerprint: String) -> Self {
        Self { root, fingerprint }
    }

    pub fn default_manifest() -> Self {
        Self {
            root: json!({ "public": ["public"], "workflow": {} }),
            fingerprint: "0".to_owned(),
        }
    }

    pub async fn load(repo_path: &Path, branch: &str) -> anyhow::Result<Self> {
        let Some(bytes) = vcs::read_file_at_commit(repo_path, branch, MANIFEST_FILE).await? else {
            return Ok(Self::default_manifest());
        };

        let raw: Value = match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(repo = %repo_path.display(), branch, %err, "unparseable manifest, using defaults");
                return Ok(Self::default_manifest());
            }
        };
        let root = resolve_refs(&raw, branch);

        let fingerprint = vcs::last_commit_for_file(repo_path, branch, MANIFEST_FILE)
            .await?
            .map(|info| short(&info.id))
            .unwrap_or_else(|| "0".to_owned());

        Ok(Self { root, fingerprint })
    }

    /// `public: string|[string]`.
    pub fn public(&self) -> Vec<String> {
        match self.root.get("public") {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn auth(&self) -> Option<&Value> {
        self.root.get("auth")
    }

    pub fn indexed(&self) -> bool {
        self.root
            .get("indexed")
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }

    pub fn filesets(&self) -> Option<Vec<FilesetDef>> {
        let defs = self.root.get("filesets")?;
        match serde_json::from_value(defs.clone()) {
            Ok(defs) => Some(defs),
            Err(err) => {
                warn!(%err, "bad fileset definitions in manifest, using stock set");
                None
            }
        }
    }

    /// The active build profile: `build.profile` is a profile id resolved
    /// against the server settings, or an inline profile object. The
    /// compatibility path accepts a bare `buildable` list on `build`
    /// directly.
    pub fn build_profile(&self, settings: &HashMap<String, BuildProfile>) -> Option<BuildProfile> {
        let build = self.root.get("build")?;
        match build.get("profile") {
            Some(Value::String(id)) => settings.get(id).cloned(),
            Some(inline @ Value::Object(_)) => serde_json::from_value(inline.clone()).ok(),
            _ => serde_json::from_value(build.clone()).ok(),
        }
    }
}

fn short(id: &str) -> String {
    id.chars().take(7).collect()
}

/// Substitute every `{"$ref": "#/a/b"}` node with the referenced subtree.
/// `$SOURCE` inside a reference resolves to the branch name.
fn resolve_refs(root: &Value, branch: &str) -> Value {
    fn walk(node: &Value, root: &Value, branch: &str, depth: usize) -> Value {
        if depth > MAX_REF_DEPTH {
            warn!("manifest $ref nesting too deep, leaving node unresolved");
            return node.clone();
        }
        match node {
            Value::Object(map) => {
                if let Some(Value::String(target)) = map.get("$ref") {
                    let target = target.replace("$SOURCE", branch);
                    if let Some(sub) = pointer(root, &target) {
                        return walk(sub, root, branch, depth + 1);
                    }
                    warn!(target, "dangling manifest $ref");
                    return Value::Null;
                }
                Value::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), walk(v, root, branch, depth + 1)))
                        .collect(),
                )
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| walk(v, root, branch, depth + 1))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
    walk(root, root, branch, 0)
}

fn pointer<'a>(root: &'a Value, target: &str) -> Option<&'a Value> {
    let frag = target.strip_prefix('#').unwrap_or(target);
    root.pointer(frag)
}

/// Manifest cache keyed by `(repo path, branch)` with per-repo
/// invalidation.
pub struct ManifestCache {
    inner: CachingSingleFlight<Arc<Manifest>>,
}

impl ManifestCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: CachingSingleFlight::new(capacity),
        }
    }

    fn cache_key(repo_path: &Path, branch: &str) -> String {
        format!("{}|{}", repo_path.display(), branch)
    }

    pub async fn get(&self, repo_path: &Path, branch: &str) -> anyhow::Result<Arc<Manifest>> {
        let key = Self::cache_key(repo_path, branch);
        let repo_path = repo_path.to_owned();
        let branch = branch.to_owned();
        self.inner
            .run(&key, async move {
                Ok(Arc::new(Manifest::load(&repo_path, &branch).await?))
            })
            .await
            .map_err(|err| anyhow::anyhow!(err))
    }

    pub fn invalidate_repo(&self, repo_path: &Path) {
        self.inner
            .remove_prefix(&format!("{}|", repo_path.display()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_manifest_exposes_public_branch() {
        let manifest = Manifest::default_manifest();
        assert_eq!(manifest.public(), ["public"]);
        assert!(manifest.auth().is_none());
        assert_eq!(manifest.fingerprint, "0");
    }

    #[test]
    fn refs_resolve_with_source_substitution() {
        let raw = json!({
            "branches": {
                "public": { "theme": "light" },
                "staging": { "theme": "dark" }
            },
            "active": { "$ref": "#/branches/$SOURCE" }
        });
        let resolved = resolve_refs(&raw, "staging");
        assert_eq!(resolved["active"]["theme"], "dark");

        let resolved = resolve_refs(&raw, "public");
        assert_eq!(resolved["active"]["theme"], "light");
    }

    #[test]
    fn dangling_refs_become_null() {
        let raw = json!({ "x": { "$ref": "#/missing" } });
        assert_eq!(resolve_refs(&raw, "main")["x"], Value::Null);
    }

    #[test]
    fn build_profile_by_id_and_inline() {
        let mut settings = HashMap::new();
        settings.insert(
            "site".to_owned(),
            BuildProfile {
                buildable: vec!["master".into()],
                commands: vec!["make site".into()],
            },
        );

        let by_id = Manifest {
            root: json!({ "build": { "profile": "site" } }),
            fingerprint: "0".into(),
        };
        assert_eq!(
            by_id.build_profile(&settings).unwrap().buildable,
            ["master"]
        );

        let inline = Manifest {
            root: json!({ "build": { "profile": { "buildable": ["dev"] } } }),
            fingerprint: "0".into(),
        };
        assert_eq!(inline.build_profile(&settings).unwrap().buildable, ["dev"]);

        // earlier manifest shape: buildable directly on `build`
        let legacy = Manifest {
            root: json!({ "build": { "buildable": ["old"] } }),
            fingerprint: "0".into(),
        };
        assert_eq!(legacy.build_profile(&settings).unwrap().buildable, ["old"]);
    }

    #[test]
    fn public_accepts_string_or_list() {
        let manifest = Manifest {
            root: json!({ "public": "main" }),
            fingerprint: "0".into(),
        };
        assert_eq!(manifest.public(), ["main"]);
    }
}
