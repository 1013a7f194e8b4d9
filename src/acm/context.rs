// Per-request auth context: the accessible category set, the derived
// record filter, and the group fingerprint that keys every cached artifact
// the request can see.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{AuthSettings, AuthUser, RewriteSpec};
use crate::content::glob::Complement;
use crate::hash::{fingerprint, fingerprint_json};

/// Serializable description of the request's record filter; the compiled
/// matcher lives next to it.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FilterSpec {
    #[default]
    None,
    Globs {
        includes: Vec<String>,
        excludes: Vec<String>,
    },
    /// Client-visible set: file path -> version the client holds.
    Cvs { versions: BTreeMap<String, String> },
}

#[derive(Clone, Debug, Default)]
pub struct RecordFilter {
    spec: FilterSpec,
    matcher: Option<Complement>,
}

impl RecordFilter {
    pub fn new(spec: FilterSpec) -> anyhow::Result<Self> {
        let matcher = match &spec {
            FilterSpec::Globs { includes, excludes } => {
                Some(Complement::new(includes, excludes)?)
            }
            _ => None,
        };
        Ok(Self { spec, matcher })
    }

    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    pub fn accepts(&self, record: &Value) -> bool {
        let path = record.get("path").and_then(Value::as_str).unwrap_or("");
        match &self.spec {
            FilterSpec::None => true,
            FilterSpec::Globs { .. } => self
                .matcher
                .as_ref()
                .is_some_and(|m| m.matches(path)),
            FilterSpec::Cvs { versions } => {
                let deleted = record.get("status").and_then(Value::as_str) == Some("deleted");
                let commit = record.get("commit").and_then(Value::as_str).unwrap_or("");
                match versions.get(path) {
                    // client holds it: pass when the version moved or it's gone
                    Some(held) => deleted || held != commit,
                    // client never saw it: only additions are news
                    None => !deleted,
                }
            }
        }
    }
}

/// Groups and filter derived from request headers, query and body.
#[derive(Clone, Debug, Default)]
pub struct DerivedAuth {
    pub groups: Vec<String>,
    pub filter: FilterSpec,
}

impl DerivedAuth {
    /// `Accept-Language: ll_CC` contributes a locale group; an explicit
    /// `filter` contributes a fingerprinted glob filter; a CVS body
    /// contributes a `CVS:`-prefixed fingerprint group.
    pub fn derive(
        accept_language: Option<&str>,
        filter_includes: Option<Vec<String>>,
        filter_excludes: Option<Vec<String>>,
        cvs: Option<BTreeMap<String, String>>,
    ) -> Self {
        let mut groups = Vec::new();
        let mut filter = FilterSpec::None;

        if let Some(locale) = accept_language
            .and_then(|h| h.split(',').next())
            .map(|l| l.split(';').next().unwrap_or(l).trim())
            .filter(|l| !l.is_empty())
        {
            groups.push(format!("Accept-Language:{}", locale.replace('-', "_")));
        }

        if filter_includes.is_some() || filter_excludes.is_some() {
            let spec = FilterSpec::Globs {
                includes: filter_includes.unwrap_or_default(),
                excludes: filter_excludes.unwrap_or_default(),
            };
            let canonical = serde_json::to_value(&spec).unwrap_or(Value::Null);
            groups.push(fingerprint_json(&canonical));
            filter = spec;
        }

        if let Some(versions) = cvs {
            let spec = FilterSpec::Cvs { versions };
            let canonical = serde_json::to_value(&spec).unwrap_or(Value::Null);
            groups.push(format!("CVS:{}", fingerprint_json(&canonical)));
            filter = spec;
        }

        Self { groups, filter }
    }
}

#[derive(Clone, Debug)]
pub struct AuthContext {
    pub user_info: AuthUser,
    pub accessible: BTreeSet<String>,
    /// Fingerprint keying everything this request may see.
    pub group: String,
    /// Same fingerprint with client-visible-set groups removed.
    pub dollar_group: String,
    pub filter: RecordFilter,
    pub rewrites: HashMap<String, RewriteSpec>,
}

impl AuthContext {
    pub fn build(
        settings: &AuthSettings,
        user: AuthUser,
        derived: DerivedAuth,
    ) -> anyhow::Result<Self> {
        let mut accessible: BTreeSet<String> = settings
            .filesets
            .unrestricted_categories()
            .into_iter()
            .map(str::to_owned)
            .collect();
        accessible.extend(user.groups.iter().cloned());
        accessible.extend(derived.groups.iter().cloned());

        // canonical member list: categories stand in as their fingerprints
        let canonical: Vec<String> = accessible
            .iter()
            .map(|name| {
                settings
                    .fingerprints
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| name.clone())
            })
            .collect();
        let group = fingerprint(canonical.join(","));

        let without_cvs: Vec<String> = accessible
            .iter()
            .filter(|name| !name.starts_with("CVS:"))
            .map(|name| {
                settings
                    .fingerprints
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| name.clone())
            })
            .collect();
        let dollar_group = fingerprint(without_cvs.join(","));

        Ok(Self {
            user_info: user,
            accessible,
            group,
            dollar_group,
            filter: RecordFilter::new(derived.filter)?,
            rewrites: settings.rewrites.clone(),
        })
    }

    /// ACM gate for one record: drop inaccessible categories, drop filter
    /// rejections, then rewrite. Control records pass through untouched.
    pub fn filter_and_rewrite(&self, record: Value) -> Option<Value> {
        let Some(category) = record.get("category").and_then(Value::as_str) else {
            return Some(record);
        };
        if !self.accessible.contains(category) {
            return None;
        }
        if !self.filter.accepts(&record) {
            return None;
        }
        match self.rewrites.get(category) {
            Some(spec) => spec.apply(record),
            None => Some(record),
        }
    }

    /// JSON shape carried in pipeline vars; only deterministic fields.
    pub fn to_value(&self) -> Value {
        json!({
            "group": self.group,
            "$group": self.dollar_group,
            "user": self.user_info.user,
            "accessible": self.accessible.iter().collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acm::AuthDefaults;
    use crate::repo::Manifest;

    fn settings() -> std::sync::Arc<AuthSettings> {
        let manifest = Manifest::from_parts(
            json!({
                "filesets": [
                    { "category": "pages", "include": ["**/*.html"] },
                    { "category": "premium", "include": ["premium/**/*"], "restricted": true }
                ]
            }),
            "m".to_owned(),
        );
        AuthSettings::build(&manifest, &AuthDefaults::default())
    }

    fn published(path: &str, category: &str, commit: &str) -> Value {
        json!({ "path": path, "category": category, "status": "published", "commit": commit })
    }

    #[test]
    fn group_is_deterministic_and_order_free() {
        let settings = settings();
        let user = AuthUser {
            user: "u".into(),
            authenticated: true,
            groups: vec!["b".into(), "a".into()],
        };
        let a = AuthContext::build(&settings, user.clone(), DerivedAuth::default()).unwrap();
        let user_flipped = AuthUser {
            groups: vec!["a".into(), "b".into()],
            ..user
        };
        let b = AuthContext::build(&settings, user_flipped, DerivedAuth::default()).unwrap();
        assert_eq!(a.group, b.group);
    }

    #[test]
    fn restricted_category_needs_matching_group() {
        let settings = settings();
        let anon =
            AuthContext::build(&settings, AuthUser::anonymous(), DerivedAuth::default()).unwrap();
        assert!(anon
            .filter_and_rewrite(published("premium/a.html", "premium", "c1"))
            .is_none());
        assert!(anon
            .filter_and_rewrite(published("x.html", "pages", "c1"))
            .is_some());

        let member = AuthUser {
            user: "m".into(),
            authenticated: true,
            groups: vec!["premium".into()],
        };
        let ctx = AuthContext::build(&settings, member, DerivedAuth::default()).unwrap();
        assert!(ctx
            .filter_and_rewrite(published("premium/a.html", "premium", "c1"))
            .is_some());
        assert_ne!(ctx.group, anon.group);
    }

    #[test]
    fn dollar_group_excludes_cvs() {
        let settings = settings();
        let derived = DerivedAuth::derive(
            None,
            None,
            None,
            Some(BTreeMap::from([("a.html".to_owned(), "c1".to_owned())])),
        );
        let ctx = AuthContext::build(&settings, AuthUser::anonymous(), derived).unwrap();
        assert_ne!(ctx.group, ctx.dollar_group);

        let plain =
            AuthContext::build(&settings, AuthUser::anonymous(), DerivedAuth::default()).unwrap();
        assert_eq!(ctx.dollar_group, plain.group);
    }

    #[test]
    fn cvs_filter_passes_new_changed_and_deleted() {
        let versions = BTreeMap::from([
            ("a.html".to_owned(), "c1".to_owned()),
            ("b.html".to_owned(), "c1".to_owned()),
        ]);
        let filter = RecordFilter::new(FilterSpec::Cvs { versions }).unwrap();

        // unchanged: client already has it
        assert!(!filter.accepts(&published("a.html", "pages", "c1")));
        // moved on
        assert!(filter.accepts(&published("a.html", "pages", "c2")));
        // new to the client
        assert!(filter.accepts(&published("c.html", "pages", "c2")));
        // deleted and the client holds it
        assert!(filter.accepts(
            &json!({ "path": "b.html", "category": "pages", "status": "deleted", "commit": "c2" })
        ));
        // deleted but never seen
        assert!(!filter.accepts(
            &json!({ "path": "z.html", "category": "pages", "status": "deleted", "commit": "c2" })
        ));
    }

    #[test]
    fn glob_filter_restricts_paths_and_changes_group() {
        let derived = DerivedAuth::derive(None, Some(vec!["docs/**/*".into()]), None, None);
        assert_eq!(derived.groups.len(), 1);
        let ctx = AuthContext::build(&settings(), AuthUser::anonymous(), derived).unwrap();
        assert!(ctx
            .filter_and_rewrite(published("docs/a.html", "pages", "c1"))
            .is_some());
        assert!(ctx
            .filter_and_rewrite(published("other/a.html", "pages", "c1"))
            .is_none());
    }

    #[test]
    fn accept_language_contributes_a_locale_group() {
        let derived = DerivedAuth::derive(Some("fr-FR,fr;q=0.8"), None, None, None);
        assert_eq!(derived.groups, ["Accept-Language:fr_FR"]);
    }
}
