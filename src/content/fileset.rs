// Filesets carve a repo's paths into named categories. Assignment order is
// priority: the first fileset whose include-minus-exclude matches a path
// owns it, and a path belongs to at most one fileset.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::glob::{Complement, GlobError};
use super::processors::ProcessorKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheScope {
    App,
    #[default]
    Content,
    None,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilesetDef {
    pub category: String,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub cache: CacheScope,
    #[serde(default, rename = "cacheControl")]
    pub cache_control: Option<String>,
    #[serde(default = "default_searchable")]
    pub searchable: bool,
    #[serde(default)]
    pub restricted: bool,
    #[serde(default)]
    pub acm: Option<Value>,
    #[serde(default)]
    pub processor: ProcessorKind,
}

fn default_searchable() -> bool {
    true
}

pub struct Fileset {
    pub def: FilesetDef,
    pub priority: usize,
    matcher: Complement,
}

impl Fileset {
    pub fn category(&self) -> &str {
        &self.def.category
    }

    pub fn matches(&self, path: &str) -> bool {
        self.matcher.matches(path)
    }

    pub fn processor(&self) -> ProcessorKind {
        self.def.processor
    }
}

/// The materialized, priority-ordered fileset list for one branch version.
pub struct Filesets {
    list: Vec<Fileset>,
}

impl Filesets {
    pub fn from_defs(defs: Vec<FilesetDef>) -> Result<Self, GlobError> {
        let list = defs
            .into_iter()
            .enumerate()
            .map(|(priority, def)| {
                let matcher = Complement::new(&def.include, &def.exclude)?;
                Ok(Fileset {
                    def,
                    priority,
                    matcher,
                })
            })
            .collect::<Result<_, GlobError>>()?;
        Ok(Self { list })
    }

    /// The stock layout served when a repo's manifest does not define its
    /// own filesets.
    pub fn default_set() -> Self {
        let defs = vec![
            FilesetDef {
                category: "app".into(),
                include: vec!["app/**/*.json".into()],
                exclude: vec![],
                cache: CacheScope::App,
                cache_control: Some("no-cache".into()),
                searchable: false,
                restricted: false,
                acm: None,
                processor: ProcessorKind::JsonParse,
            },
            FilesetDef {
                category: "pages".into(),
                include: vec!["**/*.html".into()],
                exclude: vec![],
                cache: CacheScope::Content,
                cache_control: None,
                searchable: true,
                restricted: false,
                acm: None,
                processor: ProcessorKind::HtmlRewrite,
            },
            FilesetDef {
                category: "data".into(),
                include: vec!["data/**/*.json".into()],
                exclude: vec![],
                cache: CacheScope::Content,
                cache_control: None,
                searchable: false,
                restricted: false,
                acm: None,
                processor: ProcessorKind::JsonParse,
            },
            FilesetDef {
                category: "files".into(),
                include: vec!["**/*".into()],
                exclude: vec!["locomote.json".into(), "errors/*".into()],
                cache: CacheScope::Content,
                cache_control: None,
                searchable: false,
                restricted: false,
                acm: None,
                processor: ProcessorKind::Raw,
            },
        ];
        Self::from_defs(defs).expect("stock fileset globs compile")
    }

    /// First fileset in priority order accepting `path`.
    pub fn owner(&self, path: &str) -> Option<&Fileset> {
        self.list.iter().find(|fs| fs.matches(path))
    }

    pub fn get(&self, category: &str) -> Option<&Fileset> {
        self.list.iter().find(|fs| fs.category() == category)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fileset> {
        self.list.iter()
    }

    pub fn unrestricted_categories(&self) -> Vec<&str> {
        self.list
            .iter()
            .filter(|fs| !fs.def.restricted)
            .map(Fileset::category)
            .collect()
    }
}

/// Lifecycle state of a file record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Published,
    Deleted,
}

/// One entry in a file manifest. Deleted records never carry
/// processor-specific fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub category: String,
    pub status: Status,
    pub commit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl FileRecord {
    pub fn deleted(path: &str, category: &str, commit: &str) -> Self {
        Self {
            path: path.to_owned(),
            category: category.to_owned(),
            status: Status::Deleted,
            commit: commit.to_owned(),
            page: None,
            data: None,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("file record serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_fileset_owns_the_path() {
        let sets = Filesets::default_set();
        assert_eq!(sets.owner("index.html").unwrap().category(), "pages");
        assert_eq!(sets.owner("data/menu.json").unwrap().category(), "data");
        assert_eq!(sets.owner("app/config.json").unwrap().category(), "app");
        assert_eq!(sets.owner("images/logo.png").unwrap().category(), "files");
    }

    #[test]
    fn excluded_paths_have_no_owner_in_that_set() {
        let sets = Filesets::default_set();
        assert!(sets.owner("locomote.json").is_none());
        assert!(sets.owner("errors/404.html").is_some()); // pages matches first
    }

    #[test]
    fn priority_follows_assignment_order() {
        let defs = vec![
            FilesetDef {
                category: "first".into(),
                include: vec!["**/*.txt".into()],
                exclude: vec![],
                cache: CacheScope::Content,
                cache_control: None,
                searchable: true,
                restricted: false,
                acm: None,
                processor: ProcessorKind::Raw,
            },
            FilesetDef {
                category: "second".into(),
                include: vec!["**/*".into()],
                exclude: vec![],
                cache: CacheScope::Content,
                cache_control: None,
                searchable: true,
                restricted: false,
                acm: None,
                processor: ProcessorKind::Raw,
            },
        ];
        let sets = Filesets::from_defs(defs).unwrap();
        assert_eq!(sets.owner("a.txt").unwrap().category(), "first");
        assert_eq!(sets.owner("a.bin").unwrap().category(), "second");
    }

    #[test]
    fn deleted_records_carry_no_processor_fields() {
        let rec = FileRecord::deleted("a.html", "pages", "c2");
        let value = rec.to_value();
        assert!(value.get("page").is_none());
        assert!(value.get("data").is_none());
        assert_eq!(value["status"], "deleted");
    }
}
