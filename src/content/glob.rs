// Path globs: `?` matches one non-separator, `*` any run of them, `**/`
// zero or more whole segments. `.` is literal. A glob compiles to an
// anchored regular expression once, at definition time.

use regex::Regex;

#[derive(thiserror::Error, Debug)]
#[error("invalid glob `{pattern}`: {source}")]
pub struct GlobError {
    pattern: String,
    source: regex::Error,
}

#[derive(Clone, Debug)]
pub struct Glob {
    source: String,
    re: Regex,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self, GlobError> {
        let re = Regex::new(&translate(pattern)).map_err(|source| GlobError {
            pattern: pattern.to_owned(),
            source,
        })?;
        Ok(Self {
            source: pattern.to_owned(),
            re,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.re.is_match(path)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

fn translate(pattern: &str) -> String {
    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');

    let mut rest = pattern;
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix("**/") {
            re.push_str("(?:[^/]+/)*");
            rest = tail;
            continue;
        }
        let ch = rest.chars().next().unwrap();
        match ch {
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            _ => re.push_str(&regex::escape(&ch.to_string())),
        }
        rest = &rest[ch.len_utf8()..];
    }

    re.push('$');
    re
}

/// Matches when any member glob matches.
#[derive(Clone, Debug, Default)]
pub struct GlobSet {
    globs: Vec<Glob>,
}

impl GlobSet {
    pub fn new(patterns: &[String]) -> Result<Self, GlobError> {
        Ok(Self {
            globs: patterns
                .iter()
                .map(|p| Glob::new(p))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.globs.is_empty()
    }

    pub fn matches(&self, path: &str) -> bool {
        self.globs.iter().any(|g| g.matches(path))
    }
}

/// Matches iff the includes match and the excludes do not.
#[derive(Clone, Debug, Default)]
pub struct Complement {
    includes: GlobSet,
    excludes: GlobSet,
}

impl Complement {
    pub fn new(includes: &[String], excludes: &[String]) -> Result<Self, GlobError> {
        Ok(Self {
            includes: GlobSet::new(includes)?,
            excludes: GlobSet::new(excludes)?,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.includes.matches(path) && !self.excludes.matches(path)
    }

    pub fn filter<'a>(&'a self, paths: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
        paths.filter(|p| self.matches(p)).collect()
    }
}
