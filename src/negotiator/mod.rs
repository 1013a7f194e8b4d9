// Content negotiation over `index.*` representation files. A directory
// holding `index.html` and `index.fr.html` is one resource with two
// representations; the negotiator picks the best one for a request's
// accept headers and capability groups.

pub mod accept;
pub mod cache;

use std::collections::HashMap;

use accept::AcceptHeaders;
pub use cache::ResourcesCache;

const ENCODINGS: &[&str] = &[
    "ascii", "latin1", "iso8859-1", "ucs-2", "ucs2", "ucs-16le", "ucs16le", "utf-8", "utf8",
    "base64", "hex", "gzip",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Representation {
    pub path: String,
    pub mime_type: Option<String>,
    pub language: Option<String>,
    pub encoding: Option<String>,
    pub group: Option<String>,
}

impl Representation {
    /// Attribute key in resolver-chain order, `*` for wildcards.
    pub fn key(&self) -> [String; 4] {
        let star = || "*".to_owned();
        [
            self.mime_type.clone().unwrap_or_else(star),
            self.language.clone().unwrap_or_else(star),
            self.encoding.clone().unwrap_or_else(star),
            self.group.clone().unwrap_or_else(star),
        ]
    }
}

/// Classify one `index.*` file name into a representation. Extension
/// components are, in order of preference: a MIME type (via the extension
/// table), a two-letter language, a known encoding, otherwise a capability
/// group.
pub fn classify(path: &str) -> Option<Representation> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let exts = name.strip_prefix("index.")?;
    if exts.is_empty() {
        return None;
    }

    let mut rep = Representation {
        path: path.to_owned(),
        mime_type: None,
        language: None,
        encoding: None,
        group: None,
    };

    for ext in exts.split('.') {
        if rep.mime_type.is_none() {
            if let Some(mime) = mime_for_ext(ext) {
                rep.mime_type = Some(mime);
                continue;
            }
        }
        let lower = ext.to_ascii_lowercase();
        if rep.language.is_none() && lower.len() == 2 && lower.bytes().all(|b| b.is_ascii_alphabetic())
        {
            rep.language = Some(lower);
        } else if rep.encoding.is_none() && ENCODINGS.contains(&lower.as_str()) {
            rep.encoding = Some(lower);
        } else if rep.group.is_none() {
            rep.group = Some(ext.to_owned());
        }
    }
    Some(rep)
}

fn mime_for_ext(ext: &str) -> Option<String> {
    let mime = mime_guess::from_ext(ext).first()?;
    matches!(
        mime.type_().as_str(),
        "application" | "audio" | "font" | "image" | "text" | "video"
    )
    .then(|| mime.essence_str().to_owned())
}

/// All representations of one resource (one parent directory), in file
/// listing order.
#[derive(Clone, Debug, Default)]
pub struct Bundle {
    reps: Vec<Representation>,
}

impl Bundle {
    pub fn push(&mut self, rep: Representation) {
        self.reps.push(rep);
    }

    pub fn has_groups(&self) -> bool {
        self.reps.iter().any(|r| r.group.is_some())
    }

    /// Resolver chain: media type, language, charset, then capability
    /// group. Each level keeps exact matches when it can resolve a value,
    /// falls back to wildcard representations, and passes everything
    /// through when it cannot resolve at all.
    pub fn choose(&self, accept: &AcceptHeaders, user_groups: &[String]) -> Option<&Representation> {
        let mut cands: Vec<&Representation> = self.reps.iter().collect();

        cands = resolve_level(cands, &accept.media_types, |r| r.mime_type.as_deref());
        cands = resolve_level(cands, &accept.languages, |r| r.language.as_deref());
        cands = resolve_level(cands, &accept.charsets, |r| r.encoding.as_deref());

        // group level: first declared group the user actually holds
        let declared: Vec<&str> = cands.iter().filter_map(|r| r.group.as_deref()).collect();
        if let Some(chosen) = declared
            .iter()
            .find(|g| user_groups.iter().any(|u| u == *g))
        {
            cands.retain(|r| r.group.as_deref() == Some(*chosen));
        } else {
            let wild: Vec<&Representation> =
                cands.iter().copied().filter(|r| r.group.is_none()).collect();
            if !wild.is_empty() {
                cands = wild;
            }
        }

        cands.first().copied()
    }
}

fn resolve_level<'a>(
    cands: Vec<&'a Representation>,
    wanted: &[String],
    attr: impl Fn(&Representation) -> Option<&str>,
) -> Vec<&'a Representation> {
    for want in wanted {
        if want == "*" || want == "*/*" {
            break;
        }
        let exact: Vec<&Representation> = cands
            .iter()
            .copied()
            .filter(|r| attr(r) == Some(want.as_str()))
            .collect();
        if !exact.is_empty() {
            return exact;
        }
    }
    let wild: Vec<&Representation> = cands.iter().copied().filter(|r| attr(r).is_none()).collect();
    if !wild.is_empty() {
        return wild;
    }
    cands
}

/// Representation bundles for every resource of one branch version, keyed
/// by parent directory ("" for the repo root).
#[derive(Clone, Debug, Default)]
pub struct Resources {
    bundles: HashMap<String, Bundle>,
}

impl Resources {
    pub fn from_paths<'a>(paths: impl Iterator<Item = &'a str>) -> Self {
        let mut bundles: HashMap<String, Bundle> = HashMap::new();
        for path in paths {
            if let Some(rep) = classify(path) {
                bundles
                    .entry(parent_resource_path(path).trim_end_matches('/').to_owned())
                    .or_default()
                    .push(rep);
            }
        }
        Self { bundles }
    }

    pub fn bundle(&self, resource: &str) -> Option<&Bundle> {
        self.bundles.get(resource.trim_matches('/'))
    }

    pub fn has_groups(&self) -> bool {
        self.bundles.values().any(Bundle::has_groups)
    }

    /// Resolve a request path to the representation that should serve it.
    /// Empty paths and trailing slashes are directory references; a path
    /// naming a directory with a bundle negotiates, everything else passes
    /// through unchanged.
    pub fn representation_path(
        &self,
        request_path: &str,
        accept: &AcceptHeaders,
        user_groups: &[String],
    ) -> String {
        let normalized = request_path.trim_matches('/');

        if let Some(bundle) = self.bundle(normalized) {
            if let Some(rep) = bundle.choose(accept, user_groups) {
                return rep.path.clone();
            }
        }

        // a direct request for some index.* file renegotiates within its
        // own resource
        let name = normalized.rsplit('/').next().unwrap_or(normalized);
        if name.starts_with("index.") {
            let parent = parent_resource_path(normalized);
            if let Some(rep) = self
                .bundle(&parent)
                .and_then(|b| b.choose(accept, user_groups))
            {
                return rep.path.clone();
            }
        }

        if normalized.is_empty() {
            "index.html".to_owned()
        } else if request_path.ends_with('/') {
            format!("{normalized}/index.html")
        } else {
            normalized.to_owned()
        }
    }

    /// Whether `path` is the representation negotiation would pick for its
    /// own resource; non-representation paths trivially are.
    pub fn is_preferred_path(
        &self,
        path: &str,
        accept: &AcceptHeaders,
        user_groups: &[String],
    ) -> bool {
        let name = path.rsplit('/').next().unwrap_or(path);
        if !name.starts_with("index.") {
            return true;
        }
        match self
            .bundle(&parent_resource_path(path))
            .and_then(|b| b.choose(accept, user_groups))
        {
            Some(rep) => rep.path == path,
            None => true,
        }
    }

    /// Key identifying a negotiation decision, for upstream response
    /// caches: the accept headers, plus the auth group when capability
    /// groups participate.
    pub fn context_key(&self, accept: &AcceptHeaders, auth_group: &str) -> String {
        let mut key = accept.cache_key();
        if self.has_groups() {
            key.push(':');
            key.push_str(auth_group);
        }
        key
    }
}

/// Resource path owning a representation file: the path with the `index.*`
/// filename stripped.
pub fn parent_resource_path(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, _)) => format!("{parent}/"),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(media: &str, lang: &str) -> AcceptHeaders {
        AcceptHeaders::parse(Some(media), Some(lang), None)
    }

    #[test]
    fn classifies_language_and_type() {
        let rep = classify("page/index.fr.html").unwrap();
        assert_eq!(rep.mime_type.as_deref(), Some("text/html"));
        assert_eq!(rep.language.as_deref(), Some("fr"));
        assert_eq!(rep.group, None);

        let rep = classify("index.utf-8.json").unwrap();
        assert_eq!(rep.mime_type.as_deref(), Some("application/json"));
        assert_eq!(rep.encoding.as_deref(), Some("utf-8"));
    }

    #[test]
    fn unknown_extension_becomes_a_group() {
        let rep = classify("index.staff.html").unwrap();
        assert_eq!(rep.group.as_deref(), Some("staff"));
    }

    #[test]
    fn negotiates_language_with_fallback() {
        let resources =
            Resources::from_paths(["page/index.html", "page/index.fr.html"].into_iter());

        let path = resources.representation_path("/page", &accept("text/html", "fr"), &[]);
        assert_eq!(path, "page/index.fr.html");

        let path = resources.representation_path("/page", &accept("text/html", "de"), &[]);
        assert_eq!(path, "page/index.html");
    }

    #[test]
    fn group_representation_requires_membership() {
        let resources =
            Resources::from_paths(["a/index.html", "a/index.staff.html"].into_iter());
        let hdrs = accept("text/html", "en");

        let path = resources.representation_path("a/", &hdrs, &["staff".to_owned()]);
        assert_eq!(path, "a/index.staff.html");

        let path = resources.representation_path("a/", &hdrs, &[]);
        assert_eq!(path, "a/index.html");
    }

    #[test]
    fn plain_paths_pass_through() {
        let resources = Resources::from_paths(["page/index.html"].into_iter());
        let path = resources.representation_path("img/logo.png", &accept("*/*", "en"), &[]);
        assert_eq!(path, "img/logo.png");
    }

    #[test]
    fn empty_path_is_the_root_resource() {
        let resources = Resources::from_paths(["index.html", "index.fr.html"].into_iter());
        let path = resources.representation_path("", &accept("text/html", "fr"), &[]);
        assert_eq!(path, "index.fr.html");
    }

    #[test]
    fn choose_round_trips_a_fully_specified_representation() {
        let mut bundle = Bundle::default();
        let rep = classify("p/index.fr.utf-8.html").unwrap();
        bundle.push(classify("p/index.html").unwrap());
        bundle.push(rep.clone());

        let hdrs = AcceptHeaders::parse(Some("text/html"), Some("fr"), Some("utf-8"));
        assert_eq!(bundle.choose(&hdrs, &[]), Some(&rep));
    }

    #[test]
    fn preferred_path_tracks_negotiation() {
        let resources =
            Resources::from_paths(["p/index.html", "p/index.fr.html"].into_iter());
        let fr = accept("text/html", "fr");
        assert!(resources.is_preferred_path("p/index.fr.html", &fr, &[]));
        assert!(!resources.is_preferred_path("p/index.html", &fr, &[]));
        assert!(resources.is_preferred_path("other/file.css", &fr, &[]));
    }

    #[test]
    fn parent_resource_path_strips_the_filename() {
        assert_eq!(parent_resource_path("a/b/index.html"), "a/b/");
        assert_eq!(parent_resource_path("index.html"), "");
    }
}
