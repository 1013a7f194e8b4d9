// Minimal accept-header parsing: values ordered by quality then by
// position. Enough for the resolver chain; no wildcard expansion beyond
// `*` / `*/*`.

#[derive(Clone, Debug, Default)]
pub struct AcceptHeaders {
    pub media_types: Vec<String>,
    pub languages: Vec<String>,
    pub charsets: Vec<String>,
}

impl AcceptHeaders {
    pub fn parse(
        accept: Option<&str>,
        accept_language: Option<&str>,
        accept_charset: Option<&str>,
    ) -> Self {
        Self {
            media_types: parse_list(accept, false),
            languages: parse_list(accept_language, true),
            charsets: parse_list(accept_charset, false),
        }
    }

    pub fn accepts_html(&self) -> bool {
        self.media_types
            .iter()
            .any(|m| m == "text/html" || m == "*/*" || m == "*")
    }

    pub fn cache_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.media_types.join(","),
            self.languages.join(","),
            self.charsets.join(",")
        )
    }
}

fn parse_list(header: Option<&str>, primary_tag: bool) -> Vec<String> {
    let Some(header) = header else {
        return Vec::new();
    };

    let mut entries: Vec<(f32, usize, String)> = header
        .split(',')
        .enumerate()
        .filter_map(|(pos, part)| {
            let mut pieces = part.trim().split(';');
            let mut value = pieces.next()?.trim().to_ascii_lowercase();
            if value.is_empty() {
                return None;
            }
            if primary_tag {
                // `fr-FR` and `fr_FR` both negotiate as `fr`
                value = value
                    .split(['-', '_'])
                    .next()
                    .unwrap_or(&value)
                    .to_owned();
            }
            let q = pieces
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.parse::<f32>().ok())
                .unwrap_or(1.0);
            Some((q, pos, value))
        })
        .collect();

    entries.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.cmp(&b.1)));

    let mut seen = Vec::new();
    for (_, _, value) in entries {
        if !seen.contains(&value) {
            seen.push(value);
        }
    }
    seen
}
