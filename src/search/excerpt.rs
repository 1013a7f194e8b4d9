// Result excerpts: a window of the matched document centered on the first
// occurrence of any term, with every term occurrence wrapped in <em> and
// ellipses marking trimmed edges.

use regex::RegexBuilder;

pub const EXCERPT_LEN: usize = 500;

pub fn excerpt(content: &str, terms: &[String], max_len: usize) -> String {
    let matcher = match term_regex(terms) {
        Some(re) => re,
        None => return String::new(),
    };

    let first = matcher.find(content).map(|m| m.start()).unwrap_or(0);

    // center the window on the first match
    let mut start = first.saturating_sub(max_len / 2);
    let mut end = (start + max_len).min(content.len());
    if end - start < max_len {
        start = end.saturating_sub(max_len);
    }
    while start > 0 && !content.is_char_boundary(start) {
        start -= 1;
    }
    while end < content.len() && !content.is_char_boundary(end) {
        end += 1;
    }

    let window = &content[start..end];
    let highlighted = matcher.replace_all(window, "<em>$0</em>");

    let mut out = String::with_capacity(highlighted.len() + 2);
    if start > 0 {
        out.push('…');
    }
    out.push_str(&highlighted);
    if end < content.len() {
        out.push('…');
    }
    out
}

fn term_regex(terms: &[String]) -> Option<regex::Regex> {
    let alternatives: Vec<String> = terms
        .iter()
        .filter(|t| !t.is_empty())
        .map(|t| regex::escape(t))
        .collect();
    if alternatives.is_empty() {
        return None;
    }
    RegexBuilder::new(&alternatives.join("|"))
        .case_insensitive(true)
        .build()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn highlights_all_occurrences_case_insensitively() {
        let out = excerpt("Rust is fun. I like rust a lot.", &terms(&["rust"]), 500);
        assert_eq!(out, "<em>Rust</em> is fun. I like <em>rust</em> a lot.");
    }

    #[test]
    fn window_is_centered_on_the_first_match_of_any_term() {
        let padding = "x".repeat(600);
        let content = format!("{padding} needle {padding}");
        let out = excerpt(&content, &terms(&["needle"]), 100);
        assert!(out.starts_with('…'));
        assert!(out.ends_with('…'));
        assert!(out.contains("<em>needle</em>"));
        // payload inside the ellipses stays within the window plus markup
        assert!(out.len() <= 100 + "<em></em>".len() + 2 * '…'.len_utf8());
    }

    #[test]
    fn no_leading_ellipsis_when_match_is_at_the_start() {
        let out = excerpt("needle in a short haystack", &terms(&["needle"]), 500);
        assert!(out.starts_with("<em>needle</em>"));
        assert!(!out.ends_with('…'));
    }

    #[test]
    fn earliest_term_wins_when_several_match() {
        let content = format!("alpha {} beta", "y".repeat(600));
        let out = excerpt(&content, &terms(&["beta", "alpha"]), 50);
        assert!(out.contains("<em>alpha</em>"));
        assert!(!out.contains("<em>beta</em>"));
    }

    #[test]
    fn respects_utf8_boundaries() {
        let content = format!("{} çédille {}", "é".repeat(300), "è".repeat(300));
        let out = excerpt(&content, &terms(&["çédille"]), 100);
        assert!(out.contains("<em>çédille</em>"));
    }
}
