//! Tokenization and path-anchor extraction.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

const PATH_LIKE: &str = r"(?:[A-Za-z]:[\\/])?[A-Za-z0-9_.-]+(?:[\\/][A-Za-z0-9_.-]+)+";

fn path_regex() -> Option<&'static Regex> {
    static PATH_RE: OnceLock<Option<Regex>> = OnceLock::new();
    PATH_RE.get_or_init(|| Regex::new(PATH_LIKE).ok()).as_ref()
}

/// Insert a space at every lower/digit -> upper boundary ("QuickStart" -> "Quick Start").
fn split_camel(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 8);
    let mut prev: Option<char> = None;
    for ch in text.chars() {
        if ch.is_ascii_uppercase()
            && prev.is_some_and(|p| p.is_ascii_lowercase() || p.is_ascii_digit())
        {
            out.push(' ');
        }
        out.push(ch);
        prev = Some(ch);
    }
    out
}

/// Unique lowercase alphanumeric terms of at least two characters.
///
/// camelCase, `_` and `-` all act as word boundaries.
pub fn tokenize(text: &str) -> BTreeSet<String> {
    if text.is_empty() {
        return BTreeSet::new();
    }
    split_camel(text)
        .to_lowercase()
        .split(|c: char| !(c.is_ascii_lowercase() || c.is_ascii_digit()))
        .filter(|token| token.len() >= 2)
        .map(str::to_string)
        .collect()
}

/// Sorted, space-joined title tokens (at most `max_tokens`).
pub fn normalized_title(title: &str, max_tokens: usize) -> String {
    tokenize(title)
        .into_iter()
        .take(max_tokens)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Jaccard overlap of two token sets; 0.0 when either is empty.
pub(crate) fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let inter = a.intersection(b).count();
    if inter == 0 {
        return 0.0;
    }
    let union = a.union(b).count();
    inter as f64 / union as f64
}

/// Jaccard overlap of tokenized titles.
pub fn title_jaccard(a: &str, b: &str) -> f64 {
    jaccard(&tokenize(a), &tokenize(b))
}

/// Path-like substrings, lowercased with forward slashes.
pub fn extract_path_anchors<'a>(chunks: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    let mut anchors = BTreeSet::new();
    let Some(re) = path_regex() else {
        return anchors;
    };
    for chunk in chunks {
        for m in re.find_iter(chunk) {
            anchors.insert(m.as_str().to_lowercase().replace('\\', "/"));
        }
    }
    anchors
}

/// Add each anchor's basename and last two segments.
pub(crate) fn expand_path_anchors(anchors: &BTreeSet<String>) -> BTreeSet<String> {
    let mut expanded = BTreeSet::new();
    for raw in anchors {
        let anchor = raw.trim().to_lowercase().replace('\\', "/");
        if anchor.is_empty() {
            continue;
        }
        let parts: Vec<&str> = anchor.split('/').filter(|p| !p.is_empty()).collect();
        if let Some(last) = parts.last() {
            expanded.insert(last.to_string());
        }
        if parts.len() >= 2 {
            expanded.insert(parts[parts.len() - 2..].join("/"));
        }
        expanded.insert(anchor);
    }
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(text: &str) -> Vec<String> {
        tokenize(text).into_iter().collect()
    }

    #[test]
    fn camel_case_and_separators_split() {
        assert_eq!(toks("QuickStart guide"), vec!["guide", "quick", "start"]);
        assert_eq!(toks("run_failure-event"), vec!["event", "failure", "run"]);
        assert_eq!(toks("parseV2Output"), vec!["output", "parse", "v2"]);
    }

    #[test]
    fn short_tokens_dropped() {
        assert_eq!(toks("a C:\\x b"), Vec::<String>::new());
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn title_jaccard_bounds() {
        assert_eq!(title_jaccard("Fix docs", "fix DOCS"), 1.0);
        assert_eq!(title_jaccard("", "fix"), 0.0);
        let half = title_jaccard("fix docs", "fix config");
        assert!((half - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn path_anchors_normalized() {
        let anchors = extract_path_anchors(["see Src\\Runner\\Main.rs and docs/README.md"]);
        assert!(anchors.contains("src/runner/main.rs"));
        assert!(anchors.contains("docs/readme.md"));
    }

    #[test]
    fn anchors_expand_to_suffixes() {
        let base: BTreeSet<String> = ["crates/core/src/lib.rs".to_string()].into();
        let expanded = expand_path_anchors(&base);
        assert!(expanded.contains("lib.rs"));
        assert!(expanded.contains("src/lib.rs"));
        assert!(expanded.contains("crates/core/src/lib.rs"));
    }

    #[test]
    fn normalized_title_is_sorted_and_capped() {
        assert_eq!(normalized_title("Zeta alpha Beta", 2), "alpha beta");
    }
}
