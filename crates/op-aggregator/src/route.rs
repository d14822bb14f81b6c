//! Online route generalization.
//!
//! Paths are folded into route keys as they arrive: once two paths differ
//! only in an identifier-like segment, the stored key is renamed with `*` at
//! that position and every later path of the same shape lands on it.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

pub const WILDCARD: &str = "*";

static UUID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:[0-9a-f]{8}-[0-9a-f]{4}-[1-5][0-9a-f]{3}-[0-9a-f]{4}-[0-9a-f]{12}|[0-9a-f]{12}[1-5][0-9a-f]{19})$",
    )
    .expect("uuid pattern is valid")
});

static NUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+$").expect("numeric pattern is valid"));

static ALPHANUMERIC_MIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[a-z0-9]*(?:[0-9][a-z]|[a-z][0-9])[a-z0-9]*$")
        .expect("alphanumeric pattern is valid")
});

/// Whether a path segment looks like an identifier rather than a word.
pub fn is_identifier(segment: &str) -> bool {
    UUID.is_match(segment) || NUMERIC.is_match(segment) || ALPHANUMERIC_MIX.is_match(segment)
}

/// Turn a raw request path into a route candidate.
///
/// Query string and fragment are discarded, then a single leading and a
/// single trailing `/` are stripped. The root path stays `/`.
pub fn candidate_path(raw: &str) -> String {
    let path = raw.split(['?', '#']).next().unwrap_or_default();
    if path == "/" || path.is_empty() {
        return "/".to_string();
    }
    let path = path.strip_prefix('/').unwrap_or(path);
    let path = path.strip_suffix('/').unwrap_or(path);
    path.to_string()
}

enum Comparison {
    /// Equal segment by segment, or equal through an existing wildcard.
    Match,
    /// Matches once this position is replaced with `*`.
    Generalize(usize),
    Mismatch,
}

/// Walk from the last segment to the first; the first differing segment
/// decides the outcome and everything before it is not looked at.
fn compare(path: &[&str], key: &[&str]) -> Comparison {
    for j in (0..path.len()).rev() {
        if path[j] == key[j] {
            continue;
        }
        let prev_equal = j == 0 || path[j - 1] == key[j - 1];
        if !prev_equal || !is_identifier(path[j]) {
            return Comparison::Mismatch;
        }
        if key[j] == WILDCARD {
            return Comparison::Match;
        }
        if j > 0 && is_identifier(key[j]) {
            return Comparison::Generalize(j);
        }
        return Comparison::Mismatch;
    }
    Comparison::Match
}

/// Find the stored route `path` belongs to, generalizing a stored key when
/// needed.
///
/// When a stored key is generalized the entry is moved to its new key, so the
/// aggregate is never duplicated. Keys are tried in map order; the first that
/// fits wins.
pub fn match_route<V>(path: &str, routes: &mut BTreeMap<String, V>) -> Option<String> {
    if path == "/" {
        return routes.contains_key("/").then(|| "/".to_string());
    }

    let path = path.strip_suffix('/').unwrap_or(path);
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() == 1 {
        return routes.contains_key(path).then(|| path.to_string());
    }

    let mut renamed: Option<(String, String)> = None;
    for key in routes.keys() {
        let mut key_segments: Vec<&str> = key.split('/').collect();
        if key_segments.len() != segments.len() {
            continue;
        }
        match compare(&segments, &key_segments) {
            Comparison::Match => return Some(key.clone()),
            Comparison::Generalize(j) => {
                key_segments[j] = WILDCARD;
                renamed = Some((key.clone(), key_segments.join("/")));
                break;
            }
            Comparison::Mismatch => continue,
        }
    }

    let (old_key, new_key) = renamed?;
    // If the generalized key already exists the old entry is left alone and
    // the path joins the existing one.
    if !routes.contains_key(&new_key) {
        if let Some(aggregate) = routes.remove(&old_key) {
            tracing::debug!(from = %old_key, to = %new_key, "route generalized");
            routes.insert(new_key.clone(), aggregate);
        }
    }
    Some(new_key)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn routes(keys: &[&str]) -> BTreeMap<String, u32> {
        keys.iter()
            .enumerate()
            .map(|(i, k)| (k.to_string(), i as u32))
            .collect()
    }

    #[test]
    fn identifier_detection() {
        assert!(is_identifier("123"));
        assert!(is_identifier("abc123"));
        assert!(is_identifier("123abc"));
        assert!(is_identifier("5f1d7a9e"));
        assert!(is_identifier("550e8400-e29b-41d4-a716-446655440000"));
        assert!(is_identifier("550e8400e29b41d4a716446655440000"));
        assert!(!is_identifier("users"));
        assert!(!is_identifier("list"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("user-profile"));
    }

    #[test]
    fn candidate_strips_one_slash_each_side() {
        assert_eq!(candidate_path("/"), "/");
        assert_eq!(candidate_path("/api/users/"), "api/users");
        assert_eq!(candidate_path("/api/users"), "api/users");
        assert_eq!(candidate_path("/search?q=1"), "search");
        assert_eq!(candidate_path("//double"), "/double");
    }

    #[test]
    fn root_matches_only_when_present() {
        let mut empty: BTreeMap<String, u32> = BTreeMap::new();
        assert_eq!(match_route("/", &mut empty), None);
        let mut r = routes(&["/"]);
        assert_eq!(match_route("/", &mut r).as_deref(), Some("/"));
    }

    #[test]
    fn single_segment_is_a_direct_lookup() {
        let mut r = routes(&["health", "123"]);
        assert_eq!(match_route("health", &mut r).as_deref(), Some("health"));
        assert_eq!(match_route("456", &mut r), None);
    }

    #[test]
    fn identifiers_generalize_and_rename() {
        let mut r = routes(&["bucket/111"]);
        assert_eq!(match_route("bucket/222", &mut r).as_deref(), Some("bucket/*"));
        assert!(r.contains_key("bucket/*"));
        assert!(!r.contains_key("bucket/111"));
        assert_eq!(r.len(), 1);
        // Aggregate moved, not copied.
        assert_eq!(r["bucket/*"], 0);
    }

    #[test]
    fn generalized_key_absorbs_later_identifiers() {
        let mut r = routes(&["bucket/*"]);
        assert_eq!(match_route("bucket/333", &mut r).as_deref(), Some("bucket/*"));
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn words_never_generalize() {
        let mut r = routes(&["users/list"]);
        assert_eq!(match_route("users/count", &mut r), None);
        assert!(r.contains_key("users/list"));
    }

    #[test]
    fn first_segment_is_never_generalized() {
        let mut r = routes(&["1/items"]);
        assert_eq!(match_route("2/items", &mut r), None);
    }

    #[test]
    fn wildcard_decides_before_earlier_segments() {
        let mut r = routes(&["v1/users/*"]);
        assert_eq!(match_route("v2/users/42", &mut r).as_deref(), Some("v1/users/*"));
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn only_the_last_differing_identifier_generalizes() {
        let mut r = routes(&["a/b/1/c/2"]);
        assert_eq!(match_route("a/b/3/c/4", &mut r).as_deref(), Some("a/b/1/c/*"));
        assert!(r.contains_key("a/b/1/c/*"));
        assert!(!r.contains_key("a/b/1/c/2"));
    }

    #[test]
    fn mismatch_before_an_identifier_is_not_a_match() {
        let mut r = routes(&["v1/users/*"]);
        assert_eq!(match_route("v1/groups/42", &mut r), None);
    }

    #[test]
    fn segment_counts_must_agree() {
        let mut r = routes(&["api/users/1"]);
        assert_eq!(match_route("api/users/1/posts", &mut r), None);
    }

    #[test]
    fn exact_multi_segment_match() {
        let mut r = routes(&["api/users/list"]);
        assert_eq!(
            match_route("api/users/list", &mut r).as_deref(),
            Some("api/users/list")
        );
    }
}
