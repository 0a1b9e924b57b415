//! Small helpers shared by the repositories.

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Characters with meaning in `to_tsquery` input
static TS_QUERY_SPECIAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[&|!():*<>'\\]").expect("valid tsquery regex"));

/// Turn free text into a `to_tsquery` expression.
///
/// Every whitespace separated token becomes a prefix match and tokens are ANDed:
/// `"gpu node"` becomes `"gpu:* & node:*"`. Operator characters are stripped so
/// user input can never produce an invalid tsquery. Returns an empty string when
/// no usable token remains.
pub fn string_to_ts_query(input: &str) -> String {
    input
        .split_whitespace()
        .map(|token| TS_QUERY_SPECIAL.replace_all(token, "").into_owned())
        .filter(|token| !token.is_empty())
        .map(|token| format!("{}:*", token))
        .collect::<Vec<_>>()
        .join(" & ")
}

/// Escape `%`, `_` and `\` so the input matches literally inside a LIKE pattern
pub fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Deterministic 64-bit hash of a string
pub fn string_to_u64_hash(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_ts_query_tokens() {
        assert_eq!(string_to_ts_query("gpu"), "gpu:*");
        assert_eq!(string_to_ts_query("  gpu   node "), "gpu:* & node:*");
        assert_eq!(string_to_ts_query("a&b | !c"), "ab:* & c:*");
        assert_eq!(string_to_ts_query("   "), "");
        assert_eq!(string_to_ts_query("() :*"), "");
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("100%"), "100\\%");
        assert_eq!(escape_like("my_site"), "my\\_site");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[test]
    fn test_hash_is_stable() {
        let id = uuid::Uuid::new_v4().to_string();
        assert_eq!(string_to_u64_hash(&id), string_to_u64_hash(&id));
        assert_ne!(string_to_u64_hash("a"), string_to_u64_hash("b"));
    }

    proptest! {
        #[test]
        fn prop_ts_query_never_contains_operators_inside_tokens(input in ".{0,64}") {
            let query = string_to_ts_query(&input);
            for token in query.split(" & ").filter(|t| !t.is_empty()) {
                let body = token.trim_end_matches(":*");
                prop_assert!(!body.is_empty());
                prop_assert!(!TS_QUERY_SPECIAL.is_match(body));
                prop_assert!(!body.chars().any(char::is_whitespace));
            }
        }

        #[test]
        fn prop_lock_hash_deterministic(input in ".*") {
            prop_assert_eq!(string_to_u64_hash(&input), string_to_u64_hash(&input));
        }
    }
}
