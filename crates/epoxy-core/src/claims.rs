//! Dot-path lookup into decoded token claims

use serde_json::Value;

/// Walk `path` (segments separated by `.`) through nested JSON objects and
/// return the string found there.
///
/// The lookup fails when any intermediate value is not an object, when a
/// segment is absent, or when the final value is not a string with at least
/// one non-whitespace character.
#[must_use]
pub fn lookup_str<'a>(claims: &'a Value, path: &str) -> Option<&'a str> {
    if path.is_empty() {
        return None;
    }
    let mut node = claims;
    for segment in path.split('.') {
        node = node.as_object()?.get(segment)?;
    }
    node.as_str().filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_nested_string() {
        let claims = json!({"user": {"id": "abc123"}});
        assert_eq!(lookup_str(&claims, "user.id"), Some("abc123"));
    }

    #[test]
    fn missing_segment_fails() {
        let claims = json!({"user": {"id": "abc123"}});
        assert_eq!(lookup_str(&claims, "user.missing"), None);
    }

    #[test]
    fn does_not_descend_through_scalars() {
        // "user" is a string, so "user.id" must not resolve to it.
        let claims = json!({"user": "abc123"});
        assert_eq!(lookup_str(&claims, "user.id"), None);
    }

    #[test]
    fn rejects_blank_and_non_string_values() {
        let claims = json!({"blank": "  ", "num": 7, "obj": {"a": "b"}});
        assert_eq!(lookup_str(&claims, "blank"), None);
        assert_eq!(lookup_str(&claims, "num"), None);
        assert_eq!(lookup_str(&claims, "obj"), None);
        assert_eq!(lookup_str(&claims, ""), None);
    }

    #[test]
    fn top_level_key() {
        let claims = json!({"email": "alice@example.com"});
        assert_eq!(lookup_str(&claims, "email"), Some("alice@example.com"));
    }
}
