//! MQTT topic filter matching.

/// Returns true when `topic` matches the subscription `pattern`.
///
/// `+` matches exactly one level; `#` matches zero or more trailing
/// levels and is only valid as the final segment. Matching is purely
/// structural: no normalization of empty segments is attempted, so
/// `a//b` is three levels with an empty middle one, as the protocol
/// defines it.
pub fn matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');

    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some("#"), _) => {
                // Multi-level wildcard must be terminal to count.
                return pattern_parts.next().is_none();
            }
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(matches("a/b", "a/b"));
        assert!(!matches("a/b", "a/c"));
        assert!(!matches("a/b", "a"));
        assert!(!matches("a", "a/b"));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(matches("a/+/c", "a/b/c"));
        assert!(matches("+/b", "a/b"));
        assert!(!matches("a/+", "a/b/c"));
        assert!(!matches("a/+/c", "a/c"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(matches("a/#", "a"));
        assert!(matches("a/#", "a/b"));
        assert!(matches("a/#", "a/b/c"));
        assert!(matches("#", "anything/at/all"));
        assert!(!matches("a/#", "b/c"));
    }

    #[test]
    fn hash_must_be_terminal() {
        assert!(!matches("a/#/c", "a/b/c"));
    }

    #[test]
    fn empty_levels_are_levels() {
        assert!(matches("a/+/b", "a//b"));
        assert!(!matches("a/b", "a//b"));
    }
}
