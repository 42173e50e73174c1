//! Expected-substring check on HTTP response bodies.

/// Case-sensitive substring containment.
pub fn matches(body: &str, expected: &str) -> bool {
    body.contains(expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substring_match() {
        assert!(matches("{\"status\":\"ok\"}", "\"ok\""));
        assert!(matches("service healthy", "health"));
        assert!(!matches("service healthy", "degraded"));
    }

    #[test]
    fn test_match_is_case_sensitive() {
        assert!(!matches("Service OK", "ok"));
        assert!(matches("Service OK", "OK"));
    }

    #[test]
    fn test_empty_body() {
        assert!(!matches("", "ok"));
    }
}
