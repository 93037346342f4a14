//! Context path helpers.
//!
//! Paths are dot-separated names; the root context has the empty path.
//! A path starting with the separator is relative to the context it is
//! resolved against.

/// Separator between path segments.
pub const SEPARATOR: char = '.';

/// Path of the root context.
pub const ROOT: &str = "";

/// Join two path parts, treating an empty part as absent.
pub fn join(parent: &str, child: &str) -> String {
    match (parent.is_empty(), child.is_empty()) {
        (true, _) => child.to_string(),
        (false, true) => parent.to_string(),
        (false, false) => format!("{}{}{}", parent, SEPARATOR, child),
    }
}

pub fn is_relative(path: &str) -> bool {
    path.starts_with(SEPARATOR)
}

/// Non-empty segments of a path.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        assert_eq!(join("", "users"), "users");
        assert_eq!(join("users", "admin"), "users.admin");
        assert_eq!(join("users", ""), "users");
    }

    #[test]
    fn test_relative() {
        assert!(is_relative(".child"));
        assert!(!is_relative("users.admin"));
        assert!(!is_relative(""));
    }

    #[test]
    fn test_segments_skip_empty_parts() {
        assert_eq!(segments(".a..b").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(segments(ROOT).count(), 0);
    }
}
