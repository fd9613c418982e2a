//! Path helpers.
//!
//! All paths inside this crate are `/`-separated strings relative to a
//! root, without leading or trailing slashes. The empty string is the root.

use crate::error::{VfsError, VfsResult};

/// Lexically normalize a relative path.
///
/// Collapses empty and `.` segments and resolves `..` against preceding
/// segments. Returns the normalized path and the number of `..` segments
/// that could not be resolved (i.e. how far the path climbs above its root).
pub fn normalize(path: &str) -> (String, usize) {
    let mut segments: Vec<&str> = Vec::new();
    let mut escapes = 0;

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    escapes += 1;
                }
            }
            s => segments.push(s),
        }
    }

    (segments.join("/"), escapes)
}

/// Normalize a caller supplied path and reject anything that is absolute or
/// climbs above the root.
pub fn normalize_bounded(path: &str) -> VfsResult<String> {
    if path.starts_with('/') {
        return Err(VfsError::out_of_bounds(format!(
            "Virtual filesystem path '{path}' cannot be absolute."
        )));
    }

    let (normalized, escapes) = normalize(path);
    if escapes > 0 {
        let mut shown = vec![".."; escapes].join("/");
        if !normalized.is_empty() {
            shown.push('/');
            shown.push_str(&normalized);
        }
        return Err(VfsError::out_of_bounds(format!(
            "Virtual filesystem path '{shown}' must not escape the filesystem boundary."
        )));
    }

    Ok(normalized)
}

/// Normalize a mount or DBAFS prefix. Leading and trailing slashes are
/// tolerated; `..` segments are a configuration error.
pub fn normalize_prefix(prefix: &str) -> VfsResult<String> {
    let (normalized, escapes) = normalize(prefix.trim_start_matches('/'));
    if escapes > 0 || prefix.split('/').any(|s| s == "..") {
        return Err(VfsError::configuration(format!(
            "prefix '{prefix}' must not contain '..' segments"
        )));
    }
    Ok(normalized)
}

/// Join two normalized paths.
pub fn join(prefix: &str, path: &str) -> String {
    match (prefix.is_empty(), path.is_empty()) {
        (true, _) => path.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{prefix}/{path}"),
    }
}

/// Strip `prefix` from `path` on a segment boundary.
pub fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(path);
    }
    if path == prefix {
        return Some("");
    }
    path.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
}

/// True if `path` equals `prefix` or lies below it.
pub fn is_within(path: &str, prefix: &str) -> bool {
    strip_prefix(path, prefix).is_some()
}

/// Express `path` relative to `base`, climbing with `..` where needed.
pub fn relative_to(path: &str, base: &str) -> String {
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let base_segments: Vec<&str> = base.split('/').filter(|s| !s.is_empty()).collect();

    let common = path_segments
        .iter()
        .zip(base_segments.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result: Vec<&str> = vec![".."; base_segments.len() - common];
    result.extend_from_slice(&path_segments[common..]);
    result.join("/")
}

/// Parent of a normalized path; `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or(""))
}

/// Last segment of a normalized path.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// All proper ancestors of a path, nearest first, excluding the root.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(parent(path), |p| parent(*p)).filter(|p| !p.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("a/./b//c/"), ("a/b/c".to_string(), 0));
        assert_eq!(normalize("a/b/../c"), ("a/c".to_string(), 0));
        assert_eq!(normalize("some/../../other/resource"), ("other/resource".to_string(), 1));
        assert_eq!(normalize(""), (String::new(), 0));
        assert_eq!(normalize("../.."), (String::new(), 2));
    }

    #[test]
    fn test_normalize_bounded_messages() {
        let err = normalize_bounded("../other/resource").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Virtual filesystem path '../other/resource' must not escape the filesystem boundary."
        );

        let err = normalize_bounded("some/../../other/resource").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Virtual filesystem path '../other/resource' must not escape the filesystem boundary."
        );

        let err = normalize_bounded("/some/place").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Virtual filesystem path '/some/place' cannot be absolute."
        );

        assert!(matches!(normalize_bounded(".."), Err(VfsError::OutOfBounds(_))));
        assert_eq!(normalize_bounded("a/../b").unwrap(), "b");
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix("/files/").unwrap(), "files");
        assert_eq!(normalize_prefix("").unwrap(), "");
        assert!(matches!(
            normalize_prefix("files/../x"),
            Err(VfsError::Configuration(_))
        ));
    }

    #[test]
    fn test_prefix_helpers() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("p", ""), "p");
        assert_eq!(join("p", "a/b"), "p/a/b");

        assert_eq!(strip_prefix("p/a", "p"), Some("a"));
        assert_eq!(strip_prefix("p", "p"), Some(""));
        assert_eq!(strip_prefix("pa/b", "p"), None);
        assert_eq!(strip_prefix("x", ""), Some("x"));

        assert!(is_within("files/a", "files"));
        assert!(!is_within("filesystem", "files"));
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(relative_to("prefix/path", "prefix"), "path");
        assert_eq!(relative_to("other/resource", "prefix"), "../other/resource");
        assert_eq!(relative_to("a/b", ""), "a/b");
        assert_eq!(relative_to("a", "a"), "");
    }

    #[test]
    fn test_parent_and_ancestors() {
        assert_eq!(parent(""), None);
        assert_eq!(parent("a"), Some(""));
        assert_eq!(parent("a/b/c"), Some("a/b"));
        assert_eq!(basename("a/b/c"), "c");

        let all: Vec<_> = ancestors("a/b/c").collect();
        assert_eq!(all, vec!["a/b", "a"]);
        assert_eq!(ancestors("a").count(), 0);
    }
}
