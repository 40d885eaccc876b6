//! Prefix scoping for paths stored as text: history filters, scanner exclusions.

use std::path::Path;

/// Forward slashes only, no repeated separators, no trailing separator (except root).
pub fn normalize(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let mut out = String::with_capacity(unified.len());
    for c in unified.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

/// True when `path` is `root` or lies beneath it. Component-aware: `/a/bc` is not
/// within `/a/b`.
pub fn is_within_scope(path: &str, root: &str) -> bool {
    let path = normalize(path);
    let root = normalize(root);
    if root.is_empty() {
        return false;
    }
    if root == "/" {
        return path.starts_with('/');
    }

    let (path, root) = if cfg!(windows) {
        (path.to_ascii_lowercase(), root.to_ascii_lowercase())
    } else {
        (path, root)
    };
    path == root
        || path
            .strip_prefix(root.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
}

pub fn path_within(path: &Path, root: &Path) -> bool {
    is_within_scope(&path.to_string_lossy(), &root.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_separators() {
        assert_eq!(normalize("/foo//bar///"), "/foo/bar");
        assert_eq!(normalize("C:\\Users\\\\test\\"), "C:/Users/test");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("  /tmp/x "), "/tmp/x");
    }

    #[test]
    fn scope_is_component_aware() {
        assert!(is_within_scope("/foo/bar", "/foo/bar/"));
        assert!(is_within_scope("/foo/bar/baz.txt", "/foo/bar"));
        assert!(!is_within_scope("/foo/barbaz", "/foo/bar"));
        assert!(!is_within_scope("/foo", "/foo/bar"));
    }

    #[test]
    fn root_and_empty_scopes() {
        assert!(is_within_scope("/anything", "/"));
        assert!(!is_within_scope("/anything", ""));
    }

    #[test]
    fn path_within_accepts_std_paths() {
        assert!(path_within(Path::new("/data/quarantine/x"), Path::new("/data")));
        assert!(!path_within(Path::new("/database"), Path::new("/data")));
    }
}
