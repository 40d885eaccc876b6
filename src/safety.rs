use crate::error::AppError;
use std::path::{Component, Path};

const PROTECTED_ROOTS: &[&str] = &[
    "/Applications",
    "/bin",
    "/boot",
    "/dev",
    "/etc",
    "/Library",
    "/proc",
    "/sbin",
    "/sys",
    "/System",
    "/usr",
    "C:\\Windows",
    "C:\\Program Files",
    "C:\\Program Files (x86)",
];

/// Rejects paths the journal must never mutate: empty, relative, or containing `..`.
pub fn validate_path(path: &Path) -> Result<(), AppError> {
    if path.as_os_str().is_empty() {
        return Err(AppError::Filesystem("path is empty".to_string()));
    }
    if !path.is_absolute() {
        return Err(AppError::Filesystem(format!(
            "path must be absolute: {}",
            path.display()
        )));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(AppError::Filesystem(format!(
            "path traversal (.. component) not allowed: {}",
            path.display()
        )));
    }
    Ok(())
}

pub fn is_protected_path(path: &Path) -> bool {
    let normalized = normalize_path_for_match(&path.to_string_lossy());
    PROTECTED_ROOTS.iter().any(|root| {
        let root_normalized = normalize_path_for_match(root);
        if is_windows_style_path(&root_normalized) {
            let normalized_lower = normalized.to_ascii_lowercase();
            let root_lower = root_normalized.to_ascii_lowercase();
            normalized_lower == root_lower
                || normalized_lower.starts_with(&format!("{root_lower}/"))
        } else {
            normalized == root_normalized || normalized.starts_with(&format!("{root_normalized}/"))
        }
    })
}

fn normalize_path_for_match(path: &str) -> String {
    crate::scope_path::normalize(path)
}

fn is_windows_style_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

/// Full check applied to both ends of every journaled mutation.
pub fn validate_mutable(path: &Path) -> Result<(), AppError> {
    validate_path(path)?;
    if is_protected_path(path) {
        return Err(AppError::Filesystem(format!(
            "operation on protected path not allowed: {}",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_paths() {
        assert!(validate_path(Path::new("/Users/test/file.txt")).is_ok());
        assert!(validate_path(Path::new("/home/user/docs/report.pdf")).is_ok());
    }

    #[test]
    fn test_empty_relative_and_traversal_rejected() {
        assert!(validate_path(Path::new("")).is_err());
        assert!(validate_path(Path::new("docs/report.pdf")).is_err());
        assert!(validate_path(Path::new("/tmp/../etc/passwd")).is_err());
    }

    #[test]
    fn test_protected_paths() {
        assert!(is_protected_path(Path::new("/bin")));
        assert!(is_protected_path(Path::new("/usr/local/bin")));
        assert!(is_protected_path(Path::new("C:\\Program Files (x86)\\Common Files")));
        assert!(is_protected_path(Path::new("c:\\program files\\Common Files")));
        assert!(!is_protected_path(Path::new("/Users/test")));
        assert!(!is_protected_path(Path::new("/usrdata")));
        assert!(!is_protected_path(Path::new("/tmp")));
    }

    #[test]
    fn test_validate_mutable() {
        assert!(validate_mutable(Path::new("/home/user/Downloads/a.pdf")).is_ok());
        assert!(validate_mutable(Path::new("/etc/hosts")).is_err());
    }
}
