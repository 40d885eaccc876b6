use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::operation::FileFingerprint;
use crate::safety::validate_mutable;

const QUARANTINE_METADATA_FILE: &str = "metadata.json";

#[cfg(unix)]
const CROSS_DEVICE_ERROR: i32 = 18; // EXDEV
#[cfg(windows)]
const CROSS_DEVICE_ERROR: i32 = 17; // ERROR_NOT_SAME_DEVICE
#[cfg(not(any(unix, windows)))]
const CROSS_DEVICE_ERROR: i32 = -1;

fn fs_error(action: &str, path: &Path, err: io::Error) -> AppError {
    AppError::Filesystem(format!("{action} {}: {err}", path.display()))
}

pub fn modified_time(metadata: &fs::Metadata) -> Option<DateTime<Utc>> {
    metadata.modified().ok().map(DateTime::<Utc>::from)
}

/// Size, modification time and blake3 content hash of a regular file.
pub fn stat_file(path: &Path) -> Result<FileFingerprint, AppError> {
    let metadata = fs::metadata(path).map_err(|e| fs_error("stat", path, e))?;
    if !metadata.is_file() {
        return Err(AppError::Filesystem(format!(
            "not a regular file: {}",
            path.display()
        )));
    }
    let mut file = fs::File::open(path).map_err(|e| fs_error("open", path, e))?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut file, &mut hasher).map_err(|e| fs_error("hash", path, e))?;

    Ok(FileFingerprint {
        size: metadata.len(),
        modified_at: modified_time(&metadata),
        hash: hasher.finalize().to_hex().to_string(),
    })
}

fn ensure_parent(path: &Path) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| fs_error("create directory", parent, e))?;
    }
    Ok(())
}

fn check_endpoints(source: &Path, destination: &Path) -> Result<(), AppError> {
    validate_mutable(source)?;
    validate_mutable(destination)?;
    if !source.is_file() {
        return Err(AppError::Filesystem(format!(
            "source does not exist: {}",
            source.display()
        )));
    }
    if destination.exists() {
        return Err(AppError::Filesystem(format!(
            "destination already exists: {}",
            destination.display()
        )));
    }
    Ok(())
}

/// Renames `source` to `destination`, falling back to copy-and-remove across devices.
pub fn move_file(source: &Path, destination: &Path) -> Result<(), AppError> {
    check_endpoints(source, destination)?;
    ensure_parent(destination)?;

    match fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(CROSS_DEVICE_ERROR) => {
            fs::copy(source, destination).map_err(|e| fs_error("copy", source, e))?;
            if let Err(e) = fs::remove_file(source) {
                let _ = fs::remove_file(destination);
                return Err(fs_error("remove", source, e));
            }
            Ok(())
        }
        Err(e) => Err(fs_error("move", source, e)),
    }
}

pub fn copy_file(source: &Path, destination: &Path) -> Result<(), AppError> {
    check_endpoints(source, destination)?;
    ensure_parent(destination)?;
    fs::copy(source, destination).map_err(|e| fs_error("copy", source, e))?;
    Ok(())
}

/// Where a DELETE operation parks `source`: one directory per operation id.
pub fn quarantine_path(quarantine_dir: &Path, operation_id: &str, source: &Path) -> PathBuf {
    let file_name = source
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "unnamed".into());
    quarantine_dir.join(operation_id).join(file_name)
}

pub fn quarantine_file(source: &Path, quarantined: &Path) -> Result<(), AppError> {
    move_file(source, quarantined)?;
    if let Some(slot) = quarantined.parent() {
        let metadata = serde_json::json!({
            "original_path": source.to_string_lossy(),
            "quarantined_at": Utc::now().to_rfc3339(),
        });
        // The sidecar is informational; losing it does not affect restore.
        if let Err(e) = fs::write(
            slot.join(QUARANTINE_METADATA_FILE),
            serde_json::to_string_pretty(&metadata)?,
        ) {
            tracing::warn!(path = %slot.display(), error = %e, "could not write quarantine metadata");
        }
    }
    Ok(())
}

pub fn restore_from_quarantine(quarantined: &Path, original: &Path) -> Result<(), AppError> {
    move_file(quarantined, original)?;
    if let Some(slot) = quarantined.parent() {
        let _ = fs::remove_dir_all(slot);
    }
    Ok(())
}

/// Physically removes a quarantined file and its per-operation directory.
pub fn purge_quarantined(quarantined: &Path) -> Result<(), AppError> {
    match quarantined.parent() {
        Some(slot) if slot.exists() => {
            fs::remove_dir_all(slot).map_err(|e| fs_error("purge", slot, e))
        }
        _ => Ok(()),
    }
}

/// First path for `file_name` in `dir` that neither exists nor is `reserved`:
/// `name.ext`, then `name (1).ext`, ...
pub fn unique_destination(
    dir: &Path,
    file_name: &str,
    reserved: impl Fn(&Path) -> bool,
) -> PathBuf {
    let taken = |p: &Path| p.exists() || reserved(p);
    let candidate = dir.join(file_name);
    if !taken(&candidate) {
        return candidate;
    }
    let as_path = Path::new(file_name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.to_string());
    let extension = as_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    (1..)
        .map(|n| dir.join(format!("{stem} ({n}){extension}")))
        .find(|p| !taken(p.as_path()))
        .unwrap_or(candidate)
}
