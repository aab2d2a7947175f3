//! Output-path hardening: directory sanitization, containment, disk space.
//!
//! Every byte an engine writes lands under a directory vetted here, and the
//! final resolved path is re-checked for containment before completion.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, instrument, warn};

use crate::error::CoreError;

/// Free-space floor below which downloads fail outright.
pub const DISK_SPACE_FAIL_BYTES: u64 = 50 * 1024 * 1024;

/// Free-space floor below which downloads proceed with a warning.
pub const DISK_SPACE_WARN_BYTES: u64 = 100 * 1024 * 1024;

/// A vetted output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDir {
    /// Canonical absolute path.
    pub path: PathBuf,
    /// True when the requested directory was unusable and the system temp
    /// directory was substituted.
    pub fell_back_to_temp: bool,
}

/// Disk-space probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    /// Free bytes on the volume holding the directory.
    pub free_bytes: u64,
    /// Whether `free_bytes` covers the requested size plus the fail floor.
    pub ok: bool,
    /// Whether the caller should surface a low-space warning.
    pub low: bool,
}

/// Resolves, creates, and write-probes an output directory.
///
/// On any failure (creation, canonicalization, write probe) the system temp
/// directory is returned instead with `fell_back_to_temp` set, so a download
/// never dies because a configured directory went away.
///
/// # Errors
///
/// Returns [`CoreError::Permission`] only when even the temp directory is
/// unusable.
#[instrument]
pub fn sanitize_output_dir(dir: &Path) -> Result<OutputDir, CoreError> {
    match prepare_dir(dir) {
        Ok(path) => Ok(OutputDir {
            path,
            fell_back_to_temp: false,
        }),
        Err(error) => {
            warn!(
                dir = %dir.display(),
                %error,
                "output directory unusable, falling back to temp"
            );
            let temp = std::env::temp_dir();
            let path = prepare_dir(&temp).map_err(|_| CoreError::permission(temp))?;
            Ok(OutputDir {
                path,
                fell_back_to_temp: true,
            })
        }
    }
}

fn prepare_dir(dir: &Path) -> Result<PathBuf, CoreError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| CoreError::io(dir, e))?;
    }
    let canonical = dir.canonicalize().map_err(|e| CoreError::io(dir, e))?;

    // Write probe: creating and removing a marker is the only portable
    // answer to "can I write here" across permission models.
    let probe = canonical.join(".mediafetch-write-probe");
    std::fs::write(&probe, b"").map_err(|_| CoreError::permission(&canonical))?;
    let _ = std::fs::remove_file(&probe);

    Ok(canonical)
}

/// Verifies that `child` is component-wise inside `parent`.
///
/// Both sides are canonicalized; a child that does not yet exist is checked
/// through its nearest existing ancestor joined with the remaining lexical
/// components (which must not contain `..`). Paths on different volumes
/// fail as traversal.
///
/// # Errors
///
/// Returns [`CoreError::Security`] when containment cannot be proven.
#[instrument]
pub fn verify_inside(child: &Path, parent: &Path) -> Result<(), CoreError> {
    let parent = parent
        .canonicalize()
        .map_err(|_| CoreError::security("containment parent does not resolve"))?;

    let resolved_child = resolve_lexical(child)?;

    if resolved_child.starts_with(&parent) {
        debug!(child = %resolved_child.display(), parent = %parent.display(), "containment ok");
        Ok(())
    } else {
        Err(CoreError::security(format!(
            "path '{}' escapes '{}'",
            resolved_child.display(),
            parent.display()
        )))
    }
}

/// Canonicalizes as much of `path` as exists and appends the rest lexically.
fn resolve_lexical(path: &Path) -> Result<PathBuf, CoreError> {
    if let Ok(canonical) = path.canonicalize() {
        return Ok(canonical);
    }

    let mut existing = path.to_path_buf();
    let mut suffix: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match existing.file_name() {
            Some(name) => {
                suffix.push(name.to_os_string());
                existing.pop();
            }
            None => return Err(CoreError::security("path has no existing ancestor")),
        }
    }

    let mut resolved = existing
        .canonicalize()
        .map_err(|_| CoreError::security("path ancestor does not resolve"))?;
    for segment in suffix.iter().rev() {
        let part = Path::new(segment);
        if part
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(CoreError::security("unresolved traversal segment"));
        }
        resolved.push(part);
    }
    Ok(resolved)
}

/// Reports free space for `dir` against a required size.
///
/// The policy knobs live in the caller: `ok == false` below
/// [`DISK_SPACE_FAIL_BYTES`] headroom, `low == true` below
/// [`DISK_SPACE_WARN_BYTES`].
///
/// # Errors
///
/// Returns [`CoreError::Io`] when the volume cannot be queried.
#[instrument]
pub fn check_disk_space(dir: &Path, required_bytes: u64) -> Result<DiskSpace, CoreError> {
    let free_bytes = fs2::available_space(dir).map_err(|e| CoreError::io(dir, e))?;
    let needed = required_bytes.saturating_add(DISK_SPACE_FAIL_BYTES);
    let ok = free_bytes >= needed;
    let low = free_bytes < required_bytes.saturating_add(DISK_SPACE_WARN_BYTES);
    if low {
        warn!(
            dir = %dir.display(),
            free_bytes,
            required_bytes,
            "low disk space"
        );
    }
    Ok(DiskSpace { free_bytes, ok, low })
}
