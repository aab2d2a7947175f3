//! Sync archive: config + history bundled into one zip.
//!
//! Import is the dangerous direction: every entry name is resolved through
//! the zip crate's enclosed-name check and our own containment guard before
//! a byte is written, so a crafted archive cannot plant files outside the
//! target directory.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, instrument, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::paths::verify_inside;

/// Entry name for the configuration document.
const CONFIG_ENTRY: &str = "config.json";

/// Entry name for the history database.
const HISTORY_ENTRY: &str = "history.db";

/// Errors from archive export/import.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Filesystem failure.
    #[error("archive IO error at {path}: {source}")]
    Io {
        /// The file involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Zip container failure.
    #[error("archive format error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// An entry tried to escape the extraction target.
    #[error("archive entry '{name}' escapes the target directory")]
    Traversal {
        /// The offending entry name.
        name: String,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
    move |source| ArchiveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes `config.json` and the history database into `archive_path`.
///
/// A missing history file is tolerated (fresh install exporting config
/// only); a missing config is not.
///
/// # Errors
///
/// Returns [`ArchiveError`] on IO or container failures.
#[instrument]
pub fn export_archive(
    archive_path: &Path,
    config_path: &Path,
    history_db_path: &Path,
) -> Result<(), ArchiveError> {
    let file = File::create(archive_path).map_err(io_err(archive_path))?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let config = std::fs::read(config_path).map_err(io_err(config_path))?;
    writer.start_file(CONFIG_ENTRY, options)?;
    writer.write_all(&config).map_err(io_err(archive_path))?;

    match std::fs::read(history_db_path) {
        Ok(history) => {
            writer.start_file(HISTORY_ENTRY, options)?;
            writer.write_all(&history).map_err(io_err(archive_path))?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %history_db_path.display(), "no history database; exporting config only");
        }
        Err(e) => return Err(io_err(history_db_path)(e)),
    }

    writer.finish()?;
    info!(path = %archive_path.display(), "archive exported");
    Ok(())
}

/// Extracts an archive into `target_dir`, rejecting traversal entries.
///
/// Returns the paths written.
///
/// # Errors
///
/// Returns [`ArchiveError::Traversal`] for entries whose resolved path
/// escapes `target_dir`, and IO/container errors otherwise.
#[instrument]
pub fn import_archive(archive_path: &Path, target_dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    std::fs::create_dir_all(target_dir).map_err(io_err(target_dir))?;
    let file = File::open(archive_path).map_err(io_err(archive_path))?;
    let mut archive = ZipArchive::new(file)?;

    let mut written = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let name = entry.name().to_string();

        // First line of defense: the container's own sanitizer.
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(ArchiveError::Traversal { name });
        };
        let destination = target_dir.join(&relative);

        // Second line: canonical containment against the real target.
        if verify_inside(&destination, target_dir).is_err() {
            return Err(ArchiveError::Traversal { name });
        }

        if entry.is_dir() {
            std::fs::create_dir_all(&destination).map_err(io_err(&destination))?;
            continue;
        }
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }

        let mut contents = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
        entry
            .read_to_end(&mut contents)
            .map_err(io_err(&destination))?;
        std::fs::write(&destination, contents).map_err(io_err(&destination))?;
        written.push(destination);
    }

    info!(count = written.len(), "archive imported");
    Ok(written)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_export_import_round_trip() {
        let source = TempDir::new().unwrap();
        let config_path = source.path().join("config.json");
        let history_path = source.path().join("history.db");
        std::fs::write(&config_path, br#"{"max_concurrent_downloads":4}"#).unwrap();
        std::fs::write(&history_path, b"sqlite-bytes").unwrap();

        let archive_path = source.path().join("sync.zip");
        export_archive(&archive_path, &config_path, &history_path).unwrap();

        let target = TempDir::new().unwrap();
        let written = import_archive(&archive_path, target.path()).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(
            std::fs::read(target.path().join("config.json")).unwrap(),
            br#"{"max_concurrent_downloads":4}"#
        );
        assert_eq!(
            std::fs::read(target.path().join("history.db")).unwrap(),
            b"sqlite-bytes"
        );
    }

    #[test]
    fn test_export_without_history_is_tolerated() {
        let source = TempDir::new().unwrap();
        let config_path = source.path().join("config.json");
        std::fs::write(&config_path, b"{}").unwrap();

        let archive_path = source.path().join("sync.zip");
        export_archive(
            &archive_path,
            &config_path,
            &source.path().join("absent.db"),
        )
        .unwrap();

        let target = TempDir::new().unwrap();
        let written = import_archive(&archive_path, target.path()).unwrap();
        assert_eq!(written.len(), 1);
    }

    #[test]
    fn test_import_rejects_traversal_entries() {
        let source = TempDir::new().unwrap();
        let archive_path = source.path().join("evil.zip");

        // Hand-build an archive with a traversal entry name.
        let file = File::create(&archive_path).unwrap();
        let mut writer = ZipWriter::new(file);
        let options = FileOptions::default();
        writer.start_file("../outside.txt", options).unwrap();
        writer.write_all(b"escape").unwrap();
        writer.finish().unwrap();

        let target = TempDir::new().unwrap();
        let err = import_archive(&archive_path, target.path()).unwrap_err();
        assert!(matches!(err, ArchiveError::Traversal { .. }));
        assert!(!target.path().parent().unwrap().join("outside.txt").exists());
    }
}
