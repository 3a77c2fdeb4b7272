//! Error types for epubmeta operations.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// The destructive step during which a fatal error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalStage {
    /// Copying the existing destination to its backup failed.
    Backup,
    /// The swap failed and copying the backup back into place failed too.
    Restore,
}

impl fmt::Display for FatalStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalStage::Backup => f.write_str("backup"),
            FatalStage::Restore => f.write_str("restore"),
        }
    }
}

/// Errors that can occur while rewriting an EPUB.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{what} not found: {}", path.display())]
    NotFound { what: &'static str, path: PathBuf },

    #[error("Corrupt EPUB: {0}")]
    Corrupt(String),

    #[error("Destination already exists: {}", path.display())]
    Conflict { path: PathBuf },

    #[error("Failed to package entry '{entry}': {source}")]
    Packaging {
        entry: String,
        #[source]
        source: io::Error,
    },

    #[error("{}", fatal_message(*stage, backup, source))]
    Fatal {
        stage: FatalStage,
        backup: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Edit request contains no changes")]
    NoChanges,

    #[error("Another edit of {} is already in progress", path.display())]
    Busy { path: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn not_found(path: impl AsRef<Path>) -> Self {
        Error::NotFound {
            what: "File",
            path: path.as_ref().to_path_buf(),
        }
    }

    pub(crate) fn corrupt(what: impl fmt::Display, cause: impl fmt::Display) -> Self {
        Error::Corrupt(format!("{what}: {cause}"))
    }

    /// Where the caller can find the original bytes after a failed restore.
    ///
    /// A failed backup leaves the destination untouched and has no recovery path.
    pub fn recovery_path(&self) -> Option<&Path> {
        match self {
            Error::Fatal {
                stage: FatalStage::Restore,
                backup,
                ..
            } => Some(backup),
            _ => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal { .. })
    }
}

fn fatal_message(stage: FatalStage, backup: &Path, source: &io::Error) -> String {
    match stage {
        FatalStage::Backup => format!(
            "backup to {} failed, the destination is unchanged: {source}",
            backup.display()
        ),
        FatalStage::Restore => format!(
            "restore failed, recover the original from {}: {source}",
            backup.display()
        ),
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => Error::Io(e),
            other => Error::corrupt("unreadable archive", other),
        }
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::corrupt("malformed XML", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_carries_recovery_path() {
        let err = Error::Fatal {
            stage: FatalStage::Restore,
            backup: PathBuf::from("/tmp/book.epub.bak"),
            source: io::Error::other("disk full"),
        };
        assert!(err.is_fatal());
        assert_eq!(err.recovery_path(), Some(Path::new("/tmp/book.epub.bak")));
        let message = err.to_string();
        assert!(message.contains("restore failed"));
        assert!(message.contains("/tmp/book.epub.bak"));
    }

    #[test]
    fn test_failed_backup_reports_unchanged_destination() {
        let err = Error::Fatal {
            stage: FatalStage::Backup,
            backup: PathBuf::from("/tmp/.book.epub.x1.bak"),
            source: io::Error::other("disk full"),
        };
        assert!(err.is_fatal());
        assert!(err.recovery_path().is_none());
        let message = err.to_string();
        assert!(message.contains("destination is unchanged"), "{message}");
        assert!(!message.contains("recover the original"), "{message}");
    }

    #[test]
    fn test_non_fatal_has_no_recovery_path() {
        assert!(Error::NoChanges.recovery_path().is_none());
        assert!(!Error::Corrupt("bad".into()).is_fatal());
    }

    #[test]
    fn test_zip_error_maps_to_corrupt() {
        let err: Error = zip::result::ZipError::InvalidArchive("bad".into()).into();
        assert!(matches!(err, Error::Corrupt(_)));
    }
}
