//! File operations used for the destructive steps of a run.

use std::fs::{self, File};
use std::io;
use std::path::Path;

/// The file operations a [`Coordinator`](super::Coordinator) performs on the caller's files.
///
/// Everything that can destroy user data goes through this trait, so tests
/// can inject failures at exact points of the backup-and-swap protocol.
pub trait Filesystem: Send + Sync {
    /// Copy `from` to `to`, replacing `to`, and flush it to disk.
    fn copy(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Move `from` to `to`.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;
}

/// [`Filesystem`] backed by `std::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdFilesystem;

impl Filesystem for StdFilesystem {
    fn copy(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::copy(from, to)?;
        File::open(to)?.sync_all()
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}
