//! Scoped scratch directories with retrying cleanup.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

/// How hard to try before giving up on removing a scratch directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub attempts: u32,
    /// Base delay; attempt `n` waits `backoff * n` after failing.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }

    /// Policy that tries exactly once.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `op` until it succeeds or the attempts are exhausted, returning the last error.
    pub fn run<T>(&self, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    log::debug!("attempt {attempt}/{attempts} failed: {e}");
                    thread::sleep(self.backoff * attempt);
                    attempt += 1;
                }
            }
        }
    }
}

/// Queue of directories whose cleanup failed, retried later by [`Janitor::sweep`].
#[derive(Debug, Clone, Default)]
pub struct Janitor {
    pending: Arc<Mutex<Vec<PathBuf>>>,
}

impl Janitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer(&self, path: PathBuf) {
        self.pending.lock().push(path);
    }

    pub fn pending(&self) -> Vec<PathBuf> {
        self.pending.lock().clone()
    }

    /// Retry every deferred removal once. Returns how many remain.
    pub fn sweep(&self) -> usize {
        let mut pending = self.pending.lock();
        pending.retain(|path| match remove_dir(path) {
            Ok(()) => false,
            Err(e) => {
                log::warn!("scratch directory {} still not removable: {e}", path.display());
                true
            }
        });
        pending.len()
    }
}

/// A private, uniquely named working directory removed when dropped.
///
/// Removal is retried according to the [`RetryPolicy`]; a directory that
/// still cannot be removed is logged and handed to the [`Janitor`], if any.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    policy: RetryPolicy,
    janitor: Option<Janitor>,
    released: bool,
}

impl ScratchDir {
    /// Create a new directory under `root` (or the system temp dir).
    pub fn create(root: Option<&Path>, policy: RetryPolicy, janitor: Option<Janitor>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("epubmeta-");
        let dir = match root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        Ok(Self {
            path: dir.keep(),
            policy,
            janitor,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory now. Returns whether removal succeeded.
    pub fn release(mut self) -> bool {
        self.cleanup()
    }

    fn cleanup(&mut self) -> bool {
        if self.released {
            return true;
        }
        self.released = true;

        match self.policy.run(|| remove_dir(&self.path)) {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "could not remove scratch directory {} after {} attempts: {e}",
                    self.path.display(),
                    self.policy.attempts.max(1)
                );
                if let Some(janitor) = &self.janitor {
                    janitor.defer(self.path.clone());
                }
                false
            }
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn remove_dir(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
