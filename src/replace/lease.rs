//! Per-path leases for in-flight mutations.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

/// Table of files currently being rewritten, keyed by canonical path.
///
/// Lookups take a shared lock and may run concurrently; acquiring and
/// releasing a lease takes the exclusive lock. Clones share one table.
#[derive(Debug, Clone, Default)]
pub struct LeaseTable {
    held: Arc<RwLock<HashSet<PathBuf>>>,
}

/// Exclusive claim on one path, released when dropped.
#[derive(Debug)]
pub struct Lease {
    table: LeaseTable,
    key: PathBuf,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `path`, or `None` if another lease already holds it.
    pub fn try_acquire(&self, path: &Path) -> Option<Lease> {
        let key = canonical_key(path);
        if !self.held.write().insert(key.clone()) {
            return None;
        }
        Some(Lease {
            table: self.clone(),
            key,
        })
    }

    pub fn is_leased(&self, path: &Path) -> bool {
        self.held.read().contains(&canonical_key(path))
    }

    pub fn len(&self) -> usize {
        self.held.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Lease {
    /// Canonical path this lease covers.
    pub fn path(&self) -> &Path {
        &self.key
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.table.held.write().remove(&self.key);
    }
}

/// Canonical form of `path`; paths that do not exist yet canonicalize through their parent.
fn canonical_key(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            fs::canonicalize(parent)
                .map(|p| p.join(name))
                .unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    }
}
