//! Safe in-place rewriting of EPUB metadata.
//!
//! A [`Coordinator`] runs one edit through a fixed sequence of stages:
//!
//! ```text
//! Unpacking -> LocatingPackageDoc -> Patching -> Repacking
//!           -> BackingUp -> Swapping -> CleaningUp -> Done
//! ```
//!
//! Everything up to and including `Repacking` works on a private scratch
//! copy, so a failure there leaves the caller's file untouched. The
//! destination is only modified during `Swapping`, after a backup copy has
//! been written next to it; if the swap fails the backup is copied back.

mod fs;
mod lease;
mod scratch;

pub use fs::{Filesystem, StdFilesystem};
pub use lease::{Lease, LeaseTable};
pub use scratch::{Janitor, RetryPolicy, ScratchDir};

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use crate::epub::archive;
use crate::epub::extract::read_package_text;
use crate::epub::parser::{CONTAINER_PATH, parse_container_xml};
use crate::epub::patch::{CoverOutcome, MissingCoverPolicy, OpfPatcher};
use crate::error::{Error, FatalStage, Result};
use crate::metadata::{EditRequest, Field};
use crate::util::{archive_name, resolve_href, unique_token};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Options for a [`Coordinator`].
#[derive(Debug, Clone, Default)]
pub struct ReplaceOptions {
    /// Allow replacing an existing destination. Required for in-place edits.
    pub overwrite: bool,
    /// Cleanup policy for the scratch directory.
    pub retry: RetryPolicy,
    /// What to do with a cover replacement when the book names no cover.
    pub missing_cover: MissingCoverPolicy,
    /// Where scratch directories are created. Defaults to the system temp dir.
    pub scratch_root: Option<PathBuf>,
    /// Deflate level for repacked entries. `None` uses the library default.
    pub compression_level: Option<i64>,
}

impl ReplaceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_missing_cover(mut self, policy: MissingCoverPolicy) -> Self {
        self.missing_cover = policy;
        self
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn with_compression_level(mut self, level: i64) -> Self {
        self.compression_level = Some(level);
        self
    }
}

/// Stage of a rewrite, reported in debug logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Unpacking,
    LocatingPackageDoc,
    Patching,
    Repacking,
    BackingUp,
    Swapping,
    CleaningUp,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Unpacking => "unpacking",
            Stage::LocatingPackageDoc => "locating package document",
            Stage::Patching => "patching",
            Stage::Repacking => "repacking",
            Stage::BackingUp => "backing up",
            Stage::Swapping => "swapping",
            Stage::CleaningUp => "cleaning up",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// The file that now holds the rewritten book.
    pub destination: PathBuf,
    /// Archive path of the package document that was patched.
    pub package_document: String,
    /// Fields that were written, in canonical order.
    pub fields_changed: Vec<Field>,
    pub cover: CoverOutcome,
    /// Number of entries in the rewritten archive.
    pub entries: usize,
}

/// Rewrites EPUB metadata with backup-and-restore semantics.
///
/// Each run holds a lease on its source (and destination) for its whole
/// duration, so two runs on the same file through one coordinator, or
/// through coordinators sharing a [`LeaseTable`], fail fast with
/// [`Error::Busy`] instead of interleaving.
///
/// # Example
///
/// ```no_run
/// use epubmeta::{Coordinator, EditRequest, ReplaceOptions};
///
/// let coordinator = Coordinator::new(ReplaceOptions::new().with_overwrite(true));
/// let edits = EditRequest::new().with_title("New Title");
/// let report = coordinator.run("book.epub", &edits)?;
/// println!("changed {:?}", report.fields_changed);
/// # Ok::<(), epubmeta::Error>(())
/// ```
#[derive(Clone)]
pub struct Coordinator {
    options: ReplaceOptions,
    fs: Arc<dyn Filesystem>,
    leases: LeaseTable,
    janitor: Janitor,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(ReplaceOptions::default())
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("options", &self.options)
            .field("leases", &self.leases.len())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(options: ReplaceOptions) -> Self {
        Self {
            options,
            fs: Arc::new(StdFilesystem),
            leases: LeaseTable::new(),
            janitor: Janitor::new(),
        }
    }

    /// Route backup, swap and restore through `fs`.
    pub fn with_filesystem(mut self, fs: Arc<dyn Filesystem>) -> Self {
        self.fs = fs;
        self
    }

    /// Share a lease table with other coordinators.
    pub fn with_leases(mut self, leases: LeaseTable) -> Self {
        self.leases = leases;
        self
    }

    pub fn options(&self) -> &ReplaceOptions {
        &self.options
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn janitor(&self) -> &Janitor {
        &self.janitor
    }

    /// Retry removal of scratch directories left behind by earlier runs.
    /// Returns how many are still pending.
    pub fn sweep(&self) -> usize {
        self.janitor.sweep()
    }

    /// Rewrite `path` in place. Requires [`ReplaceOptions::overwrite`].
    pub fn run(&self, path: impl AsRef<Path>, edits: &EditRequest) -> Result<RunReport> {
        let path = path.as_ref();
        self.run_to(path, path, edits)
    }

    /// Rewrite `source` into `destination`.
    ///
    /// On any error the destination holds either its original bytes or, if
    /// it did not exist, nothing. The one exception is a failed restore
    /// ([`FatalStage::Restore`]), whose [`recovery_path`](Error::recovery_path)
    /// names the backup.
    pub fn run_to(
        &self,
        source: impl AsRef<Path>,
        destination: impl AsRef<Path>,
        edits: &EditRequest,
    ) -> Result<RunReport> {
        let source = source.as_ref();
        let destination = destination.as_ref();

        if edits.is_empty() {
            return Err(Error::NoChanges);
        }
        if !source.is_file() {
            return Err(Error::not_found(source));
        }
        if destination.exists() && !self.options.overwrite {
            return Err(Error::Conflict {
                path: destination.to_path_buf(),
            });
        }

        let _source_lease = self.lease(source)?;
        let _destination_lease = if self.leases.is_leased(destination) {
            // Same file as the source, or another run owns it.
            if same_file(source, destination) {
                None
            } else {
                return Err(Error::Busy {
                    path: destination.to_path_buf(),
                });
            }
        } else {
            Some(self.lease(destination)?)
        };

        let scratch = ScratchDir::create(
            self.options.scratch_root.as_deref(),
            self.options.retry,
            Some(self.janitor.clone()),
        )?;

        let mut stage = Stage::Unpacking;
        let result = self.rewrite(source, destination, edits, scratch.path(), &mut stage);

        enter(source, Stage::CleaningUp);
        scratch.release();

        match &result {
            Ok(_) => enter(source, Stage::Done),
            Err(e) => {
                log::debug!("{}: {} while {stage}: {e}", source.display(), Stage::Failed);
            }
        }
        result
    }

    fn lease(&self, path: &Path) -> Result<Lease> {
        self.leases.try_acquire(path).ok_or_else(|| Error::Busy {
            path: path.to_path_buf(),
        })
    }

    fn rewrite(
        &self,
        source: &Path,
        destination: &Path,
        edits: &EditRequest,
        tree: &Path,
        stage: &mut Stage,
    ) -> Result<RunReport> {
        advance(source, stage, Stage::Unpacking);
        archive::unpack(source, tree)?;

        advance(source, stage, Stage::LocatingPackageDoc);
        let package_document = locate_package_document(tree).ok_or_else(|| Error::NotFound {
            what: "Package document",
            path: source.to_path_buf(),
        })?;
        let opf_file = tree.join(&package_document);

        advance(source, stage, Stage::Patching);
        let had_bom = std::fs::read(&opf_file)?.starts_with(UTF8_BOM);
        let text = read_package_text(&opf_file)?;
        let outcome = OpfPatcher::new(tree, package_document.as_str())
            .with_missing_cover(self.options.missing_cover)
            .apply(&text, edits)?;
        let mut bytes = Vec::with_capacity(outcome.text.len() + UTF8_BOM.len());
        if had_bom {
            bytes.extend_from_slice(UTF8_BOM);
        }
        bytes.extend_from_slice(outcome.text.as_bytes());
        std::fs::write(&opf_file, bytes)?;

        advance(source, stage, Stage::Repacking);
        let staged = tempfile::Builder::new()
            .prefix(".epubmeta-")
            .suffix(".tmp")
            .tempfile_in(parent_dir(destination))?
            .into_temp_path();
        let summary = archive::pack(tree, &staged, self.options.compression_level)?;
        if summary.has_mimetype {
            archive::verify_layout(BufReader::new(File::open(&staged)?))?;
        }

        self.install(source, &staged, destination, stage)?;

        Ok(RunReport {
            destination: destination.to_path_buf(),
            package_document,
            fields_changed: outcome.fields_changed,
            cover: outcome.cover,
            entries: summary.entries,
        })
    }

    /// Back up `destination`, move `staged` over it, and restore on failure.
    fn install(&self, source: &Path, staged: &Path, destination: &Path, stage: &mut Stage) -> Result<()> {
        let backup = if destination.exists() {
            if !self.options.overwrite {
                return Err(Error::Conflict {
                    path: destination.to_path_buf(),
                });
            }
            advance(source, stage, Stage::BackingUp);
            let backup = backup_path(destination);
            if let Err(e) = self.fs.copy(destination, &backup) {
                // A partial copy is not a usable original.
                match self.fs.remove_file(&backup) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => log::warn!("could not remove partial backup {}: {err}", backup.display()),
                }
                return Err(Error::Fatal {
                    stage: FatalStage::Backup,
                    backup,
                    source: e,
                });
            }
            Some(backup)
        } else {
            None
        };

        advance(source, stage, Stage::Swapping);
        let swapped = if backup.is_some() {
            self.fs
                .remove_file(destination)
                .and_then(|()| self.fs.rename(staged, destination))
        } else {
            self.fs.rename(staged, destination)
        };

        let Err(swap_error) = swapped else {
            if let Some(backup) = &backup {
                self.discard_backup(backup);
            }
            return Ok(());
        };

        let Some(backup) = backup else {
            return Err(Error::Io(swap_error));
        };

        log::warn!(
            "replacing {} failed ({swap_error}), restoring from {}",
            destination.display(),
            backup.display()
        );
        match self.fs.copy(&backup, destination) {
            Ok(()) => {
                self.discard_backup(&backup);
                Err(Error::Io(swap_error))
            }
            Err(restore_error) => {
                log::error!(
                    "could not restore {}: {restore_error}; original is at {}",
                    destination.display(),
                    backup.display()
                );
                Err(Error::Fatal {
                    stage: FatalStage::Restore,
                    backup,
                    source: restore_error,
                })
            }
        }
    }

    fn discard_backup(&self, backup: &Path) {
        if let Err(e) = self.fs.remove_file(backup) {
            log::warn!("could not remove backup {}: {e}", backup.display());
        }
    }
}

fn enter(source: &Path, stage: Stage) {
    log::debug!("{}: {stage}", source.display());
}

fn advance(source: &Path, current: &mut Stage, next: Stage) {
    *current = next;
    enter(source, next);
}

/// Find the package document in an unpacked tree.
///
/// The container's rootfile wins when it names an existing file; otherwise
/// the first `.opf` file in path order is used.
fn locate_package_document(tree: &Path) -> Option<String> {
    let from_container = std::fs::read(tree.join(CONTAINER_PATH))
        .ok()
        .and_then(|bytes| parse_container_xml(&bytes).ok())
        .and_then(|path| resolve_href("", &path))
        .filter(|path| tree.join(path).is_file());
    if from_container.is_some() {
        return from_container;
    }

    WalkDir::new(tree)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("opf"))
        })
        .find_map(|entry| entry.path().strip_prefix(tree).ok().and_then(archive_name))
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Sibling path for the backup of `destination`: `.{name}.{token}.bak`.
fn backup_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "epub".to_string());
    parent_dir(destination).join(format!(".{name}.{}.bak", unique_token()))
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_prefers_container_rootfile() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("META-INF")).unwrap();
        std::fs::create_dir_all(root.join("A")).unwrap();
        std::fs::create_dir_all(root.join("OEBPS")).unwrap();
        std::fs::write(root.join("A/stray.opf"), "<package/>").unwrap();
        std::fs::write(root.join("OEBPS/content.opf"), "<package/>").unwrap();
        std::fs::write(
            root.join(CONTAINER_PATH),
            r#"<container><rootfiles><rootfile full-path="OEBPS/content.opf"/></rootfiles></container>"#,
        )
        .unwrap();

        assert_eq!(locate_package_document(root).as_deref(), Some("OEBPS/content.opf"));
    }

    #[test]
    fn test_locate_falls_back_to_scan() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("OPS")).unwrap();
        std::fs::write(root.join("OPS/Book.OPF"), "<package/>").unwrap();
        assert_eq!(locate_package_document(root).as_deref(), Some("OPS/Book.OPF"));

        let empty = tempfile::tempdir().unwrap();
        assert_eq!(locate_package_document(empty.path()), None);
    }

    #[test]
    fn test_backup_path_is_hidden_sibling() {
        let backup = backup_path(Path::new("/books/novel.epub"));
        assert_eq!(backup.parent(), Some(Path::new("/books")));
        let name = backup.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(".novel.epub."));
        assert!(name.ends_with(".bak"));
        assert_ne!(backup, backup_path(Path::new("/books/novel.epub")));
    }

    #[test]
    fn test_parent_dir_of_bare_name() {
        assert_eq!(parent_dir(Path::new("book.epub")), Path::new("."));
        assert_eq!(parent_dir(Path::new("a/book.epub")), Path::new("a"));
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::LocatingPackageDoc.to_string(), "locating package document");
        assert_eq!(Stage::Done.to_string(), "done");
    }
}
