//! # epubmeta
//!
//! Read and rewrite the metadata of EPUB files without touching anything else.
//!
//! ## Features
//!
//! - Extract title, author, publisher, language, identifier, description and cover
//! - Patch those fields in the package document, preserving all other bytes
//! - Replace or insert the cover image
//! - Repackage with `mimetype` first and stored, as OCF requires
//! - Back up and restore the original if the final swap fails
//!
//! ## Quick Start
//!
//! ```no_run
//! use epubmeta::{Coordinator, EditRequest, ReplaceOptions};
//!
//! // Read
//! let meta = epubmeta::extract("book.epub").unwrap_or_default();
//! println!("{:?} by {:?}", meta.title, meta.author);
//!
//! // Rewrite in place
//! let coordinator = Coordinator::new(ReplaceOptions::new().with_overwrite(true));
//! let edits = EditRequest::new()
//!     .with_title("A Better Title")
//!     .with_cover("cover.png");
//! coordinator.run("book.epub", &edits).unwrap();
//! ```
//!
//! ## Editing many books
//!
//! [`run_batch`] applies jobs one at a time and collects a result for each,
//! so one unreadable book does not stop the others:
//!
//! ```no_run
//! use epubmeta::{Coordinator, EditRequest, Job, ReplaceOptions, run_batch};
//!
//! let coordinator = Coordinator::new(ReplaceOptions::new().with_overwrite(true));
//! let jobs = ["a.epub", "b.epub"]
//!     .into_iter()
//!     .map(|path| Job::in_place(path, EditRequest::new().with_publisher("Acme")));
//! let report = run_batch(&coordinator, jobs);
//! for failure in report.failed() {
//!     eprintln!("{}: {:?}", failure.source.display(), failure.result);
//! }
//! ```

pub mod batch;
pub mod epub;
pub mod error;
pub mod metadata;
pub mod replace;
pub(crate) mod util;

pub use batch::{BatchReport, Job, Outcome, run_batch};
pub use epub::{CoverOutcome, MissingCoverPolicy, extract, extract_or_title};
pub use error::{Error, FatalStage, Result};
pub use metadata::{Cover, EditRequest, EpubMetadata, Field};
pub use replace::{Coordinator, LeaseTable, ReplaceOptions, RetryPolicy, RunReport};
