//! EPUB container and package document handling.

pub mod archive;
pub mod cover;
pub mod document;
pub mod extract;
pub mod parser;
pub mod patch;

pub use archive::{PackSummary, pack, unpack, verify_layout};
pub use document::PackageDocument;
pub use extract::{extract, extract_or_title, read_tree};
pub use patch::{CoverOutcome, MissingCoverPolicy, OpfPatcher, PatchOutcome};
