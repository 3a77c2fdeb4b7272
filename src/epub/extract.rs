//! Read-only metadata extraction.
//!
//! Extraction is best effort: any failure to unpack the container or find
//! its package document yields `None`, and callers fall back to a title
//! derived from the file name (see [`extract_or_title`]).

use std::fs;
use std::io;
use std::path::Path;

use super::archive;
use super::cover::{extension_of, find_conventional_cover, find_cover_item};
use super::document::PackageDocument;
use super::parser::{CONTAINER_PATH, parse_container_xml, strip_bom};
use crate::error::{Error, Result};
use crate::metadata::{Cover, EpubMetadata, Field};
use crate::util::{decode_href, resolve_href, title_from_path};

/// Read the metadata snapshot of an EPUB file.
///
/// Returns `None` when the container cannot be unpacked or has no readable
/// package document.
///
/// # Example
///
/// ```no_run
/// let meta = epubmeta::extract("book.epub");
/// if let Some(title) = meta.and_then(|m| m.title) {
///     println!("{title}");
/// }
/// ```
pub fn extract(path: impl AsRef<Path>) -> Option<EpubMetadata> {
    let path = path.as_ref();
    match try_extract(path) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            log::warn!("no metadata for {}: {e}", path.display());
            None
        }
    }
}

/// Like [`extract`], but always returns a snapshot whose title falls back to the file stem.
pub fn extract_or_title(path: impl AsRef<Path>) -> EpubMetadata {
    let path = path.as_ref();
    let mut metadata = extract(path).unwrap_or_default();
    if metadata.title.is_none() {
        let title = title_from_path(path);
        if !title.is_empty() {
            metadata.title = Some(title);
        }
    }
    metadata
}

fn try_extract(path: &Path) -> Result<EpubMetadata> {
    let scratch = tempfile::Builder::new()
        .prefix("epubmeta-read-")
        .tempdir()?;
    archive::unpack(path, scratch.path())?;
    read_tree(scratch.path())
}

/// Read metadata from an already unpacked container tree.
pub fn read_tree(root: &Path) -> Result<EpubMetadata> {
    let container = fs::read(root.join(CONTAINER_PATH)).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::Corrupt(format!("missing {CONTAINER_PATH}")),
        _ => Error::Io(e),
    })?;
    let opf_path = parse_container_xml(&container)?;
    let opf_path = resolve_href("", &opf_path)
        .ok_or_else(|| Error::Corrupt(format!("invalid rootfile path '{opf_path}'")))?;

    let opf_file = root.join(&opf_path);
    let text = read_package_text(&opf_file)?;
    let doc = PackageDocument::parse(text)?;

    let mut metadata = read_fields(&doc);
    metadata.cover = read_cover(&doc, root, &opf_path);
    Ok(metadata)
}

/// Read a package document as UTF-8, dropping any byte order mark.
pub(crate) fn read_package_text(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => {
            Error::Corrupt(format!("package document {} is missing", path.display()))
        }
        _ => Error::Io(e),
    })?;
    String::from_utf8(strip_bom(&bytes).to_vec())
        .map_err(|e| Error::corrupt("package document is not UTF-8", e))
}

/// Scalar fields: first matching element inside `metadata`, trimmed, blanks dropped.
pub(crate) fn read_fields(doc: &PackageDocument) -> EpubMetadata {
    let scope = doc.find_first("metadata");
    let mut metadata = EpubMetadata::default();

    for field in Field::ALL {
        let found = match scope {
            Some(scope) => doc.find_in(scope, field.local_name()),
            None => doc.find_first(field.local_name()),
        };
        let value = found
            .map(|node| doc.text(node).trim())
            .filter(|text| !text.is_empty())
            .map(str::to_string);
        *metadata.slot_mut(field) = value;
    }

    metadata
}

fn read_cover(doc: &PackageDocument, root: &Path, opf_path: &str) -> Option<Cover> {
    if let Some(item) = find_cover_item(doc) {
        match resolve_href(opf_path, &item.href) {
            Some(archive_path) => match fs::read(root.join(&archive_path)) {
                Ok(data) => {
                    let extension = extension_of(Path::new(&decode_href(&item.href)))
                        .unwrap_or_else(|| extension_for_media_type(&item.media_type).to_string());
                    return Some(Cover { data, extension });
                }
                Err(e) => log::warn!("cover '{archive_path}' is unreadable: {e}"),
            },
            None => log::warn!("cover href '{}' does not resolve inside the container", item.href),
        }
    }

    let opf_dir = root.join(opf_path);
    let opf_dir = opf_dir.parent().unwrap_or(root);
    let path = find_conventional_cover(opf_dir)?;
    let data = fs::read(&path).ok()?;
    let extension = extension_of(&path).unwrap_or_else(|| "jpg".to_string());
    Some(Cover { data, extension })
}

fn extension_for_media_type(media_type: &str) -> &'static str {
    match media_type {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        _ => "jpg",
    }
}
