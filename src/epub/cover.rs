//! Cover discovery shared by extraction and patching.

use std::fs;
use std::path::{Path, PathBuf};

use super::document::{NodeId, PackageDocument};

/// Manifest property marking the publication's cover image.
pub const COVER_IMAGE_PROPERTY: &str = "cover-image";

/// Filenames probed beside the package document when the manifest names no cover.
const CONVENTIONAL_COVERS: [&str; 3] = ["cover.jpg", "cover.jpeg", "cover.png"];

/// A manifest `item` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestItem {
    pub node: NodeId,
    pub id: String,
    pub href: String,
    pub media_type: String,
    pub properties: Option<String>,
}

impl ManifestItem {
    pub fn has_property(&self, property: &str) -> bool {
        self.properties
            .as_deref()
            .is_some_and(|props| props.split_ascii_whitespace().any(|p| p == property))
    }

    pub fn is_cover_image(&self) -> bool {
        self.has_property(COVER_IMAGE_PROPERTY)
    }
}

/// All `item` elements inside the manifest, in document order.
pub fn manifest_items(doc: &PackageDocument) -> Vec<ManifestItem> {
    doc.elements_named("item")
        .filter(|&node| {
            doc.parent(node)
                .is_some_and(|parent| doc.local_name(parent) == "manifest")
        })
        .filter_map(|node| {
            let id = doc.attr(node, "id")?;
            Some(ManifestItem {
                node,
                id: id.to_string(),
                href: doc.attr(node, "href").unwrap_or_default().to_string(),
                media_type: doc.attr(node, "media-type").unwrap_or_default().to_string(),
                properties: doc.attr(node, "properties").map(str::to_string),
            })
        })
        .filter(|item| !item.id.is_empty())
        .collect()
}

/// Id referenced by an EPUB 2 `<meta name="cover" content="..."/>`.
pub fn cover_meta_id(doc: &PackageDocument) -> Option<&str> {
    doc.elements_named("meta")
        .filter(|&node| doc.attr(node, "name") == Some("cover"))
        .find_map(|node| doc.attr(node, "content").filter(|id| !id.is_empty()))
}

/// Resolve the manifest item holding the cover image.
///
/// EPUB 3 `cover-image` property takes priority over the EPUB 2 meta indirection.
pub fn find_cover_item(doc: &PackageDocument) -> Option<ManifestItem> {
    let items = manifest_items(doc);

    if let Some(item) = items.iter().find(|item| item.is_cover_image()) {
        return Some(item.clone());
    }

    let cover_id = cover_meta_id(doc)?;
    items.into_iter().find(|item| item.id == cover_id)
}

/// Look for `cover.jpg`, `cover.jpeg` or `cover.png` (any case) in `dir`.
pub fn find_conventional_cover(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    let mut found: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| {
                    CONVENTIONAL_COVERS
                        .iter()
                        .any(|candidate| name.eq_ignore_ascii_case(candidate))
                })
        })
        .collect();

    // Directory order is platform dependent; prefer the order of CONVENTIONAL_COVERS.
    found.sort_by_key(|path| {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        CONVENTIONAL_COVERS
            .iter()
            .position(|candidate| *candidate == name)
            .unwrap_or(usize::MAX)
    });
    found.into_iter().next()
}

/// Lowercase extension of a path, without the dot.
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Canonical media type for an image extension. Unknown extensions map to JPEG.
pub fn media_type_for_extension(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/jpeg",
    }
}
