//! Package document patching.
//!
//! [`OpfPatcher`] applies an [`EditRequest`] to the text of a package
//! document. Scalar fields are rewritten in place or appended to the
//! `metadata` block. A cover substitution also writes the new image into
//! the unpacked container tree and rewrites the manifest so the old cover
//! file stays referenced under a fresh id. Manifest entries are never removed.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::cover::{
    COVER_IMAGE_PROPERTY, ManifestItem, extension_of, find_cover_item, manifest_items,
    media_type_for_extension,
};
use super::document::{NodeId, PackageDocument, Placement, empty_element, text_element};
use crate::error::{Error, Result};
use crate::metadata::{EditRequest, Field};
use crate::util::{archive_dir, resolve_href, unique_token};

/// Dublin Core elements namespace.
pub const DC_NAMESPACE: &str = "http://purl.org/dc/elements/1.1/";

/// What to do when a cover replacement is requested but the package names no cover.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MissingCoverPolicy {
    /// Leave the package untouched and report [`CoverOutcome::Skipped`].
    #[default]
    Skip,
    /// Add the image as a new `cover-image` item beside the package document.
    Insert,
}

/// Result of the cover part of a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverOutcome {
    /// No cover replacement was requested.
    Unchanged,
    /// The existing cover item now points at `href`; the old file lives on as `superseded_id`.
    Replaced { href: String, superseded_id: String },
    /// A new cover item was added at `href`.
    Inserted { href: String },
    /// No cover reference was found and the policy is [`MissingCoverPolicy::Skip`].
    Skipped,
}

/// Patched package text plus a summary of what changed.
#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub text: String,
    pub fields_changed: Vec<Field>,
    pub cover: CoverOutcome,
}

/// Applies edits to one package document inside an unpacked container.
pub struct OpfPatcher<'a> {
    tree_root: &'a Path,
    /// Archive path of the package document (e.g. "OEBPS/content.opf").
    opf_path: String,
    missing_cover: MissingCoverPolicy,
}

impl<'a> OpfPatcher<'a> {
    pub fn new(tree_root: &'a Path, opf_path: impl Into<String>) -> Self {
        Self {
            tree_root,
            opf_path: opf_path.into(),
            missing_cover: MissingCoverPolicy::default(),
        }
    }

    pub fn with_missing_cover(mut self, policy: MissingCoverPolicy) -> Self {
        self.missing_cover = policy;
        self
    }

    /// Apply `edits` to `opf_text`, copying any replacement cover into the tree.
    pub fn apply(&self, opf_text: &str, edits: &EditRequest) -> Result<PatchOutcome> {
        let mut doc = PackageDocument::parse(opf_text)?;
        let root = doc.root();
        let metadata = match doc.find_first("metadata") {
            Some(node) => node,
            None => {
                let name = sibling_name(&doc, root, "metadata");
                doc.create_element(root, &name, Placement::FirstChild)
            }
        };

        let mut fields_changed = Vec::new();
        for (field, value) in edits.fields() {
            match doc.find_in(metadata, field.local_name()) {
                Some(node) => doc.set_text(node, value),
                None => {
                    let prefix = dc_prefix(&mut doc, metadata);
                    let name = format!("{prefix}:{}", field.local_name());
                    doc.append_markup(metadata, text_element(&name, &[], value));
                }
            }
            fields_changed.push(field);
        }

        let cover = match edits.cover.as_deref() {
            Some(source) => self.patch_cover(&mut doc, metadata, source)?,
            None => CoverOutcome::Unchanged,
        };

        Ok(PatchOutcome {
            text: doc.render(),
            fields_changed,
            cover,
        })
    }

    fn patch_cover(
        &self,
        doc: &mut PackageDocument,
        metadata: NodeId,
        source: &Path,
    ) -> Result<CoverOutcome> {
        if !source.is_file() {
            return Err(Error::not_found(source));
        }
        let extension = extension_of(source).unwrap_or_else(|| "jpg".to_string());

        let Some(existing) = find_cover_item(doc) else {
            return match self.missing_cover {
                MissingCoverPolicy::Skip => {
                    log::warn!(
                        "{} names no cover image, skipping cover replacement",
                        self.opf_path
                    );
                    Ok(CoverOutcome::Skipped)
                }
                MissingCoverPolicy::Insert => self.insert_cover(doc, metadata, source, &extension),
            };
        };

        self.replace_cover(doc, &existing, source, &extension)
    }

    fn replace_cover(
        &self,
        doc: &mut PackageDocument,
        existing: &ManifestItem,
        source: &Path,
        extension: &str,
    ) -> Result<CoverOutcome> {
        // Same directory as the current cover keeps relative references valid.
        let href = format!(
            "{}cover-{}.{extension}",
            archive_dir(&existing.href),
            unique_token()
        );
        self.copy_into_tree(source, &href)?;

        let media_type = media_type_for_extension(extension);
        doc.set_attr(existing.node, "href", &href);
        doc.set_attr(existing.node, "media-type", media_type);

        let superseded_id = fresh_id(doc, "superseded-cover");
        let superseded_media_type = if existing.media_type.is_empty() {
            extension_of(Path::new(&existing.href))
                .map(|ext| media_type_for_extension(&ext))
                .unwrap_or("image/jpeg")
                .to_string()
        } else {
            existing.media_type.clone()
        };
        let item_name = doc.name(existing.node).to_string();
        let manifest = doc.parent(existing.node).unwrap_or(doc.root());
        doc.append_markup(
            manifest,
            empty_element(
                &item_name,
                &[
                    ("id", superseded_id.as_str()),
                    ("href", existing.href.as_str()),
                    ("media-type", superseded_media_type.as_str()),
                ],
            ),
        );

        log::debug!(
            "cover item '{}' now points at {href}, previous file kept as '{superseded_id}'",
            existing.id
        );
        Ok(CoverOutcome::Replaced {
            href,
            superseded_id,
        })
    }

    fn insert_cover(
        &self,
        doc: &mut PackageDocument,
        metadata: NodeId,
        source: &Path,
        extension: &str,
    ) -> Result<CoverOutcome> {
        let href = format!("cover-{}.{extension}", unique_token());
        self.copy_into_tree(source, &href)?;

        let root = doc.root();
        let manifest = match doc.find_first("manifest") {
            Some(node) => node,
            None => {
                let name = sibling_name(doc, root, "manifest");
                let placement = if doc.is_parsed(metadata) {
                    Placement::After(metadata)
                } else {
                    Placement::FirstChild
                };
                doc.create_element(root, &name, placement)
            }
        };

        let id = fresh_id(doc, "cover-image");
        let item_name = sibling_name(doc, manifest, "item");
        doc.append_markup(
            manifest,
            empty_element(
                &item_name,
                &[
                    ("id", id.as_str()),
                    ("href", href.as_str()),
                    ("media-type", media_type_for_extension(extension)),
                    ("properties", COVER_IMAGE_PROPERTY),
                ],
            ),
        );

        let meta_name = sibling_name(doc, metadata, "meta");
        doc.append_markup(
            metadata,
            empty_element(&meta_name, &[("name", "cover"), ("content", id.as_str())]),
        );

        log::debug!("inserted cover item '{id}' at {href}");
        Ok(CoverOutcome::Inserted { href })
    }

    /// Copy `source` to the location `href` resolves to, relative to the package document.
    fn copy_into_tree(&self, source: &Path, href: &str) -> Result<PathBuf> {
        let archive_path = resolve_href(&self.opf_path, href)
            .ok_or_else(|| Error::Corrupt(format!("cover href '{href}' escapes the container")))?;
        let target = self.tree_root.join(archive_path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, &target).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::not_found(source),
            _ => Error::Io(e),
        })?;
        Ok(target)
    }
}

/// Prefix for new Dublin Core elements, declaring `xmlns:dc` on `metadata` if nothing is bound.
fn dc_prefix(doc: &mut PackageDocument, metadata: NodeId) -> String {
    if let Some(prefix) = doc.prefix_in_scope(metadata, DC_NAMESPACE) {
        return prefix.to_string();
    }
    doc.set_attr(metadata, "xmlns:dc", DC_NAMESPACE);
    "dc".to_string()
}

/// Qualified name for a new OPF element, reusing the prefix of `context`.
fn sibling_name(doc: &PackageDocument, context: NodeId, local: &str) -> String {
    match doc.prefix(context) {
        Some(prefix) => format!("{prefix}:{local}"),
        None => local.to_string(),
    }
}

/// A manifest id not used by any existing item.
fn fresh_id(doc: &PackageDocument, stem: &str) -> String {
    let taken: HashSet<String> = manifest_items(doc).into_iter().map(|item| item.id).collect();
    loop {
        let id = format!("{stem}-{}", unique_token());
        if !taken.contains(&id) {
            return id;
        }
    }
}
