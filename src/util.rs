//! Path, href and identifier helpers.

use std::path::{Component, Path};

use percent_encoding::percent_decode_str;

/// Generate a random UUID v4 string.
pub fn uuid_v4() -> String {
    let mut bytes: [u8; 16] = rand::random();

    // Set version (4) and variant (2)
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// A short random token usable in XML ids and filenames.
pub fn unique_token() -> String {
    uuid_v4().replace('-', "")[..12].to_string()
}

/// Strip the fragment from an href and percent-decode it.
pub fn decode_href(href: &str) -> String {
    let path = href.split('#').next().unwrap_or(href);
    percent_decode_str(path).decode_utf8_lossy().into_owned()
}

/// Directory part of an archive path, including the trailing slash ("" at the root).
pub fn archive_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..=i],
        None => "",
    }
}

/// Resolve an href relative to the archive path of the document that contains it.
///
/// Returns a normalized archive path, or `None` if the href is absolute or
/// climbs above the container root.
pub fn resolve_href(document_path: &str, href: &str) -> Option<String> {
    let decoded = decode_href(href);
    if decoded.is_empty() || decoded.starts_with('/') || decoded.contains("://") {
        return None;
    }

    let mut parts: Vec<&str> = archive_dir(document_path)
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Archive entry name for a path relative to the unpacked tree root.
pub fn archive_name(relative: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

/// Title derived from a file name: the stem with underscores turned into spaces.
pub fn title_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().replace('_', " ").trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_uuid_v4_shape() {
        let id = uuid_v4();
        assert_eq!(id.len(), 36);
        assert_eq!(&id[14..15], "4");
        assert_ne!(uuid_v4(), id);
    }

    #[test]
    fn test_unique_token() {
        let token = unique_token();
        assert_eq!(token.len(), 12);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_decode_href() {
        assert_eq!(decode_href("Images/my%20cover.jpg"), "Images/my cover.jpg");
        assert_eq!(decode_href("Text/ch1.xhtml#sec2"), "Text/ch1.xhtml");
        assert_eq!(decode_href("%E5%B0%81%E9%9D%A2.png"), "封面.png");
    }

    #[test]
    fn test_resolve_href() {
        assert_eq!(
            resolve_href("OEBPS/content.opf", "Images/a.jpg").as_deref(),
            Some("OEBPS/Images/a.jpg")
        );
        assert_eq!(
            resolve_href("OEBPS/content.opf", "../cover.jpg").as_deref(),
            Some("cover.jpg")
        );
        assert_eq!(
            resolve_href("content.opf", "./img/a%20b.png").as_deref(),
            Some("img/a b.png")
        );
        assert_eq!(resolve_href("content.opf", "../escape.png"), None);
        assert_eq!(resolve_href("content.opf", "/abs.png"), None);
        assert_eq!(resolve_href("content.opf", "http://x/y.png"), None);
    }

    #[test]
    fn test_archive_dir() {
        assert_eq!(archive_dir("OEBPS/Images/a.jpg"), "OEBPS/Images/");
        assert_eq!(archive_dir("a.jpg"), "");
    }

    #[test]
    fn test_archive_name() {
        let rel = PathBuf::from("OEBPS").join("Images").join("a.jpg");
        assert_eq!(archive_name(&rel).as_deref(), Some("OEBPS/Images/a.jpg"));
        assert_eq!(archive_name(Path::new("../x")), None);
    }

    #[test]
    fn test_title_from_path() {
        assert_eq!(title_from_path(Path::new("/books/Agnes_Grey.epub")), "Agnes Grey");
        assert_eq!(title_from_path(Path::new("plain.epub")), "plain");
    }
}
