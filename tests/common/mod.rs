//! Shared helpers for building EPUB fixtures on the fly.

#![allow(dead_code)]

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#;

pub const CHAPTER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title>One</title></head>
<body><p>It was a dark and stormy night.</p></body></html>
"#;

/// Bytes standing in for a JPEG cover.
pub const OLD_COVER: &[u8] = b"\xFF\xD8\xFF\xE0old-cover-bytes";
pub const NEW_COVER: &[u8] = b"\x89PNG\r\n\x1a\nnew-cover-bytes";

/// An EPUB 3 package document with a `cover-image` item.
pub fn package_document(title: &str, author: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="uid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="uid">urn:uuid:1b4e28ba-2fa1-11d2-883f-0016d3cca427</dc:identifier>
    <dc:title>{title}</dc:title>
    <dc:creator>{author}</dc:creator>
    <dc:language>en</dc:language>
  </metadata>
  <manifest>
    <item id="ch1" href="text/ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="cover" href="images/cover.jpg" media-type="image/jpeg" properties="cover-image"/>
  </manifest>
  <spine>
    <itemref idref="ch1"/>
  </spine>
</package>
"#
    )
}

/// Write a zip at `path` with `mimetype` first and stored, then `entries` deflated.
pub fn write_epub(path: &Path, entries: &[(&str, &[u8])]) {
    let file = File::create(path).unwrap();
    let mut zip = ZipWriter::new(file);
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    zip.start_file("mimetype", stored).unwrap();
    zip.write_all(b"application/epub+zip").unwrap();

    let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, data) in entries {
        zip.start_file(*name, deflated).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

/// A complete single-chapter book with a cover at `dir/name`.
pub fn sample_epub(dir: &Path, name: &str, title: &str, author: &str) -> PathBuf {
    let path = dir.join(name);
    let opf = package_document(title, author);
    write_epub(
        &path,
        &[
            ("META-INF/container.xml", CONTAINER_XML.as_bytes()),
            ("OEBPS/content.opf", opf.as_bytes()),
            ("OEBPS/text/ch1.xhtml", CHAPTER.as_bytes()),
            ("OEBPS/images/cover.jpg", OLD_COVER),
        ],
    );
    path
}

/// Like [`sample_epub`], but with a custom package document.
pub fn epub_with_opf(dir: &Path, name: &str, opf: &str) -> PathBuf {
    let path = dir.join(name);
    write_epub(
        &path,
        &[
            ("META-INF/container.xml", CONTAINER_XML.as_bytes()),
            ("OEBPS/content.opf", opf.as_bytes()),
            ("OEBPS/text/ch1.xhtml", CHAPTER.as_bytes()),
        ],
    );
    path
}

pub fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

pub fn sha1_of(path: &Path) -> String {
    let bytes = std::fs::read(path).unwrap();
    sha1_smol::Sha1::from(&bytes).hexdigest()
}

/// Entry names with their compression method, in archive order.
pub fn entries(path: &Path) -> Vec<(String, CompressionMethod)> {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    (0..archive.len())
        .map(|i| {
            let entry = archive.by_index(i).unwrap();
            (entry.name().to_string(), entry.compression())
        })
        .collect()
}

pub fn read_entry(path: &Path, name: &str) -> Vec<u8> {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    let mut entry = archive.by_name(name).unwrap();
    let mut data = Vec::new();
    entry.read_to_end(&mut data).unwrap();
    data
}

pub fn read_opf(path: &Path) -> String {
    String::from_utf8(read_entry(path, "OEBPS/content.opf")).unwrap()
}

/// Files in `dir` whose name ends with `suffix`.
pub fn files_ending_with(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.to_string_lossy().ends_with(suffix))
        .collect()
}
