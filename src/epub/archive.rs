//! OCF archive unpacking and repackaging.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Error, Result};
use crate::util::archive_name;

/// Name of the OCF media-type entry.
pub const MIMETYPE_ENTRY: &str = "mimetype";

/// Required content of the `mimetype` entry.
pub const EPUB_MIMETYPE: &[u8] = b"application/epub+zip";

/// Result of packing a directory tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackSummary {
    /// Number of file entries written.
    pub entries: usize,
    /// Whether a `mimetype` entry was found and written first.
    pub has_mimetype: bool,
}

/// Unpack an EPUB file into `dest`.
pub fn unpack(archive_path: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive_path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::not_found(archive_path),
        _ => Error::Io(e),
    })?;
    unpack_from_reader(BufReader::new(file), dest)
}

/// Unpack an EPUB from any [`Read`] + [`Seek`] source into `dest`.
///
/// Entries whose names would escape `dest` are skipped. Returns the number
/// of files written.
pub fn unpack_from_reader<R: Read + Seek>(reader: R, dest: &Path) -> Result<usize> {
    let mut archive = ZipArchive::new(reader)?;
    let mut written = 0;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            log::warn!("skipping archive entry with unsafe path '{}'", entry.name());
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(&target)?);
        copy_entry(&mut entry, &mut out)?;
        out.flush()?;
        written += 1;
    }

    Ok(written)
}

/// Stream one entry to `out`. The declared size is never trusted for allocation.
fn copy_entry<R: Read, W: Write>(entry: &mut zip::read::ZipFile<'_, R>, out: &mut W) -> Result<()> {
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = entry
            .read(&mut buf)
            .map_err(|e| Error::corrupt(format!("cannot decompress '{}'", entry.name()), e))?;
        if n == 0 {
            return Ok(());
        }
        out.write_all(&buf[..n])?;
    }
}

/// Package a directory tree into an EPUB file at `archive_path`.
///
/// The `mimetype` entry, when present, is written first and stored
/// uncompressed; every other file is deflated.
pub fn pack(source_dir: &Path, archive_path: &Path, compression_level: Option<i64>) -> Result<PackSummary> {
    let file = File::create(archive_path)?;
    let mut writer = BufWriter::new(file);
    let summary = pack_to_writer(source_dir, &mut writer, compression_level)?;
    writer.flush()?;
    Ok(summary)
}

/// Package a directory tree into any [`Write`] + [`Seek`] destination.
pub fn pack_to_writer<W: Write + Seek>(
    source_dir: &Path,
    writer: W,
    compression_level: Option<i64>,
) -> Result<PackSummary> {
    let mut files = collect_files(source_dir)?;

    let has_mimetype = match files.iter().position(|(name, _)| name == MIMETYPE_ENTRY) {
        Some(index) => {
            let entry = files.remove(index);
            files.insert(0, entry);
            true
        }
        None => {
            log::warn!(
                "no mimetype entry in {}, packing anyway",
                source_dir.display()
            );
            false
        }
    };

    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(compression_level);

    let mut zip = ZipWriter::new(writer);
    for (name, path) in &files {
        let options = if name == MIMETYPE_ENTRY { stored } else { deflated };
        write_entry(&mut zip, name, path, options).map_err(|source| Error::Packaging {
            entry: name.clone(),
            source,
        })?;
    }
    zip.finish().map_err(io::Error::other)?;

    Ok(PackSummary {
        entries: files.len(),
        has_mimetype,
    })
}

/// Check that an archive starts with a stored `mimetype` entry holding the EPUB media type.
pub fn verify_layout<R: Read + Seek>(reader: R) -> Result<()> {
    let mut archive = ZipArchive::new(reader)?;
    if archive.is_empty() {
        return Err(Error::Corrupt("archive has no entries".into()));
    }

    let mut first = archive.by_index(0)?;
    if first.name() != MIMETYPE_ENTRY {
        return Err(Error::Corrupt(format!(
            "first entry is '{}', expected 'mimetype'",
            first.name()
        )));
    }
    if first.compression() != CompressionMethod::Stored {
        return Err(Error::Corrupt("mimetype entry is compressed".into()));
    }

    let mut content = Vec::new();
    first.by_ref().take(256).read_to_end(&mut content)?;
    if content.trim_ascii() != EPUB_MIMETYPE {
        return Err(Error::Corrupt(format!(
            "unexpected mimetype '{}'",
            String::from_utf8_lossy(&content)
        )));
    }
    Ok(())
}

/// Regular files under `root` as (archive name, filesystem path), sorted by name.
fn collect_files(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let entry = e
                .path()
                .and_then(|p| p.strip_prefix(root).ok())
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            Error::Packaging {
                entry,
                source: io::Error::from(e),
            }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let name = archive_name(relative).ok_or_else(|| Error::Packaging {
            entry: relative.display().to_string(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "path is not valid UTF-8"),
        })?;
        files.push((name, entry.into_path()));
    }

    Ok(files)
}

fn write_entry<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    name: &str,
    path: &Path,
    options: SimpleFileOptions,
) -> io::Result<()> {
    zip.start_file(name, options).map_err(io::Error::other)?;
    let mut file = File::open(path)?;
    io::copy(&mut file, zip)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
        for (name, data) in files {
            let path = root.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, data).unwrap();
        }
    }

    #[test]
    fn test_mimetype_first_and_stored() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(
            dir.path(),
            &[
                ("META-INF/container.xml", b"<container/>"),
                ("OEBPS/a.xhtml", b"<html/>"),
                ("mimetype", EPUB_MIMETYPE),
                ("aaa.txt", b"sorted before mimetype"),
            ],
        );

        let mut buf = Cursor::new(Vec::new());
        let summary = pack_to_writer(dir.path(), &mut buf, None).unwrap();
        assert_eq!(summary.entries, 4);
        assert!(summary.has_mimetype);

        buf.set_position(0);
        verify_layout(&mut buf).unwrap();

        let mut archive = ZipArchive::new(buf).unwrap();
        for i in 1..archive.len() {
            let entry = archive.by_index(i).unwrap();
            assert_eq!(entry.compression(), CompressionMethod::Deflated, "{}", entry.name());
        }
    }

    #[test]
    fn test_pack_without_mimetype_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path(), &[("content.opf", b"<package/>")]);

        let mut buf = Cursor::new(Vec::new());
        let summary = pack_to_writer(dir.path(), &mut buf, None).unwrap();
        assert!(!summary.has_mimetype);
        assert_eq!(summary.entries, 1);

        buf.set_position(0);
        assert!(matches!(verify_layout(buf), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_unpack_roundtrip_preserves_bytes() {
        let src = tempfile::tempdir().unwrap();
        write_tree(
            src.path(),
            &[
                ("mimetype", EPUB_MIMETYPE),
                ("OEBPS/Images/cover.jpg", &[0xFF, 0xD8, 0xFF, 0x00, 0x01]),
            ],
        );
        let mut buf = Cursor::new(Vec::new());
        pack_to_writer(src.path(), &mut buf, Some(9)).unwrap();

        let out = tempfile::tempdir().unwrap();
        buf.set_position(0);
        assert_eq!(unpack_from_reader(buf, out.path()).unwrap(), 2);
        assert_eq!(
            fs::read(out.path().join("OEBPS/Images/cover.jpg")).unwrap(),
            vec![0xFF, 0xD8, 0xFF, 0x00, 0x01]
        );
    }

    #[test]
    fn test_unpack_skips_escaping_entries() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buf);
            zip.start_file("../evil.txt", SimpleFileOptions::default()).unwrap();
            zip.write_all(b"nope").unwrap();
            zip.start_file("ok.txt", SimpleFileOptions::default()).unwrap();
            zip.write_all(b"fine").unwrap();
            zip.finish().unwrap();
        }

        let out = tempfile::tempdir().unwrap();
        let inner = out.path().join("inner");
        fs::create_dir(&inner).unwrap();
        buf.set_position(0);
        assert_eq!(unpack_from_reader(buf, &inner).unwrap(), 1);
        assert!(!out.path().join("evil.txt").exists());
        assert!(inner.join("ok.txt").exists());
    }

    #[test]
    fn test_unpack_garbage_is_corrupt() {
        let out = tempfile::tempdir().unwrap();
        let result = unpack_from_reader(Cursor::new(b"not a zip".to_vec()), out.path());
        assert!(matches!(result, Err(Error::Corrupt(_))));
    }

    /// Stored `mimetype` whose central directory claims a zip64 size near `u64::MAX`.
    fn oversized_mimetype_zip() -> Vec<u8> {
        let mut crc = flate2::Crc::new();
        crc.update(EPUB_MIMETYPE);
        let crc = crc.sum();
        let len = EPUB_MIMETYPE.len() as u32;

        let mut out = Vec::new();
        out.extend_from_slice(&0x04034b50u32.to_le_bytes());
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // flags
        out.extend_from_slice(&0u16.to_le_bytes()); // stored
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0x0021u16.to_le_bytes());
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&(MIMETYPE_ENTRY.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(MIMETYPE_ENTRY.as_bytes());
        out.extend_from_slice(EPUB_MIMETYPE);

        let cd_offset = out.len() as u32;
        out.extend_from_slice(&0x02014b50u32.to_le_bytes());
        out.extend_from_slice(&45u16.to_le_bytes());
        out.extend_from_slice(&45u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0x0021u16.to_le_bytes());
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&u32::MAX.to_le_bytes()); // size lives in the zip64 extra
        out.extend_from_slice(&(MIMETYPE_ENTRY.len() as u16).to_le_bytes());
        out.extend_from_slice(&12u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(MIMETYPE_ENTRY.as_bytes());
        out.extend_from_slice(&0x0001u16.to_le_bytes());
        out.extend_from_slice(&8u16.to_le_bytes());
        out.extend_from_slice(&(u64::MAX - 16).to_le_bytes());
        let cd_size = out.len() as u32 - cd_offset;

        out.extend_from_slice(&0x06054b50u32.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&cd_size.to_le_bytes());
        out.extend_from_slice(&cd_offset.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }

    #[test]
    fn test_unpack_ignores_declared_size() {
        let bytes = oversized_mimetype_zip();
        let out = tempfile::tempdir().unwrap();
        match unpack_from_reader(Cursor::new(bytes.clone()), out.path()) {
            Ok(written) => {
                assert_eq!(written, 1);
                assert_eq!(fs::read(out.path().join(MIMETYPE_ENTRY)).unwrap(), EPUB_MIMETYPE);
            }
            Err(e) => assert!(matches!(e, Error::Corrupt(_) | Error::Io(_)), "{e}"),
        }

        let path = out.path().join("oversized.epub");
        fs::write(&path, bytes).unwrap();
        assert!(crate::epub::extract::extract(&path).is_none());
    }

    /// Accepts `budget` bytes, then fails every write.
    struct FailAfter {
        inner: Cursor<Vec<u8>>,
        budget: usize,
    }

    impl Write for FailAfter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if buf.len() > self.budget {
                return Err(io::Error::other("device full"));
            }
            self.budget -= buf.len();
            self.inner.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl Seek for FailAfter {
        fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    #[test]
    fn test_pack_failure_names_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = 0x2545_f491_u32;
        let noise: Vec<u8> = (0..64 * 1024)
            .map(|_| {
                state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                (state >> 16) as u8
            })
            .collect();
        write_tree(
            dir.path(),
            &[("mimetype", EPUB_MIMETYPE), ("OEBPS/big.bin", &noise)],
        );

        let writer = FailAfter {
            inner: Cursor::new(Vec::new()),
            budget: 200,
        };
        match pack_to_writer(dir.path(), writer, None) {
            Err(Error::Packaging { entry, .. }) => assert_eq!(entry, "OEBPS/big.bin"),
            other => panic!("expected a packaging error, got {other:?}"),
        }
    }

    #[test]
    fn test_unpack_missing_file_is_not_found() {
        let out = tempfile::tempdir().unwrap();
        let result = unpack(&out.path().join("missing.epub"), out.path());
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }
}
