//! Property tests for container packing.

mod common;

use std::collections::BTreeMap;
use std::fs;

use epubmeta::epub::archive::{pack, unpack, verify_layout};
use proptest::prelude::*;
use tempfile::TempDir;
use zip::CompressionMethod;

fn entry_name() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z][a-z0-9_]{0,7}", 1..4).prop_map(|parts| parts.join("/"))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_pack_puts_mimetype_first(
        files in prop::collection::btree_map(entry_name(), prop::collection::vec(any::<u8>(), 0..256), 0..12)
    ) {
        // A name cannot be both a file and a directory.
        let files: BTreeMap<String, Vec<u8>> = files
            .iter()
            .filter(|(name, _)| name.as_str() != "mimetype" && !name.starts_with("mimetype/"))
            .filter(|(name, _)| !files.keys().any(|other| other.starts_with(&format!("{name}/"))))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let tree = TempDir::new().unwrap();
        fs::write(tree.path().join("mimetype"), b"application/epub+zip").unwrap();
        for (name, data) in &files {
            let path = tree.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, data).unwrap();
        }

        let out = TempDir::new().unwrap();
        let archive = out.path().join("book.epub");
        let summary = pack(tree.path(), &archive, None).unwrap();
        prop_assert!(summary.has_mimetype);
        prop_assert_eq!(summary.entries, files.len() + 1);
        verify_layout(fs::File::open(&archive).unwrap()).unwrap();

        let entries = common::entries(&archive);
        prop_assert_eq!(&entries[0], &("mimetype".to_string(), CompressionMethod::Stored));
        for (_, method) in &entries[1..] {
            prop_assert_eq!(*method, CompressionMethod::Deflated);
        }

        let back = TempDir::new().unwrap();
        unpack(&archive, back.path()).unwrap();
        for (name, data) in &files {
            prop_assert_eq!(&fs::read(back.path().join(name)).unwrap(), data);
        }
    }
}
