//! Source discovery for directory submissions.
//!
//! Only the top level of the submitted directory is considered; the
//! `succeeded`/`failed` result folders live below it and must not be
//! picked up again.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Capture file extensions accepted as sources (case-insensitive matching).
pub const SOURCE_EXTENSIONS: &[&str] = &[".ts", ".m2t", ".m2ts"];

/// Checks if a file has a source extension (case-insensitive).
pub fn is_source_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = format!(".{}", ext.to_lowercase());
            SOURCE_EXTENSIONS.contains(&ext_lower.as_str())
        })
        .unwrap_or(false)
}

/// Lists source files directly inside `dir`, sorted by path.
///
/// Hidden files are skipped. A missing or unreadable directory yields an
/// empty list.
pub fn discover_sources(dir: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            !e.file_name()
                .to_str()
                .map(|n| n.starts_with('.'))
                .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .filter(|p| is_source_file(p))
        .collect();
    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_extension_match_is_case_insensitive(
            stem in "[a-z0-9_]{1,12}",
            ext_idx in 0usize..SOURCE_EXTENSIONS.len(),
            upper in proptest::bool::ANY,
        ) {
            let ext = &SOURCE_EXTENSIONS[ext_idx][1..];
            let ext = if upper { ext.to_uppercase() } else { ext.to_string() };
            let path = PathBuf::from(format!("/rec/{}.{}", stem, ext));
            prop_assert!(is_source_file(&path));
        }
    }

    #[test]
    fn test_non_source_extensions_rejected() {
        assert!(!is_source_file(Path::new("/rec/a.mkv")));
        assert!(!is_source_file(Path::new("/rec/a.ts.err")));
        assert!(!is_source_file(Path::new("/rec/noext")));
    }

    #[test]
    fn test_discover_is_flat_and_sorted() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.ts"), b"").unwrap();
        fs::write(dir.path().join("a.M2T"), b"").unwrap();
        fs::write(dir.path().join("c.txt"), b"").unwrap();
        fs::write(dir.path().join(".hidden.ts"), b"").unwrap();
        fs::create_dir(dir.path().join("succeeded")).unwrap();
        fs::write(dir.path().join("succeeded/d.ts"), b"").unwrap();

        let found = discover_sources(dir.path());
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.M2T", "b.ts"]);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        assert!(discover_sources(Path::new("/nonexistent/recordings")).is_empty());
    }
}
