//! Source file enumeration shared by every retrieval backend.
//!
//! Walks `source.root` in file-name order, keeps files whose extension is
//! on the allow-list, drops the usual VCS and build directories plus any
//! configured `exclude_globs`, and stops at `max_files`.
//!
//! Backends call the `load_*` wrappers, which run the filesystem work on
//! the blocking pool.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::SourceConfig;
use crate::error::{AssistError, AssistResult};

/// Extensions indexed when `source.extensions` is empty.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "rst", "adoc", "org", "csv", "json", "yaml", "yml", "toml", "xml",
    "html", "htm", "rs", "py", "js", "ts", "tsx", "jsx", "go", "java", "kt", "c", "h", "cpp",
    "hpp", "cs", "rb", "php", "swift", "sh", "sql",
];

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

/// A file selected for indexing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the source root, with `/` separators.
    pub source_id: String,
    pub path: PathBuf,
}

/// List the files under `config.root` that should be indexed.
pub fn scan_source_files(config: &SourceConfig) -> AssistResult<Vec<SourceFile>> {
    let root = config
        .root
        .as_ref()
        .ok_or_else(|| AssistError::Configuration("retrieval.source.root is not set".into()))?;

    if !root.is_dir() {
        return Err(AssistError::Retrieval(format!(
            "source root does not exist or is not a directory: {}",
            root.display()
        )));
    }

    let extensions: Vec<String> = if config.extensions.is_empty() {
        DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
    } else {
        config
            .extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect()
    };

    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| AssistError::Retrieval(format!("cannot read source: {}", e)))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let source_id = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&source_id) {
            continue;
        }
        if !has_allowed_extension(path, &extensions) {
            continue;
        }

        if files.len() >= config.max_files {
            info!(
                max_files = config.max_files,
                "source file cap reached; remaining files are not indexed"
            );
            break;
        }

        files.push(SourceFile {
            source_id,
            path: path.to_path_buf(),
        });
    }

    Ok(files)
}

/// Read a source file as UTF-8 text.
///
/// Returns `None` (after logging) for files over `max_bytes`, unreadable
/// files, and files that are not valid UTF-8. A single bad file never
/// fails the whole index.
pub fn read_source_text(file: &SourceFile, max_bytes: u64) -> Option<String> {
    let bytes = read_source_bytes(file, max_bytes)?;
    match String::from_utf8(bytes) {
        Ok(text) => Some(text),
        Err(_) => {
            warn!(file = %file.source_id, "skipping non-UTF-8 file");
            None
        }
    }
}

/// Read a source file's raw bytes, honouring the size cap.
pub fn read_source_bytes(file: &SourceFile, max_bytes: u64) -> Option<Vec<u8>> {
    match std::fs::metadata(&file.path) {
        Ok(meta) if meta.len() > max_bytes => {
            info!(
                file = %file.source_id,
                bytes = meta.len(),
                max_bytes,
                "skipping file over size cap"
            );
            return None;
        }
        Ok(_) => {}
        Err(e) => {
            warn!(file = %file.source_id, error = %e, "skipping unreadable file");
            return None;
        }
    }

    match std::fs::read(&file.path) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(file = %file.source_id, error = %e, "skipping unreadable file");
            None
        }
    }
}

/// [`scan_source_files`] on the blocking pool.
pub async fn load_source_files(config: &SourceConfig) -> AssistResult<Vec<SourceFile>> {
    let config = config.clone();
    tokio::task::spawn_blocking(move || scan_source_files(&config))
        .await
        .map_err(|e| AssistError::Retrieval(format!("source scan task failed: {}", e)))?
}

/// [`read_source_text`] on the blocking pool.
pub async fn load_source_text(file: &SourceFile, max_bytes: u64) -> Option<String> {
    let file = file.clone();
    match tokio::task::spawn_blocking(move || read_source_text(&file, max_bytes)).await {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "source read task failed");
            None
        }
    }
}

/// [`read_source_bytes`] on the blocking pool.
pub async fn load_source_bytes(file: &SourceFile, max_bytes: u64) -> Option<Vec<u8>> {
    let file = file.clone();
    match tokio::task::spawn_blocking(move || read_source_bytes(&file, max_bytes)).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "source read task failed");
            None
        }
    }
}

fn has_allowed_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| extensions.iter().any(|allowed| *allowed == ext))
}

fn build_globset(patterns: &[String]) -> AssistResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| AssistError::Configuration(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| AssistError::Configuration(format!("invalid glob set: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn config(root: &Path) -> SourceConfig {
        SourceConfig {
            root: Some(root.to_path_buf()),
            ..SourceConfig::default()
        }
    }

    #[test]
    fn filters_by_extension_and_sorts() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("b.md"), "b").unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();
        fs::write(tmp.path().join("image.png"), [0u8, 1, 2]).unwrap();
        fs::create_dir_all(tmp.path().join(".git")).unwrap();
        fs::write(tmp.path().join(".git/config.txt"), "x").unwrap();

        let files = scan_source_files(&config(tmp.path())).unwrap();
        let ids: Vec<&str> = files.iter().map(|f| f.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a.txt", "b.md"]);
    }

    #[test]
    fn configured_extensions_replace_defaults() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("notes.md"), "n").unwrap();
        fs::write(tmp.path().join("data.LOG"), "d").unwrap();

        let mut cfg = config(tmp.path());
        cfg.extensions = vec![".log".into()];
        let files = scan_source_files(&cfg).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].source_id, "data.LOG");
    }

    #[test]
    fn caps_file_count() {
        let tmp = TempDir::new().unwrap();
        for i in 0..5 {
            fs::write(tmp.path().join(format!("f{}.txt", i)), "x").unwrap();
        }
        let mut cfg = config(tmp.path());
        cfg.max_files = 2;
        assert_eq!(scan_source_files(&cfg).unwrap().len(), 2);
    }

    #[test]
    fn missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let err = scan_source_files(&config(&tmp.path().join("nope"))).unwrap_err();
        assert!(matches!(err, AssistError::Retrieval(_)));
    }

    #[test]
    fn oversized_file_is_skipped() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("big.txt"), "0123456789").unwrap();
        let file = SourceFile {
            source_id: "big.txt".into(),
            path: tmp.path().join("big.txt"),
        };
        assert!(read_source_text(&file, 5).is_none());
        assert_eq!(read_source_text(&file, 10).as_deref(), Some("0123456789"));
    }

    #[tokio::test]
    async fn blocking_loaders_match_sync_scan() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.md"), "alpha").unwrap();
        fs::write(tmp.path().join("b.bin"), [0u8, 1]).unwrap();

        let files = load_source_files(&config(tmp.path())).await.unwrap();
        assert_eq!(files, scan_source_files(&config(tmp.path())).unwrap());
        assert_eq!(load_source_text(&files[0], 100).await.as_deref(), Some("alpha"));
        assert_eq!(load_source_bytes(&files[0], 100).await, Some(b"alpha".to_vec()));

        let err = load_source_files(&config(&tmp.path().join("nope")))
            .await
            .unwrap_err();
        assert!(matches!(err, AssistError::Retrieval(_)));
    }
}
