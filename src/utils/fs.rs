//! Small filesystem helpers shared across the core

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Maximum bytes returned by [`read_file_capped`]
pub const READ_CAP_BYTES: u64 = 100 * 1024;

/// Bytes sniffed for NUL when deciding whether a file is binary
const SNIFF_BYTES: usize = 8 * 1024;

/// Write `contents` to `path` atomically (temp file + rename)
pub async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("No parent directory for '{}'", path.display()))?;
    tokio::fs::create_dir_all(parent).await?;

    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string())
    ));
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("Failed to write '{}'", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to rename into '{}'", path.display()))?;
    Ok(())
}

/// Result of a capped file read
#[derive(Debug, Clone)]
pub struct FileContents {
    pub text: String,
    pub truncated: bool,
    pub total_bytes: u64,
}

/// Read up to [`READ_CAP_BYTES`] of a text file, refusing binary content
pub async fn read_file_capped(path: &Path) -> Result<FileContents> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Failed to stat '{}'", path.display()))?;
    if !meta.is_file() {
        anyhow::bail!("'{}' is not a regular file", path.display());
    }

    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read '{}'", path.display()))?;

    let sniff_len = bytes.len().min(SNIFF_BYTES);
    if bytes[..sniff_len].contains(&0) {
        anyhow::bail!("'{}' looks like a binary file", path.display());
    }

    let total_bytes = meta.len();
    let truncated = bytes.len() as u64 > READ_CAP_BYTES;
    let kept = if truncated {
        // Cut on a char boundary below the cap
        let mut end = READ_CAP_BYTES as usize;
        while end > 0 && !is_char_boundary(&bytes, end) {
            end -= 1;
        }
        String::from_utf8_lossy(&bytes[..end]).to_string()
    } else {
        String::from_utf8_lossy(&bytes).to_string()
    };

    Ok(FileContents {
        text: kept,
        truncated,
        total_bytes,
    })
}

// UTF-8 continuation bytes are 0b10xx_xxxx
fn is_char_boundary(bytes: &[u8], index: usize) -> bool {
    if index == 0 || index >= bytes.len() {
        return true;
    }
    bytes[index] & 0xC0 != 0x80
}

/// List files under `root` with a depth cap, skipping ignored directory names
pub fn list_files(root: &Path, ignore: &[String], max_depth: usize) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let walker = walkdir::WalkDir::new(root)
        .max_depth(max_depth)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !ignore.iter().any(|pat| name == pat.as_str())
        });

    for entry in walker.filter_map(|e| e.ok()) {
        if entry.file_type().is_file() {
            if let Ok(rel) = entry.path().strip_prefix(root) {
                out.push(rel.to_path_buf());
            }
        }
    }
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn atomic_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c.json");
        write_atomic(&path, "{}").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn capped_read_rejects_binary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob.bin");
        tokio::fs::write(&path, b"abc\0def").await.unwrap();
        assert!(read_file_capped(&path).await.is_err());
    }

    #[tokio::test]
    async fn capped_read_truncates_large_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.txt");
        let body = "x".repeat((READ_CAP_BYTES + 500) as usize);
        tokio::fs::write(&path, &body).await.unwrap();

        let contents = read_file_capped(&path).await.unwrap();
        assert!(contents.truncated);
        assert_eq!(contents.text.len(), READ_CAP_BYTES as usize);
        assert_eq!(contents.total_bytes, READ_CAP_BYTES + 500);
    }

    #[test]
    fn list_files_skips_ignored_dirs() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/index.js"), "x").unwrap();

        let files = list_files(dir.path(), &["node_modules".to_string()], 10);
        assert_eq!(files, vec![PathBuf::from("src/main.rs")]);
    }
}
