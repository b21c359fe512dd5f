use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};

use notesync_core::SyncError;
use tokio::fs;

/// Regular files under `dir`, sorted, skipping hidden entries.
///
/// A missing `dir` yields no files.
pub(crate) async fn walk_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = match fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };

        while let Some(entry) = entries.next_entry().await? {
            if is_hidden(&entry.file_name()) {
                continue;
            }
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }

    files.sort();
    Ok(files)
}

pub(crate) fn is_hidden(name: &OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// `path` relative to `root`, with `/` separators.
pub(crate) fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    Some(parts.join("/"))
}

/// Join a `/`-separated relative path onto `root`, refusing to leave it.
pub(crate) fn safe_join(root: &Path, relative: &str) -> Result<PathBuf, SyncError> {
    let mut path = root.to_path_buf();
    for part in relative.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                return Err(SyncError::Source(format!(
                    "Path escapes its root: {}",
                    relative
                )))
            }
            part if part.contains('\\') || part.contains(':') => {
                return Err(SyncError::Source(format!("Invalid path segment in {}", relative)))
            }
            part => path.push(part),
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_walk_skips_hidden_and_sorts() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("b/.git")).await.unwrap();
        fs::write(root.join("b/2.md"), "x").await.unwrap();
        fs::write(root.join("b/.git/config"), "x").await.unwrap();
        fs::write(root.join("1.md"), "x").await.unwrap();
        fs::write(root.join(".hidden"), "x").await.unwrap();

        let keys: Vec<_> = walk_files(root)
            .await
            .unwrap()
            .iter()
            .filter_map(|p| relative_key(root, p))
            .collect();
        assert_eq!(keys, vec!["1.md", "b/2.md"]);
    }

    #[tokio::test]
    async fn test_walk_missing_dir_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        assert!(walk_files(&temp_dir.path().join("nope"))
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_safe_join_rejects_parent_segments() {
        let root = Path::new("/vault");
        assert_eq!(
            safe_join(root, "Notes/./Plan.md").unwrap(),
            PathBuf::from("/vault/Notes/Plan.md")
        );
        assert!(safe_join(root, "../etc/passwd").is_err());
        assert!(safe_join(root, "Notes/../../x").is_err());
    }
}
