//! Content storage.

use std::fmt::Write as _;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::error::StoreError;

/// Source of markdown content, keyed by relative `/`-separated identifier.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Content of `filename`, or `None` when there is no such entry.
    async fn get(&self, filename: &str) -> Result<Option<String>, StoreError>;

    /// All identifiers, sorted.
    async fn list(&self) -> Result<Vec<String>, StoreError>;

    /// Markdown index of every stored file.
    async fn navigation_index(&self) -> Result<String, StoreError> {
        Ok(render_index(&self.list().await?))
    }
}

/// Render `files` as a markdown link list.
pub fn render_index(files: &[String]) -> String {
    let mut out = String::from("# Navigation\n");
    if !files.is_empty() {
        out.push('\n');
    }
    for file in files {
        let _ = writeln!(out, "- [{file}]({file})");
    }
    out
}

/// Files under a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryContentStore {
    root: PathBuf,
}

impl DirectoryContentStore {
    /// Serve files below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, filename: &str) -> Result<PathBuf, StoreError> {
        let invalid = || StoreError::InvalidPath(filename.to_string());
        let relative = Path::new(filename);
        if filename.starts_with(['/', '\\']) || relative.has_root() {
            return Err(invalid());
        }
        let mut path = self.root.clone();
        let mut depth = 0_usize;
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    path.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return Err(invalid()),
            }
        }
        if depth == 0 {
            return Err(invalid());
        }
        Ok(path)
    }
}

#[async_trait]
impl ContentStore for DirectoryContentStore {
    async fn get(&self, filename: &str) -> Result<Option<String>, StoreError> {
        let path = self.resolve(filename)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut files = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];
        while let Some((dir, prefix)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && prefix.is_empty() => {
                    tracing::warn!(root = %dir.display(), "content directory does not exist");
                    return Ok(files);
                }
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let key = if prefix.is_empty() { name } else { format!("{prefix}/{name}") };
                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), key));
                } else {
                    files.push(key);
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> (tempfile::TempDir, DirectoryContentStore) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("quests")).unwrap();
        std::fs::write(dir.path().join("intro.md"), "# Intro").unwrap();
        std::fs::write(dir.path().join("quests/dragon.md"), "# Dragon").unwrap();
        std::fs::write(dir.path().join(".hidden"), "x").unwrap();
        let store = DirectoryContentStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn reads_nested_files_by_relative_key() {
        let (_dir, store) = populated();
        assert_eq!(store.get("quests/dragon.md").await.unwrap().as_deref(), Some("# Dragon"));
        assert_eq!(store.get("./intro.md").await.unwrap().as_deref(), Some("# Intro"));
        assert_eq!(store.get("missing.md").await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_paths_escaping_the_root() {
        let (_dir, store) = populated();
        for bad in ["../secret.md", "quests/../../x", "/etc/passwd", "", "."] {
            assert!(
                matches!(store.get(bad).await, Err(StoreError::InvalidPath(_))),
                "{bad:?} accepted"
            );
        }
    }

    #[tokio::test]
    async fn lists_sorted_without_hidden_files() {
        let (_dir, store) = populated();
        assert_eq!(
            store.list().await.unwrap(),
            vec!["intro.md".to_string(), "quests/dragon.md".to_string()]
        );
    }

    #[tokio::test]
    async fn missing_root_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryContentStore::new(dir.path().join("absent"));
        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(store.navigation_index().await.unwrap(), "# Navigation\n");
    }

    #[tokio::test]
    async fn index_links_every_file() {
        let (_dir, store) = populated();
        assert_eq!(
            store.navigation_index().await.unwrap(),
            "# Navigation\n\n- [intro.md](intro.md)\n- [quests/dragon.md](quests/dragon.md)\n"
        );
    }
}
