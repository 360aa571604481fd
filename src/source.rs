//! # Source Resolution
//!
//! Materializes variable sources and command arguments from the project tree.
//! File contents are cached per path in a [`DashMap`] shared by every run
//! using the same resolver; entries are populated once and only dropped by an
//! explicit [`FileSystemSourceResolver::clear_cache`].

use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;
use glob::MatchOptions;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("file not found: {path}")]
    NotFound { path: String },
    #[error("path escapes the project root: {path}")]
    OutsideRoot { path: String },
    #[error("failed to access {path}: {message}")]
    Io { path: String, message: String },
    #[error("invalid glob: {0}")]
    Glob(String),
}

/// Where a script lives and which directory it may touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemContext {
    pub root: PathBuf,
    /// The script being compiled, if it lives on disk.
    pub current_file: Option<PathBuf>,
}

impl FileSystemContext {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            current_file: None,
        }
    }

    pub fn with_current_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.current_file = Some(file.into());
        self
    }

    /// Joins `relative` onto the root, rejecting paths that leave it.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, SourceError> {
        let mut normalized = PathBuf::new();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(SourceError::OutsideRoot {
                            path: relative.to_string(),
                        });
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(SourceError::OutsideRoot {
                        path: relative.to_string(),
                    })
                }
            }
        }
        Ok(self.root.join(normalized))
    }

    /// Project-relative path with forward slashes.
    pub fn relative(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[async_trait]
pub trait SourceResolver: Send + Sync {
    /// Project-relative paths of every file matching `pattern`, sorted.
    async fn resolve(&self, fs: &FileSystemContext, pattern: &Regex) -> Result<Vec<String>, SourceError>;

    /// Contents of a project-relative file.
    async fn read(&self, fs: &FileSystemContext, path: &str) -> Result<Arc<String>, SourceError>;

    /// Entries of a project-relative directory, directories suffixed with `/`.
    async fn list_dir(&self, fs: &FileSystemContext, path: &str) -> Result<Vec<String>, SourceError>;
}

#[derive(Debug, Default)]
pub struct FileSystemSourceResolver {
    cache: DashMap<PathBuf, Arc<String>>,
}

impl FileSystemSourceResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

fn io_error(path: &str, err: std::io::Error) -> SourceError {
    if err.kind() == std::io::ErrorKind::NotFound {
        SourceError::NotFound {
            path: path.to_string(),
        }
    } else {
        SourceError::Io {
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

fn select_files(fs: &FileSystemContext, pattern: &Regex) -> Result<Vec<String>, SourceError> {
    let walk = fs.root.join("**").join("*");
    let options = MatchOptions {
        require_literal_leading_dot: true,
        ..MatchOptions::default()
    };
    let entries = glob::glob_with(&walk.to_string_lossy(), options)
        .map_err(|e| SourceError::Glob(e.to_string()))?;

    let mut matched: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|path| path.is_file())
        .map(|path| fs.relative(&path))
        .filter(|relative| pattern.is_match(relative))
        .collect();
    matched.sort();
    Ok(matched)
}

#[async_trait]
impl SourceResolver for FileSystemSourceResolver {
    async fn resolve(&self, fs: &FileSystemContext, pattern: &Regex) -> Result<Vec<String>, SourceError> {
        let fs = fs.clone();
        let pattern = pattern.clone();
        let matched = tokio::task::spawn_blocking(move || select_files(&fs, &pattern))
            .await
            .map_err(|e| SourceError::Glob(e.to_string()))??;
        tracing::debug!("pattern matched {} files", matched.len());
        Ok(matched)
    }

    async fn read(&self, fs: &FileSystemContext, path: &str) -> Result<Arc<String>, SourceError> {
        let full = fs.resolve(path)?;
        if let Some(cached) = self.cache.get(&full) {
            return Ok(cached.clone());
        }
        let content = Arc::new(
            tokio::fs::read_to_string(&full)
                .await
                .map_err(|e| io_error(path, e))?,
        );
        self.cache.insert(full, content.clone());
        Ok(content)
    }

    async fn list_dir(&self, fs: &FileSystemContext, path: &str) -> Result<Vec<String>, SourceError> {
        let full = fs.resolve(path)?;
        let mut reader = tokio::fs::read_dir(&full)
            .await
            .map_err(|e| io_error(path, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|e| io_error(path, e))? {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            entries.push(if is_dir { format!("{}/", name) } else { name });
        }
        entries.sort();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn project() -> (tempfile::TempDir, FileSystemContext) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join("src/lib.rs"), "pub mod a;").unwrap();
        fs::write(dir.path().join("src/nested/a.rs"), "fn a() {}").unwrap();
        fs::write(dir.path().join("README.md"), "# readme").unwrap();
        fs::write(dir.path().join(".git/config"), "x").unwrap();
        let ctx = FileSystemContext::new(dir.path());
        (dir, ctx)
    }

    #[tokio::test]
    async fn test_resolve_matches_relative_paths_sorted() {
        let (_dir, ctx) = project();
        let resolver = FileSystemSourceResolver::new();
        let files = resolver
            .resolve(&ctx, &Regex::new(r"\.rs$").unwrap())
            .await
            .unwrap();
        assert_eq!(files, vec!["src/lib.rs", "src/nested/a.rs"]);

        let all = resolver.resolve(&ctx, &Regex::new(".*").unwrap()).await.unwrap();
        assert!(all.iter().all(|f| !f.starts_with(".git")));
    }

    #[tokio::test]
    async fn test_read_is_cached() {
        let (dir, ctx) = project();
        let resolver = FileSystemSourceResolver::new();
        assert_eq!(resolver.read(&ctx, "README.md").await.unwrap().as_str(), "# readme");
        fs::write(dir.path().join("README.md"), "changed").unwrap();
        assert_eq!(resolver.read(&ctx, "README.md").await.unwrap().as_str(), "# readme");
        assert_eq!(resolver.cached_len(), 1);

        resolver.clear_cache();
        assert_eq!(resolver.read(&ctx, "README.md").await.unwrap().as_str(), "changed");
    }

    #[tokio::test]
    async fn test_missing_file_and_escape() {
        let (_dir, ctx) = project();
        let resolver = FileSystemSourceResolver::new();
        assert_eq!(
            resolver.read(&ctx, "nope.txt").await.unwrap_err(),
            SourceError::NotFound {
                path: "nope.txt".to_string()
            }
        );
        assert!(matches!(
            resolver.read(&ctx, "../etc/passwd").await,
            Err(SourceError::OutsideRoot { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_dir() {
        let (_dir, ctx) = project();
        let resolver = FileSystemSourceResolver::new();
        assert_eq!(
            resolver.list_dir(&ctx, "src").await.unwrap(),
            vec!["lib.rs", "nested/"]
        );
    }
}
