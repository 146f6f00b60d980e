//! Repository source abstraction.
//!
//! The orchestrator only needs two operations from a checkout: enumerate
//! eligible files and read one file's text. [`FilesystemRepo`] implements
//! them over a local directory with include/exclude glob filtering;
//! vendored and dependency paths are excluded by default.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::PathBuf;
use walkdir::WalkDir;

use crate::config::RepositoryConfig;
use crate::error::{Error, Result};

/// Read-only view of a repository snapshot.
pub trait RepositorySource: Send + Sync {
    /// Repository-relative paths of eligible files, sorted for
    /// deterministic run ordering.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Read one file's text. Fails on unreadable or non-UTF-8 content;
    /// the orchestrator records that as a per-file failure.
    fn read_file(&self, path: &str) -> Result<String>;
}

/// Local checkout on the filesystem.
pub struct FilesystemRepo {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
}

impl FilesystemRepo {
    pub fn new(config: &RepositoryConfig) -> Result<Self> {
        let include = build_globset(&config.include_globs)?;

        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/node_modules/**".to_string(),
            "**/target/**".to_string(),
            "**/vendor/**".to_string(),
            "**/.venv/**".to_string(),
            "**/venv/**".to_string(),
            "**/__pycache__/**".to_string(),
            "**/dist/**".to_string(),
            "**/build/**".to_string(),
        ];
        excludes.extend(config.exclude_globs.clone());
        let exclude = build_globset(&excludes)?;

        Ok(Self {
            root: config.root.clone(),
            include,
            exclude,
        })
    }
}

impl RepositorySource for FilesystemRepo {
    fn list_files(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Err(Error::BackendUnreachable {
                service: "repository",
                message: format!("root does not exist: {}", self.root.display()),
            });
        }

        let mut files = Vec::new();

        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| Error::BackendUnreachable {
                service: "repository",
                message: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if self.exclude.is_match(&rel_str) {
                continue;
            }
            if !self.include.is_match(&rel_str) {
                continue;
            }

            files.push(rel_str);
        }

        files.sort();
        Ok(files)
    }

    fn read_file(&self, path: &str) -> Result<String> {
        Ok(std::fs::read_to_string(self.root.join(path))?)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| Error::validation(format!("bad glob '{}': {}", pattern, e)))?,
        );
    }
    builder
        .build()
        .map_err(|e| Error::validation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryConfig;
    use std::fs;

    fn repo_config(root: PathBuf) -> RepositoryConfig {
        RepositoryConfig {
            root,
            include_globs: vec![
                "**/*.py".to_string(),
                "**/*.yml".to_string(),
                "**/*.yaml".to_string(),
            ],
            exclude_globs: vec![],
        }
    }

    #[test]
    fn test_lists_only_eligible_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("roles/web")).unwrap();
        fs::write(dir.path().join("b.py"), "x = 1\n").unwrap();
        fs::write(dir.path().join("a.py"), "y = 2\n").unwrap();
        fs::write(dir.path().join("roles/web/main.yml"), "- name: t\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "skip me\n").unwrap();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join("node_modules/pkg/index.py"), "skip\n").unwrap();

        let repo = FilesystemRepo::new(&repo_config(dir.path().to_path_buf())).unwrap();
        let files = repo.list_files().unwrap();
        assert_eq!(files, vec!["a.py", "b.py", "roles/web/main.yml"]);
    }

    #[test]
    fn test_missing_root_is_backend_unreachable() {
        let repo = FilesystemRepo::new(&repo_config(PathBuf::from("/nonexistent/repo"))).unwrap();
        let err = repo.list_files().unwrap_err();
        assert!(matches!(
            err,
            Error::BackendUnreachable {
                service: "repository",
                ..
            }
        ));
    }

    #[test]
    fn test_read_file_errors_on_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bad.py"), [0xff, 0xfe, 0x00, 0x41]).unwrap();

        let repo = FilesystemRepo::new(&repo_config(dir.path().to_path_buf())).unwrap();
        assert!(repo.read_file("bad.py").is_err());
    }
}
