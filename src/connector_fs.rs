//! Local filesystem reader.
//!
//! Patterns may be a single file, a directory (walked recursively and
//! filtered by the configured include/exclude globs), or a glob such as
//! `docs/**/*.md`. Relative patterns resolve against the configured root.
//!
//! ACL tags for `guide.md` are read from an optional sidecar `guide.md.acl`
//! next to it. Sidecars are never discovered as items themselves.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::FilesystemSourceConfig;
use crate::error::IngestError;
use crate::models::{Acl, SourceItem};
use crate::source::{build_globset, detect_content_type, has_glob_meta, parse_acl_tags, SourceReader};

const ACL_SIDECAR_EXT: &str = "acl";

pub struct FilesystemReader {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl FilesystemReader {
    pub fn new(config: &FilesystemSourceConfig) -> Result<Self> {
        let include = build_globset(&config.include_globs)?;

        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        default_excludes.extend(config.exclude_globs.clone());
        let exclude = build_globset(&default_excludes)?;

        Ok(Self {
            root: config.root.clone(),
            include,
            exclude,
            follow_symlinks: config.follow_symlinks,
        })
    }

    /// Path relative to the root with `/` separators; globs match against this.
    fn relative(&self, path: &Path) -> String {
        let shown = path.strip_prefix(&self.root).unwrap_or(path);
        shown.to_string_lossy().replace('\\', "/")
    }

    fn locator_for(&self, path: &Path) -> String {
        format!("file:{}", self.relative(path))
    }

    fn path_for(&self, locator: &str) -> PathBuf {
        self.root.join(locator.strip_prefix("file:").unwrap_or(locator))
    }

    fn is_sidecar(path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some(ACL_SIDECAR_EXT)
    }

    fn walk_dir(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in WalkDir::new(dir).follow_links(self.follow_symlinks) {
            let entry = entry?;
            if !entry.file_type().is_file() || Self::is_sidecar(entry.path()) {
                continue;
            }

            let path = entry.path();
            let rel_str = self.relative(path);

            if self.exclude.is_match(&rel_str) {
                continue;
            }
            if !self.include.is_match(&rel_str) {
                continue;
            }
            paths.push(path.to_path_buf());
        }
        Ok(paths)
    }

    fn walk_glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        // Walk from the longest literal prefix of the pattern.
        let mut base = PathBuf::new();
        for component in Path::new(pattern).components() {
            if has_glob_meta(&component.as_os_str().to_string_lossy()) {
                break;
            }
            base.push(component);
        }
        let base = self.root.join(base);
        if !base.exists() {
            return Ok(Vec::new());
        }

        let full = self.root.join(pattern);
        let matcher = Glob::new(&full.to_string_lossy())?.compile_matcher();

        let mut paths = Vec::new();
        for entry in WalkDir::new(&base).follow_links(self.follow_symlinks) {
            let entry = entry?;
            if !entry.file_type().is_file() || Self::is_sidecar(entry.path()) {
                continue;
            }
            let path = entry.path();
            if self.exclude.is_match(self.relative(path)) {
                continue;
            }
            if matcher.is_match(path) {
                paths.push(path.to_path_buf());
            }
        }
        Ok(paths)
    }

    /// Tags from `<path>.acl`. Only a missing sidecar means "no tags"; a
    /// sidecar that exists but cannot be read fails the item.
    async fn read_sidecar_acl(locator: &str, path: &Path) -> Result<Acl, IngestError> {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(".");
        sidecar.push(ACL_SIDECAR_EXT);
        match tokio::fs::read_to_string(PathBuf::from(sidecar)).await {
            Ok(raw) => Ok(parse_acl_tags(&raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Acl::new()),
            Err(e) => Err(io_error(&format!("{} (acl sidecar)", locator), e)),
        }
    }
}

#[async_trait]
impl SourceReader for FilesystemReader {
    async fn discover(&self, pattern: &str) -> Result<Vec<String>> {
        let spec = pattern.strip_prefix("file:").unwrap_or(pattern);
        if spec.is_empty() {
            bail!("Empty filesystem pattern");
        }

        let paths = if has_glob_meta(spec) {
            self.walk_glob(spec)?
        } else {
            let path = self.root.join(spec);
            if path.is_dir() {
                self.walk_dir(&path)?
            } else {
                // Missing files surface as a per-item NotFound from open().
                vec![path]
            }
        };

        let mut locators: Vec<String> = paths.iter().map(|p| self.locator_for(p)).collect();
        locators.sort();
        locators.dedup();
        Ok(locators)
    }

    async fn open(&self, locator: &str) -> Result<SourceItem, IngestError> {
        let path = self.path_for(locator);

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error(locator, e))?;
        if !metadata.is_file() {
            return Err(IngestError::Source(format!("{} is not a regular file", locator)));
        }

        let content = tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(locator, e))?;

        let modified: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH));

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| locator.to_string());

        let content_type = detect_content_type(&name);
        let acl = Self::read_sidecar_acl(locator, &path).await?;

        Ok(SourceItem::new(locator, name, content, content_type, modified).with_acl(acl))
    }
}

fn io_error(locator: &str, e: std::io::Error) -> IngestError {
    match e.kind() {
        std::io::ErrorKind::NotFound => IngestError::NotFound(locator.to_string()),
        std::io::ErrorKind::PermissionDenied => IngestError::AccessDenied(locator.to_string()),
        _ => IngestError::Source(format!("{}: {}", locator, e)),
    }
}
