//! Materialization of virtual project files onto disk.
//!
//! Everything here is synchronous; callers run it on `spawn_blocking`.

use crate::error::{PreviewError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Contents of one generated file, as sent by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VirtualFile {
    Text(String),
    Record {
        content: String,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
    },
}

impl VirtualFile {
    pub fn content(&self) -> &str {
        match self {
            VirtualFile::Text(content) => content,
            VirtualFile::Record { content, .. } => content,
        }
    }
}

impl From<&str> for VirtualFile {
    fn from(content: &str) -> Self {
        VirtualFile::Text(content.to_string())
    }
}

/// Relative path -> contents, as accepted by create and update.
pub type FileMap = BTreeMap<String, VirtualFile>;

/// A validated file ready to be written under an instance root.
#[derive(Debug, PartialEq, Eq)]
pub struct ResolvedFile {
    /// Normalized forward-slash path relative to the root
    pub path: String,
    pub bytes: Vec<u8>,
}

/// Validate every path and flatten the map into `(path, bytes)` pairs.
///
/// Nothing touches the disk here, so a bad path rejects the whole batch.
pub fn resolve_files(files: &FileMap) -> Result<Vec<ResolvedFile>> {
    files
        .iter()
        .map(|(path, file)| {
            Ok(ResolvedFile {
                path: normalize_path(path)?,
                bytes: file.content().as_bytes().to_vec(),
            })
        })
        .collect()
}

/// Normalize a caller-supplied path, rejecting anything that could escape the root.
pub fn normalize_path(raw: &str) -> Result<String> {
    let invalid = |reason| PreviewError::InvalidPath {
        path: raw.to_string(),
        reason,
    };

    let trimmed = raw.strip_prefix('/').unwrap_or(raw);
    if trimmed.contains('\\') {
        return Err(invalid("backslashes are not allowed"));
    }

    let mut parts = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) => parts.push(part),
                None => return Err(invalid("path is not valid UTF-8")),
            },
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(invalid("parent directory components are not allowed"))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(invalid("absolute paths are not allowed"))
            }
        }
    }

    if parts.is_empty() {
        return Err(invalid("path is empty"));
    }
    Ok(parts.join("/"))
}

/// Keep the project id usable as a single path component.
pub fn sanitize_project_id(project_id: &str) -> String {
    let cleaned: String = project_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .take(48)
        .collect();
    if cleaned.is_empty() {
        "project".to_string()
    } else {
        cleaned
    }
}

/// Create the private root directory for an instance.
pub fn create_instance_root(previews_dir: &Path, instance_id: &str) -> Result<PathBuf> {
    let root = previews_dir.join(instance_id);
    fs::create_dir_all(&root).map_err(|e| PreviewError::fs(&root, e))?;
    Ok(root)
}

/// Write files under `root`, creating intermediate directories.
///
/// Existing files not named in `files` are left alone.
pub fn write_files(root: &Path, files: &[ResolvedFile]) -> Result<()> {
    for file in files {
        let target = root.join(&file.path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| PreviewError::fs(parent, e))?;
        }
        fs::write(&target, &file.bytes).map_err(|e| PreviewError::fs(&target, e))?;
    }
    Ok(())
}

/// Remove an instance root and everything under it.
pub fn destroy_instance_root(root: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(root) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
