//! Workspace-confined file operations with state capture.
//!
//! Every mutating operation returns the bytes that were at the path
//! before the change (`None` = the file did not exist), so the action log
//! can record an exact inverse and the undo service can restore it.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use ud_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Path validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate and resolve a requested path within a workspace root.
///
/// Rejects absolute paths and `..` components, then checks the resolved
/// path still lives under the canonicalized root.
pub fn validate_path(workspace_root: &Path, requested: &str) -> Result<PathBuf> {
    let requested_path = Path::new(requested);
    if requested_path.is_absolute() {
        return Err(Error::Validation(format!(
            "absolute paths are not allowed (got '{requested}')"
        )));
    }
    for component in requested_path.components() {
        if matches!(component, Component::ParentDir) {
            return Err(Error::Validation(
                "path must not contain '..' components".into(),
            ));
        }
    }

    let canonical_root = workspace_root.canonicalize().map_err(|e| {
        Error::Validation(format!(
            "cannot resolve workspace root '{}': {e}",
            workspace_root.display()
        ))
    })?;
    let candidate = canonical_root.join(requested_path);

    // Canonicalize the longest existing prefix; the target itself may not
    // exist yet (e.g. a new file being written).
    let resolved = if candidate.exists() {
        candidate
            .canonicalize()
            .map_err(|e| Error::Validation(format!("cannot resolve '{}': {e}", candidate.display())))?
    } else {
        candidate.clone()
    };

    if !resolved.starts_with(&canonical_root) {
        return Err(Error::Validation(format!(
            "path '{requested}' escapes the workspace"
        )));
    }
    Ok(candidate)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State capture / restore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The bytes at a path, or `None` if no file exists there.
pub fn capture_state(path: &Path) -> Result<Option<Vec<u8>>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Restore a captured state: write the bytes back, or remove the file if
/// the captured state was absence.
pub fn restore_state(path: &Path, state: Option<&[u8]>) -> Result<()> {
    match state {
        Some(bytes) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, bytes)?;
        }
        None => match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        },
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Operations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Outcome of a mutating file operation, with before/after snapshots for
/// the action log.
#[derive(Debug)]
pub struct Mutation {
    pub path: PathBuf,
    pub before: Option<Vec<u8>>,
    pub after: Option<Vec<u8>>,
}

pub fn read_file(workspace_root: &Path, requested: &str) -> Result<String> {
    let path = validate_path(workspace_root, requested)?;
    std::fs::read_to_string(&path)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("no such file: {requested}")),
            _ => e.into(),
        })
}

pub fn write_file(workspace_root: &Path, requested: &str, content: &str) -> Result<Mutation> {
    let path = validate_path(workspace_root, requested)?;
    let before = capture_state(&path)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, content)?;
    Ok(Mutation {
        before,
        after: Some(content.as_bytes().to_vec()),
        path,
    })
}

pub fn append_file(workspace_root: &Path, requested: &str, content: &str) -> Result<Mutation> {
    let path = validate_path(workspace_root, requested)?;
    let before = capture_state(&path)?;
    let mut combined = before.clone().unwrap_or_default();
    combined.extend_from_slice(content.as_bytes());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, &combined)?;
    Ok(Mutation {
        before,
        after: Some(combined),
        path,
    })
}

pub fn delete_file(workspace_root: &Path, requested: &str) -> Result<Mutation> {
    let path = validate_path(workspace_root, requested)?;
    let before = capture_state(&path)?;
    if before.is_none() {
        return Err(Error::NotFound(format!("no such file: {requested}")));
    }
    std::fs::remove_file(&path)?;
    Ok(Mutation {
        before,
        after: None,
        path,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

pub fn list_dir(workspace_root: &Path, requested: &str) -> Result<Vec<DirEntry>> {
    let path = validate_path(workspace_root, requested)?;
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(&path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            size: meta.len(),
            is_dir: meta.is_dir(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}
