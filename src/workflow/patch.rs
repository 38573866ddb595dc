//! Patch validation and all-or-nothing application.
//!
//! Application runs in three steps:
//! 1. validate every path and record the current content of each target;
//! 2. stage new content under `.autoship-staging/` (the live tree is untouched);
//! 3. commit by renaming staged files into place and removing deletions.
//!
//! A failure in step 3 restores every already-committed path from the
//! step-1 record and removes directories the commit created, so the next
//! stage sees either the whole patch or none of it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};

use super::sandbox::Workspace;
use crate::errors::{PatchError, SandboxError};

/// Scratch directory for staged writes, relative to the workspace root.
pub const STAGING_DIR: &str = ".autoship-staging";

/// New state for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "content", rename_all = "snake_case")]
pub enum FileChange {
    /// Replace (or create) the file with this full content.
    Write(String),
    Delete,
}

/// The provider's proposed changes: path to new content or deletion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchDescription {
    files: BTreeMap<String, FileChange>,
}

impl PatchDescription {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a change. Listing the same path twice is rejected.
    pub fn insert(&mut self, path: impl Into<String>, change: FileChange) -> Result<(), PatchError> {
        let path = path.into();
        if self.files.contains_key(&path) {
            return Err(PatchError::invalid_path(&path, "listed more than once"));
        }
        self.files.insert(path, change);
        Ok(())
    }

    pub fn write(mut self, path: &str, content: &str) -> Self {
        self.files
            .insert(path.to_string(), FileChange::Write(content.to_string()));
        self
    }

    pub fn delete(mut self, path: &str) -> Self {
        self.files.insert(path.to_string(), FileChange::Delete);
        self
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileChange)> {
        self.files.iter()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }
}

impl<S: Into<String>> FromIterator<(S, FileChange)> for PatchDescription {
    fn from_iter<I: IntoIterator<Item = (S, FileChange)>>(iter: I) -> Self {
        Self {
            files: iter.into_iter().map(|(p, c)| (p.into(), c)).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedChange {
    pub path: String,
    pub kind: ChangeKind,
    /// New content; `None` for deletions.
    pub content: Option<String>,
    /// The file carried an execute bit before the change, and still does.
    #[serde(default)]
    pub executable: bool,
}

/// What actually changed in the workspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppliedChangeSet {
    pub changes: Vec<AppliedChange>,
}

impl AppliedChangeSet {
    pub fn paths(&self) -> Vec<String> {
        self.changes.iter().map(|c| c.path.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }
}

/// Normalise a patch path, rejecting anything that could land outside the
/// workspace or inside tooling directories.
pub fn normalize_path(raw: &str) -> Result<String, PatchError> {
    if raw.trim().is_empty() {
        return Err(PatchError::invalid_path(raw, "empty path"));
    }
    if raw.contains('\0') {
        return Err(PatchError::invalid_path(raw, "contains a NUL byte"));
    }
    if raw.contains('\\') {
        return Err(PatchError::invalid_path(raw, "backslashes are not allowed"));
    }
    let mut parts = Vec::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(PatchError::invalid_path(raw, "path traversal ('..') is not allowed"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PatchError::invalid_path(raw, "absolute paths are not allowed"));
            }
        }
    }
    match parts.first().map(String::as_str) {
        None => Err(PatchError::invalid_path(raw, "path names no file")),
        Some(".git") => Err(PatchError::invalid_path(raw, "cannot modify the .git directory")),
        Some(STAGING_DIR) => Err(PatchError::invalid_path(raw, "reserved path")),
        Some(_) => Ok(parts.join("/")),
    }
}

/// Check well-formedness: non-empty, every path valid, no two entries
/// naming the same file after normalisation.
pub fn validate(patch: &PatchDescription) -> Result<Vec<(String, FileChange)>, PatchError> {
    if patch.is_empty() {
        return Err(PatchError::Empty);
    }
    let mut seen = BTreeMap::new();
    for (raw, change) in patch.iter() {
        let path = normalize_path(raw)?;
        if seen.insert(path.clone(), change.clone()).is_some() {
            return Err(PatchError::invalid_path(raw, "listed more than once"));
        }
    }
    Ok(seen.into_iter().collect())
}

/// Apply `patch` to `workspace` as a unit.
pub async fn apply(workspace: &Workspace, patch: &PatchDescription) -> Result<AppliedChangeSet, PatchError> {
    let entries = validate(patch)?;

    // Step 1: record what is there now. Reading also resolves symlinks, so
    // a path that leads out of the workspace is refused before staging.
    let mut originals = Vec::with_capacity(entries.len());
    let mut executables = Vec::with_capacity(entries.len());
    for (path, change) in &entries {
        let current = workspace.read_file(path).await.map_err(|e| refuse_escape(path, e))?;
        if current.is_none() && *change == FileChange::Delete {
            return Err(PatchError::MissingFile { path: path.clone() });
        }
        let executable = current.is_some()
            && workspace
                .is_executable(path)
                .await
                .map_err(|e| refuse_escape(path, e))?;
        originals.push(current);
        executables.push(executable);
    }
    let mut new_dirs = BTreeSet::new();
    for ((path, change), original) in entries.iter().zip(&originals) {
        if original.is_none()
            && matches!(change, FileChange::Write(_))
            && let Some(dir) = first_missing_dir(workspace, path).await?
        {
            new_dirs.insert(dir);
        }
    }

    // Step 2: stage.
    workspace.remove_path(STAGING_DIR).await?;
    for (idx, (_, change)) in entries.iter().enumerate() {
        if let FileChange::Write(content) = change
            && let Err(e) = workspace.write_file(&staged(idx), content.as_bytes()).await
        {
            discard_staging(workspace).await;
            return Err(e.into());
        }
    }

    // Step 3: commit.
    for (idx, (path, change)) in entries.iter().enumerate() {
        let result = match change {
            FileChange::Write(_) => commit_write(workspace, &staged(idx), path, executables[idx]).await,
            FileChange::Delete => workspace.remove_path(path).await,
        };
        if let Err(e) = result {
            tracing::warn!(path = %path, "patch commit failed, rolling back: {}", e);
            rollback(
                workspace,
                &entries[..=idx],
                &originals[..=idx],
                &executables[..=idx],
                &new_dirs,
            )
            .await;
            discard_staging(workspace).await;
            return Err(e.into());
        }
    }
    discard_staging(workspace).await;

    let changes = entries
        .into_iter()
        .zip(originals)
        .zip(executables)
        .map(|(((path, change), original), executable)| match change {
            FileChange::Write(content) => AppliedChange {
                path,
                kind: if original.is_some() {
                    ChangeKind::Modified
                } else {
                    ChangeKind::Created
                },
                content: Some(content),
                executable,
            },
            FileChange::Delete => AppliedChange {
                path,
                kind: ChangeKind::Deleted,
                content: None,
                executable: false,
            },
        })
        .collect();
    Ok(AppliedChangeSet { changes })
}

fn staged(idx: usize) -> String {
    format!("{}/{}", STAGING_DIR, idx)
}

/// Move staged content into place. The staged file is new, so an execute
/// bit the target had is put back explicitly.
async fn commit_write(workspace: &Workspace, from: &str, to: &str, executable: bool) -> Result<(), SandboxError> {
    workspace.rename(from, to).await?;
    if executable {
        workspace.set_executable(to).await?;
    }
    Ok(())
}

fn refuse_escape(path: &str, err: SandboxError) -> PatchError {
    match err {
        SandboxError::Escape { .. } => {
            PatchError::invalid_path(path, "resolves outside the workspace through a symlink")
        }
        other => other.into(),
    }
}

/// The shallowest parent directory of `path` that does not exist yet.
async fn first_missing_dir(workspace: &Workspace, path: &str) -> Result<Option<String>, PatchError> {
    let parts: Vec<&str> = path.split('/').collect();
    for depth in 1..parts.len() {
        let dir = parts[..depth].join("/");
        if !workspace.exists(&dir).await.map_err(|e| refuse_escape(&dir, e))? {
            return Ok(Some(dir));
        }
    }
    Ok(None)
}

async fn rollback(
    workspace: &Workspace,
    entries: &[(String, FileChange)],
    originals: &[Option<Vec<u8>>],
    executables: &[bool],
    new_dirs: &BTreeSet<String>,
) {
    for (((path, _), original), executable) in entries.iter().zip(originals).zip(executables).rev() {
        let restored = match original {
            Some(bytes) => restore_file(workspace, path, bytes, *executable).await,
            None => workspace.remove_path(path).await,
        };
        if let Err(e) = restored {
            tracing::error!(path = %path, "rollback could not restore file: {}", e);
        }
    }
    // Nothing lived in these before the commit started.
    for dir in new_dirs {
        if let Err(e) = workspace.remove_path(dir).await {
            tracing::error!(path = %dir, "rollback could not remove directory: {}", e);
        }
    }
}

async fn restore_file(workspace: &Workspace, path: &str, bytes: &[u8], executable: bool) -> Result<(), SandboxError> {
    workspace.write_file(path, bytes).await?;
    if executable {
        workspace.set_executable(path).await?;
    }
    Ok(())
}

async fn discard_staging(workspace: &Workspace) {
    if let Err(e) = workspace.remove_path(STAGING_DIR).await {
        tracing::warn!("failed to remove staging directory: {}", e);
    }
}
