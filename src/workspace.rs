//! Open-document tracking and workspace-root-relative path resolution.

use rustc_hash::FxHashMap;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("invalid document uri: {0}")]
    InvalidUri(String),
    #[error("document is outside of workspace root: {0}")]
    OutsideRoot(String),
}

/// Tracks every document the client has opened, keyed by a path relative to
/// the workspace root (matching the original's `root_dir`-stripped keys).
pub struct Workspace {
    root_dir: String,
    docs: FxHashMap<String, String>,
}

impl Workspace {
    pub fn new(root_dir: impl Into<String>) -> Self {
        let mut root_dir = root_dir.into();
        if !root_dir.is_empty() && !root_dir.ends_with('/') {
            root_dir.push('/');
        }
        Self {
            root_dir,
            docs: FxHashMap::default(),
        }
    }

    pub fn root_dir(&self) -> &str {
        &self.root_dir
    }

    /// Strip the workspace root prefix from a document URI's path, rejecting
    /// documents outside the root entirely (mirrors
    /// `buxn_ls_workspace_resolve_path`).
    pub fn resolve_path(&self, uri: &str) -> Result<String, WorkspaceError> {
        let parsed = Url::parse(uri).map_err(|_| WorkspaceError::InvalidUri(uri.to_string()))?;
        let path = parsed.path();
        if let Some(relative) = path.strip_prefix(&self.root_dir) {
            Ok(relative.to_string())
        } else {
            Err(WorkspaceError::OutsideRoot(path.to_string()))
        }
    }

    pub fn did_open(&mut self, path: String, text: String) {
        if self.docs.contains_key(&path) {
            tracing::warn!(%path, "document is already opened");
        } else {
            tracing::info!(%path, "registering document");
        }
        self.docs.insert(path, text);
    }

    /// Full-document sync only: only the *last* element of `contentChanges`
    /// is consulted, matching the original's explicit "TODO: support
    /// incremental sync" stance which this edition does not lift.
    pub fn did_change(&mut self, path: String, text: String) {
        if !self.docs.contains_key(&path) {
            tracing::warn!(%path, "document was not opened");
        } else {
            tracing::info!(%path, "updating document");
        }
        self.docs.insert(path, text);
    }

    pub fn did_close(&mut self, path: &str) {
        if self.docs.remove(path).is_none() {
            tracing::warn!(%path, "document was not opened");
        } else {
            tracing::info!(%path, "closing document");
        }
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.docs.get(path).map(String::as_str)
    }

    pub fn iter_open(&self) -> impl Iterator<Item = (&str, &str)> {
        self.docs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_path_relative_to_root() {
        let ws = Workspace::new("/home/user/project");
        let path = ws.resolve_path("file:///home/user/project/src/main.tal").unwrap();
        assert_eq!(path, "src/main.tal");
    }

    #[test]
    fn rejects_path_outside_root() {
        let ws = Workspace::new("/home/user/project");
        assert!(matches!(
            ws.resolve_path("file:///etc/passwd"),
            Err(WorkspaceError::OutsideRoot(_))
        ));
    }

    #[test]
    fn did_change_replaces_whole_document() {
        let mut ws = Workspace::new("/root");
        ws.did_open("a.tal".into(), "old".into());
        ws.did_change("a.tal".into(), "new".into());
        assert_eq!(ws.get("a.tal"), Some("new"));
    }

    #[test]
    fn did_close_removes_document() {
        let mut ws = Workspace::new("/root");
        ws.did_open("a.tal".into(), "x".into());
        ws.did_close("a.tal");
        assert_eq!(ws.get("a.tal"), None);
    }
}
