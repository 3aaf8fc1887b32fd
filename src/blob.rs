//! Filesystem blob store for voice memos and rendered letters.
//!
//! Paths are relative to the store root: `<prefix>/<owner>/<timestamp>-<id>.<ext>`.
//! Blobs are written once and never mutated; an upload whose database row was
//! lost is unreferenced and harmless.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::models::new_id;

/// Blob kind, mapped to a directory prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    /// Inbound media (voice memos).
    Memo,
    /// Rendered letter PDFs.
    Draft,
}

impl BlobKind {
    fn prefix(self) -> &'static str {
        match self {
            BlobKind::Memo => "memos",
            BlobKind::Draft => "drafts",
        }
    }
}

fn suffix_for(mime_type: &str) -> Result<&'static str> {
    match mime_type {
        "audio/ogg" => Ok(".ogg"),
        "application/pdf" => Ok(".pdf"),
        other => Err(Error::UnsupportedContent(format!(
            "no blob suffix for mime type '{other}'"
        ))),
    }
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Store bytes under a fresh path for `owner_id` and return that path.
    pub fn upload(
        &self,
        bytes: &[u8],
        kind: BlobKind,
        owner_id: &str,
        mime_type: &str,
    ) -> Result<String> {
        let stamp = chrono::Utc::now().format("%Y-%m-%d_%H-%M-%S");
        let blob_path = format!(
            "{}/{}/{}-{}{}",
            kind.prefix(),
            owner_id,
            stamp,
            &new_id()[..8],
            suffix_for(mime_type)?
        );
        let full = self.root.join(&blob_path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, bytes)?;
        tracing::debug!("stored {} byte blob at {}", bytes.len(), blob_path);
        Ok(blob_path)
    }

    pub fn download(&self, blob_path: &str) -> Result<Vec<u8>> {
        let full = self.root.join(blob_path);
        std::fs::read(&full).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("blob {blob_path}"))
            } else {
                Error::Io(e)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_download_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());

        let path = store
            .upload(b"pdf bytes", BlobKind::Draft, "user-1", "application/pdf")
            .unwrap();
        assert!(path.starts_with("drafts/user-1/"));
        assert!(path.ends_with(".pdf"));
        assert_eq!(store.download(&path).unwrap(), b"pdf bytes");
    }

    #[test]
    fn test_memo_prefix_and_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());

        let path = store
            .upload(b"oggs", BlobKind::Memo, "user-1", "audio/ogg")
            .unwrap();
        assert!(path.starts_with("memos/user-1/"));
        assert!(path.ends_with(".ogg"));
    }

    #[test]
    fn test_unknown_mime_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        assert!(store
            .upload(b"x", BlobKind::Memo, "user-1", "video/mp4")
            .is_err());
    }

    #[test]
    fn test_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        assert!(matches!(
            store.download("drafts/u/missing.pdf").unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
