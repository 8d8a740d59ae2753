//! File access for handlers.
//!
//! Documents the client has open are owned by the client: reads and writes
//! for them travel over the reverse RPC channel (`documents/get`,
//! `workspace/applyEdit`) so the runner always sees the editor buffer, not
//! the possibly-stale disk state. Everything else is plain disk I/O.
//!
//! A file's version is the client-reported document version for owned
//! documents and a SHA-256 digest of the bytes otherwise. Versions are
//! opaque strings compared for equality.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use serde::Deserialize;
use sha2::{Digest, Sha256};

use burnish_rpc::{PeerHandle, methods};
use burnish_types::path_key;

use crate::error::FileError;

/// A document's text together with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub text: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
struct ClientDocument {
    text: String,
    version: u64,
}

#[derive(Default)]
pub struct FileManager {
    peer: OnceLock<PeerHandle>,
    open_docs: Mutex<HashSet<PathBuf>>,
}

impl FileManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the RPC channel once the connection is up. Reads of open
    /// documents fail before this is called.
    pub fn set_peer(&self, peer: PeerHandle) {
        let _ = self.peer.set(peer);
    }

    /// The client channel, once bound. The file manager owns the reverse
    /// connection; handlers that need other client services reach it here.
    #[must_use]
    pub fn peer(&self) -> Option<PeerHandle> {
        self.peer.get().cloned()
    }

    pub fn document_opened(&self, path: PathBuf) {
        self.open_docs.lock().expect("open docs poisoned").insert(path);
    }

    pub fn document_closed(&self, path: &Path) {
        self.open_docs.lock().expect("open docs poisoned").remove(path);
    }

    #[must_use]
    pub fn is_open(&self, path: &Path) -> bool {
        self.open_docs.lock().expect("open docs poisoned").contains(path)
    }

    /// Current text and version of a file.
    pub async fn get_document(&self, path: &Path) -> Result<Document, FileError> {
        if self.is_open(path) {
            return self.get_client_document(path).await;
        }
        let bytes = tokio::fs::read(path).await.map_err(|e| FileError::Read {
            path: path_key(path),
            message: e.to_string(),
        })?;
        let version = digest_version(&bytes);
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Ok(Document { text, version })
    }

    /// Current version only; used by the cache for validity checks.
    pub async fn get_version(&self, path: &Path) -> Result<String, FileError> {
        self.get_document(path).await.map(|doc| doc.version)
    }

    /// Write new content back, through the client for owned documents.
    pub async fn save_document(&self, path: &Path, text: &str) -> Result<(), FileError> {
        if self.is_open(path) {
            let peer = self.client_peer(path)?;
            peer.request(
                methods::APPLY_EDIT,
                Some(serde_json::json!({
                    "file_path": path_key(path),
                    "text": text,
                })),
            )
            .await
            .map_err(|e| FileError::ClientDocument {
                path: path_key(path),
                message: e.to_string(),
            })?;
            return Ok(());
        }
        tokio::fs::write(path, text)
            .await
            .map_err(|e| FileError::Write {
                path: path_key(path),
                message: e.to_string(),
            })
    }

    async fn get_client_document(&self, path: &Path) -> Result<Document, FileError> {
        let peer = self.client_peer(path)?;
        let result = peer
            .request(
                methods::DOCUMENTS_GET,
                Some(serde_json::json!({ "file_path": path_key(path) })),
            )
            .await
            .map_err(|e| FileError::ClientDocument {
                path: path_key(path),
                message: e.to_string(),
            })?;
        let doc: ClientDocument =
            serde_json::from_value(result).map_err(|e| FileError::ClientDocument {
                path: path_key(path),
                message: format!("malformed documents/get result: {e}"),
            })?;
        Ok(Document {
            text: doc.text,
            version: doc.version.to_string(),
        })
    }

    fn client_peer(&self, path: &Path) -> Result<&PeerHandle, FileError> {
        self.peer.get().ok_or_else(|| FileError::ClientDocument {
            path: path_key(path),
            message: "no RPC channel bound".to_string(),
        })
    }
}

/// SHA-256 hex digest of file bytes, the version of any non-open file.
#[must_use]
pub fn digest_version(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Shortened digest for log lines. Client versions are short already.
#[must_use]
pub fn display_version(version: &str) -> &str {
    if version.len() > 12 { &version[..12] } else { version }
}
