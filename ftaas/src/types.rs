//! Request and result values exchanged with the File API.

use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::pin::Pin;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Identifier of one orchestration call.
///
/// Uses a short, readable format like "batch_abc123xy" in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(Uuid);

impl BatchId {
    /// Create a new random batch ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Convert to a short, readable string format.
    pub fn to_short_string(&self) -> String {
        let hex = format!("{:x}", self.0.as_u128());
        format!("batch_{}", &hex[..8])
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_short_string())
    }
}

/// Metadata of a file to upload.
///
/// The bytes travel separately as a [`FileContent`], which can only be consumed once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    /// Name the file is stored under
    pub name: String,

    /// Business type the file is classified as
    pub business_type_id: i64,

    /// Tenant to upload into; only needed with a multi-tenant token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl UploadRequest {
    pub fn new(name: impl Into<String>, business_type_id: i64) -> Self {
        Self {
            name: name.into(),
            business_type_id,
            tenant_id: None,
        }
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Check the request before anything is read or sent.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidRequest {
                message: "file name must not be empty".to_string(),
            });
        }
        // The name is written verbatim into a multipart part
        if self.name.contains(['\r', '\n']) {
            return Err(Error::InvalidRequest {
                message: "file name must not contain line breaks".to_string(),
            });
        }
        Ok(())
    }
}

/// A single-pass source of file bytes.
///
/// Not `Clone`: handing the content to an upload moves it, so the same stream can
/// never be read by two uploads.
pub struct FileContent {
    reader: Pin<Box<dyn AsyncRead + Send + Sync>>,
    size_hint: Option<u64>,
}

impl FileContent {
    /// Content held in memory.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let size_hint = Some(bytes.len() as u64);
        Self {
            reader: Box::pin(Cursor::new(bytes)),
            size_hint,
        }
    }

    /// Content read from an arbitrary async reader.
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Sync + 'static,
    {
        Self {
            reader: Box::pin(reader),
            size_hint: None,
        }
    }

    /// Content streamed from a file on disk.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = tokio::fs::File::open(path.as_ref()).await.map_err(Error::Encoding)?;
        let size_hint = file.metadata().await.ok().map(|metadata| metadata.len());
        Ok(Self {
            reader: Box::pin(file),
            size_hint,
        })
    }

    /// Number of bytes expected, when known up front.
    pub fn size_hint(&self) -> Option<u64> {
        self.size_hint
    }

    pub(crate) fn into_reader(self) -> Pin<Box<dyn AsyncRead + Send + Sync>> {
        self.reader
    }
}

impl fmt::Debug for FileContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileContent")
            .field("size_hint", &self.size_hint)
            .finish_non_exhaustive()
    }
}

impl From<Vec<u8>> for FileContent {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<String> for FileContent {
    fn from(text: String) -> Self {
        Self::from_bytes(text)
    }
}

impl From<&'static str> for FileContent {
    fn from(text: &'static str) -> Self {
        Self::from_bytes(text)
    }
}

/// Processing state the backend reports for an uploaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    #[default]
    Uploaded,
    Processing,
    #[serde(other)]
    Unknown,
}

/// Description of a stored file, as returned by the upload endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadInfo {
    /// Identifier assigned by the backend
    #[serde(alias = "fileId")]
    pub id: String,

    /// Name echoed from the request
    pub name: String,

    /// Stored size in bytes
    pub size: u64,

    #[serde(default)]
    pub status: UploadStatus,
}
