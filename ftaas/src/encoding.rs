//! Wire encoding of upload requests.
//!
//! An upload travels as a `multipart/form-data` body with three parts, in order:
//!
//! - `name`: the file name
//! - `businessTypeId`: the business type, in decimal
//! - `file`: the content, `application/octet-stream`, with the file name as `filename`
//!
//! In [`BodyMode::Buffered`] the content is read completely before anything is sent, so the
//! body has a known length and can be replayed for retries. In [`BodyMode::Streamed`] the
//! content is forwarded chunk by chunk as it is read; such a body can be sent only once.

use std::fmt;
use std::ops::Range;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{FileContent, UploadRequest};

/// How upload content is put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyMode {
    /// Read the whole content first; known length, retryable
    #[default]
    Buffered,
    /// Stream the content as it is read; chunked, never retried
    Streamed,
}

/// Builds multipart bodies with a fixed boundary.
#[derive(Debug, Clone)]
pub struct TransferEncoder {
    boundary: String,
}

impl TransferEncoder {
    /// Encoder with a random boundary, fixed for its lifetime.
    pub fn new() -> Self {
        Self {
            boundary: format!("ftaas-{}", Uuid::new_v4().simple()),
        }
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Read `content` to the end and frame it with the request metadata.
    ///
    /// # Errors
    /// Returns [`Error::Encoding`] if the content stream fails before it is exhausted.
    pub async fn encode(&self, request: &UploadRequest, content: FileContent) -> Result<WireBody> {
        let capacity = content.size_hint().unwrap_or(0) as usize;
        let mut reader = content.into_reader();
        let mut bytes = Vec::with_capacity(capacity);
        reader.read_to_end(&mut bytes).await.map_err(Error::Encoding)?;

        Ok(self.frame(request, Bytes::from(bytes)))
    }

    /// Frame content that is already in memory. Pure: the same input gives the same body.
    ///
    /// `request` must have passed [`UploadRequest::validate`]; the name is written as is.
    pub fn frame(&self, request: &UploadRequest, content: Bytes) -> WireBody {
        let preamble = self.preamble(request);
        let epilogue = self.epilogue();

        let mut body = BytesMut::with_capacity(preamble.len() + content.len() + epilogue.len());
        body.put_slice(preamble.as_bytes());
        let start = body.len();
        body.put_slice(&content);
        let end = body.len();
        body.put_slice(epilogue.as_bytes());

        WireBody {
            content_type: self.content_type(),
            inner: Inner::Buffered {
                bytes: body.freeze(),
                content: start..end,
            },
        }
    }

    /// Frame `content` without reading it; bytes are pulled while the request is sent.
    pub fn encode_streaming(&self, request: &UploadRequest, content: FileContent) -> WireBody {
        let preamble = Bytes::from(self.preamble(request));
        let epilogue = Bytes::from(self.epilogue());

        let chunks = stream::iter([Ok::<Bytes, std::io::Error>(preamble)])
            .chain(ReaderStream::new(content.into_reader()))
            .chain(stream::iter([Ok(epilogue)]));

        WireBody {
            content_type: self.content_type(),
            inner: Inner::Streamed(reqwest::Body::wrap_stream(chunks)),
        }
    }

    fn preamble(&self, request: &UploadRequest) -> String {
        let boundary = &self.boundary;
        let filename = escape_quoted(&request.name);
        format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"name\"\r\n\r\n\
             {name}\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"businessTypeId\"\r\n\r\n\
             {business_type_id}\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n",
            name = request.name,
            business_type_id = request.business_type_id,
        )
    }

    fn epilogue(&self) -> String {
        format!("\r\n--{}--\r\n", self.boundary)
    }
}

impl Default for TransferEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Percent-encode the characters that would break a quoted header parameter.
fn escape_quoted(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => escaped.push_str("%22"),
            '\r' => escaped.push_str("%0D"),
            '\n' => escaped.push_str("%0A"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// An encoded request body, ready to send.
pub struct WireBody {
    content_type: String,
    inner: Inner,
}

enum Inner {
    Buffered { bytes: Bytes, content: Range<usize> },
    Streamed(reqwest::Body),
}

impl WireBody {
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Total body length; `None` for streamed bodies.
    pub fn content_length(&self) -> Option<u64> {
        match &self.inner {
            Inner::Buffered { bytes, .. } => Some(bytes.len() as u64),
            Inner::Streamed(_) => None,
        }
    }

    /// Byte range of the file content inside the body.
    pub fn content_range(&self) -> Option<Range<usize>> {
        match &self.inner {
            Inner::Buffered { content, .. } => Some(content.clone()),
            Inner::Streamed(_) => None,
        }
    }

    /// The file content as carried in the body.
    pub fn content_bytes(&self) -> Option<&[u8]> {
        match &self.inner {
            Inner::Buffered { bytes, content } => Some(&bytes[content.clone()]),
            Inner::Streamed(_) => None,
        }
    }

    /// The complete encoded body.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.inner {
            Inner::Buffered { bytes, .. } => Some(bytes),
            Inner::Streamed(_) => None,
        }
    }

    /// A second copy for a retry. Buffered bodies share their bytes; streamed bodies
    /// cannot be replayed.
    pub fn try_clone(&self) -> Option<WireBody> {
        match &self.inner {
            Inner::Buffered { bytes, content } => Some(WireBody {
                content_type: self.content_type.clone(),
                inner: Inner::Buffered {
                    bytes: bytes.clone(),
                    content: content.clone(),
                },
            }),
            Inner::Streamed(_) => None,
        }
    }

    pub(crate) fn into_body(self) -> reqwest::Body {
        match self.inner {
            Inner::Buffered { bytes, .. } => reqwest::Body::from(bytes),
            Inner::Streamed(body) => body,
        }
    }
}

impl fmt::Debug for WireBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireBody")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length())
            .finish_non_exhaustive()
    }
}
