//! Streaming upload client for the managed file-transfer File API.
//!
//! This crate provides:
//! - Client-credentials authentication with a cached, single-flight refreshed token
//! - `multipart/form-data` encoding of uploads, buffered or streamed
//! - Uploads with typed errors, exponential backoff and one re-authentication on 401/403
//! - Concurrent transfers delivered in submission order or in completion order
//!
//! # Example
//! ```ignore
//! use ftaas::{CompletionPolicy, Config, FileContent, StreamingClient, UploadRequest};
//!
//! let client = StreamingClient::from_config(&config)?;
//!
//! // Upload one file
//! let info = client
//!     .upload_one(&UploadRequest::new("report.csv", 0), FileContent::open("report.csv").await?, None)
//!     .await?;
//!
//! // Upload several, first finished first
//! let mut batch = client.first_completed(items, Some("MyTenantId")).await;
//! while let Some(outcome) = batch.next().await {
//!     println!("{}: {:?}", outcome.request.name, outcome.result);
//! }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod encoding;
pub mod error;
pub mod orchestrator;
pub mod streaming;
pub mod telemetry;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-export commonly used types
pub use auth::{ClientCredentialsSource, Credential, TokenProvider, TokenSource};
pub use client::UploadClient;
pub use config::Config;
pub use encoding::{BodyMode, TransferEncoder, WireBody};
pub use error::{Error, Result, TransportErrorKind};
pub use orchestrator::{CompletionPolicy, TransferBatch, TransferOrchestrator, TransferOutcome};
pub use streaming::StreamingClient;
pub use types::{BatchId, FileContent, FileUploadInfo, UploadRequest, UploadStatus};
