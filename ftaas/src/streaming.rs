//! The client most callers use: token, single uploads and batches behind one handle.

use std::sync::Arc;

use crate::auth::{ClientCredentialsSource, Credential, TokenProvider, TokenSource};
use crate::client::UploadClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::orchestrator::{CompletionPolicy, TransferBatch, TransferOrchestrator, TransferOutcome};
use crate::types::{FileContent, FileUploadInfo, UploadRequest};

/// Entry point to the File API.
///
/// Cheap to share behind an `Arc`; all uploads reuse one HTTP connection pool and one
/// cached credential.
pub struct StreamingClient<S: TokenSource = ClientCredentialsSource> {
    orchestrator: TransferOrchestrator<S>,
}

impl StreamingClient<ClientCredentialsSource> {
    /// Client authenticating with the client-credentials grant from `config.auth`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = build_http_client()?;
        let source = ClientCredentialsSource::from_config(http.clone(), &config.auth);
        Self::assemble(http, source, config)
    }
}

impl<S: TokenSource> StreamingClient<S> {
    /// Client obtaining its credentials from a custom source.
    pub fn with_source(source: S, config: &Config) -> Result<Self> {
        Self::assemble(build_http_client()?, source, config)
    }

    fn assemble(http: reqwest::Client, source: S, config: &Config) -> Result<Self> {
        let tokens = Arc::new(TokenProvider::new(source, config.auth.refresh_margin));
        let client = UploadClient::new(http, tokens, config.upload.clone(), config.retry)?;
        Ok(Self {
            orchestrator: TransferOrchestrator::new(Arc::new(client), config.transfer.clone()),
        })
    }

    /// A currently valid access token, issued on first use and cached afterwards.
    pub async fn get_token(&self) -> Result<Arc<Credential>> {
        self.tokens().get_token().await
    }

    /// Upload one file.
    pub async fn upload_one(&self, request: &UploadRequest, content: FileContent, tenant_id: Option<&str>) -> Result<FileUploadInfo> {
        self.orchestrator.client().upload(request, content, tenant_id).await
    }

    /// Upload many files concurrently; see [`TransferOrchestrator::upload_many`].
    pub async fn upload_many(
        &self,
        items: Vec<(UploadRequest, FileContent)>,
        tenant_id: Option<&str>,
        policy: CompletionPolicy,
    ) -> Vec<TransferOutcome> {
        self.orchestrator.upload_many(items, tenant_id, policy).await
    }

    /// Start uploading many files and receive the outcomes as they finish.
    pub async fn first_completed(&self, items: Vec<(UploadRequest, FileContent)>, tenant_id: Option<&str>) -> TransferBatch {
        self.orchestrator.first_completed(items, tenant_id).await
    }

    /// Cancel every upload started through this client.
    pub fn cancel_all(&self) {
        self.orchestrator.cancel_all();
    }

    pub fn tokens(&self) -> &Arc<TokenProvider<S>> {
        self.orchestrator.client().tokens()
    }

    pub fn orchestrator(&self) -> &TransferOrchestrator<S> {
        &self.orchestrator
    }
}

fn build_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| Error::Config {
            message: format!("failed to build HTTP client: {e}"),
        })
}
