//! Single-file upload against the File API.

use std::sync::Arc;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use url::Url;

use crate::auth::{Credential, TokenProvider, TokenSource};
use crate::config::{RetryConfig, UploadConfig};
use crate::encoding::{BodyMode, TransferEncoder, WireBody};
use crate::error::{Error, Result};
use crate::types::{FileContent, FileUploadInfo, UploadRequest};

/// Uploads one file per call, with bearer authentication and retries.
pub struct UploadClient<S: TokenSource> {
    http: reqwest::Client,
    tokens: Arc<TokenProvider<S>>,
    encoder: TransferEncoder,
    upload_url: Url,
    config: UploadConfig,
    retry: RetryConfig,
}

impl<S: TokenSource> UploadClient<S> {
    pub fn new(http: reqwest::Client, tokens: Arc<TokenProvider<S>>, config: UploadConfig, retry: RetryConfig) -> Result<Self> {
        let upload_url = config.upload_url()?;
        Ok(Self {
            http,
            tokens,
            encoder: TransferEncoder::new(),
            upload_url,
            config,
            retry,
        })
    }

    pub fn tokens(&self) -> &Arc<TokenProvider<S>> {
        &self.tokens
    }

    pub fn upload_url(&self) -> &Url {
        &self.upload_url
    }

    /// Upload `content` under the metadata in `request`.
    ///
    /// The tenant is `tenant_id` if given, else the request's, else the configured default.
    ///
    /// Transport failures and server errors are retried with exponential backoff, up to
    /// `retry.max_retries` times. A 401/403 triggers one token refresh and one more attempt.
    /// Streamed bodies are never retried, but a rejected token is still dropped from the cache.
    ///
    /// Uploads are not idempotent: when a response is lost after the backend stored the file,
    /// the retry stores it a second time.
    ///
    /// # Errors
    /// - [`Error::InvalidRequest`] if the request is invalid (nothing is sent)
    /// - [`Error::AuthFailure`] if no credential can be obtained
    /// - [`Error::Encoding`] if the content cannot be read
    /// - [`Error::AuthRejected`] if the token is rejected again after a refresh
    /// - [`Error::Validation`] for other 4xx responses, with the backend payload
    /// - [`Error::Transport`] / [`Error::Server`] once retries are exhausted
    #[tracing::instrument(
        skip(self, request, content),
        fields(name = %request.name, business_type_id = request.business_type_id)
    )]
    pub async fn upload(&self, request: &UploadRequest, content: FileContent, tenant_id: Option<&str>) -> Result<FileUploadInfo> {
        request.validate()?;

        let tenant = tenant_id
            .or(request.tenant_id.as_deref())
            .or(self.config.default_tenant_id.as_deref());

        let body = match self.config.body_mode {
            BodyMode::Buffered => self.encoder.encode(request, content).await?,
            BodyMode::Streamed => self.encoder.encode_streaming(request, content),
        };

        tracing::debug!(
            content_length = body.content_length(),
            tenant = tenant.unwrap_or("-"),
            "Encoded upload body"
        );

        // Reading a buffered body may outlast the cached credential
        let credential = self.tokens.get_token().await?;

        self.send_with_retry(body, credential, tenant).await
    }

    async fn send_with_retry(&self, body: WireBody, mut credential: Arc<Credential>, tenant: Option<&str>) -> Result<FileUploadInfo> {
        let mut body = body;
        let mut retry_attempt = 0u32;
        let mut reauthenticated = false;

        loop {
            let replay = body.try_clone();

            let error = match self.send_once(body, &credential, tenant).await {
                Ok(info) => {
                    tracing::info!(id = %info.id, size = info.size, "File uploaded");
                    return Ok(info);
                }
                Err(error) => error,
            };

            match error {
                Error::AuthRejected { status } if !reauthenticated => {
                    let Some(next) = replay else {
                        tracing::warn!(status, "Access token rejected; streamed body cannot be resent");
                        self.tokens.discard_rejected(&credential);
                        return Err(Error::AuthRejected { status });
                    };
                    tracing::warn!(status, "Access token rejected, refreshing and retrying once");
                    credential = self.tokens.refresh_after_rejection(&credential).await?;
                    reauthenticated = true;
                    body = next;
                }
                error if error.is_retryable() && retry_attempt < self.retry.max_retries => {
                    let Some(next) = replay else {
                        tracing::warn!(error = %error, "Upload failed; streamed body cannot be resent");
                        return Err(error);
                    };
                    let backoff = self.retry.backoff_for(retry_attempt);
                    tracing::warn!(
                        error = %error,
                        retry_attempt = retry_attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "Upload failed, retrying with exponential backoff"
                    );
                    tokio::time::sleep(backoff).await;
                    retry_attempt += 1;
                    // The backoff may have outlived the credential
                    credential = self.tokens.get_token().await?;
                    body = next;
                }
                error => {
                    if matches!(error, Error::AuthRejected { .. }) {
                        self.tokens.discard_rejected(&credential);
                    }
                    tracing::warn!(error = %error, retry_attempt, "Upload failed permanently");
                    return Err(error);
                }
            }
        }
    }

    async fn send_once(&self, body: WireBody, credential: &Credential, tenant: Option<&str>) -> Result<FileUploadInfo> {
        let mut request = self
            .http
            .post(self.upload_url.clone())
            .timeout(self.config.timeout)
            .bearer_auth(credential.expose_token())
            .header(CONTENT_TYPE, body.content_type())
            .header(ACCEPT, "application/json");

        if let Some(tenant) = tenant {
            request = request.header(self.config.tenant_header.as_str(), tenant);
        }

        let response = request.body(body.into_body()).send().await.map_err(|e| {
            tracing::debug!(error = %e, "Upload request failed");
            Error::from_reqwest(e)
        })?;

        let status = response.status();
        let text = response.text().await.map_err(Error::from_reqwest)?;

        if !status.is_success() {
            tracing::debug!(status = status.as_u16(), response_len = text.len(), "Upload endpoint returned an error");
            return Err(Error::from_status(status.as_u16(), text));
        }

        serde_json::from_str(&text).map_err(|e| Error::InvalidResponse {
            message: format!("{e}: {text}"),
        })
    }
}
