//! Client-credentials authentication against the identity provider.
//!
//! [`TokenProvider`] caches the bearer [`Credential`] returned by a [`TokenSource`] and
//! refreshes it shortly before it expires. Refresh is single-flight: when several uploads
//! find the credential missing or stale at the same moment, one issuance request is made and
//! every caller awaits its outcome.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use reqwest::header::CACHE_CONTROL;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use crate::config::AuthConfig;
use crate::error::{Error, Result};

/// A bearer token issued by the identity provider.
///
/// Replaced, never mutated, when refreshed. `Debug` does not print the token.
pub struct Credential {
    access_token: SecretString,
    token_type: String,
    issued_at: Instant,
    validity: Duration,
}

impl Credential {
    /// A credential issued now and valid for `validity`.
    pub fn new(access_token: impl Into<String>, validity: Duration) -> Self {
        Self {
            access_token: SecretString::from(access_token.into()),
            token_type: "Bearer".to_string(),
            issued_at: Instant::now(),
            validity,
        }
    }

    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = token_type.into();
        self
    }

    pub fn token_type(&self) -> &str {
        &self.token_type
    }

    pub fn issued_at(&self) -> Instant {
        self.issued_at
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    pub fn expires_at(&self) -> Instant {
        self.issued_at + self.validity
    }

    /// Whether a call started now may still use this credential, keeping `margin` in reserve.
    pub fn is_usable(&self, margin: Duration) -> bool {
        Instant::now() + margin < self.expires_at()
    }

    /// The raw token, for the `Authorization` header.
    pub fn expose_token(&self) -> &str {
        self.access_token.expose_secret()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("issued_at", &self.issued_at)
            .field("validity", &self.validity)
            .finish()
    }
}

/// Something that can issue a fresh credential.
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    /// Request a new credential.
    ///
    /// # Errors
    /// Returns [`Error::AuthFailure`] when no usable credential was issued.
    async fn fetch(&self) -> Result<Credential>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// OAuth2 client-credentials grant against a token endpoint.
pub struct ClientCredentialsSource {
    http: reqwest::Client,
    token_url: Url,
    client_id: String,
    client_secret: SecretString,
    default_validity: Duration,
    timeout: Duration,
}

impl ClientCredentialsSource {
    pub fn new(http: reqwest::Client, token_url: Url, client_id: impl Into<String>, client_secret: SecretString) -> Self {
        let defaults = AuthConfig::default();
        Self {
            http,
            token_url,
            client_id: client_id.into(),
            client_secret,
            default_validity: defaults.default_validity,
            timeout: defaults.timeout,
        }
    }

    pub fn from_config(http: reqwest::Client, config: &AuthConfig) -> Self {
        Self::new(
            http,
            config.token_url.clone(),
            config.client_id.clone(),
            config.client_secret.clone(),
        )
        .with_default_validity(config.default_validity)
        .with_timeout(config.timeout)
    }

    /// Validity assumed when the response carries no `expires_in`.
    pub fn with_default_validity(mut self, validity: Duration) -> Self {
        self.default_validity = validity;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Debug for ClientCredentialsSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentialsSource")
            .field("token_url", &self.token_url.as_str())
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenSource for ClientCredentialsSource {
    #[tracing::instrument(skip(self), fields(client_id = %self.client_id, token_url = %self.token_url))]
    async fn fetch(&self) -> Result<Credential> {
        tracing::debug!("Requesting access token");

        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
        ];

        let response = self
            .http
            .post(self.token_url.clone())
            .header(CACHE_CONTROL, "no-cache")
            .timeout(self.timeout)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Token request failed");
                Error::AuthFailure {
                    message: format!("token request failed: {e}"),
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| Error::AuthFailure {
            message: format!("failed to read token response: {e}"),
        })?;

        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), "Identity provider refused to issue a token");
            return Err(Error::AuthFailure {
                message: format!("identity provider returned HTTP {}: {}", status.as_u16(), body),
            });
        }

        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| Error::AuthFailure {
            message: format!("malformed token response: {e}"),
        })?;

        let access_token = parsed
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Error::AuthFailure {
                message: "token response has no access_token".to_string(),
            })?;

        let validity = parsed
            .expires_in
            .map(Duration::from_secs)
            .unwrap_or(self.default_validity);

        tracing::info!(expires_in_secs = validity.as_secs(), "Access token issued");

        let mut credential = Credential::new(access_token, validity);
        if let Some(token_type) = parsed.token_type {
            credential = credential.with_token_type(token_type);
        }
        Ok(credential)
    }
}

type Refresh = Shared<BoxFuture<'static, std::result::Result<Arc<Credential>, String>>>;

enum State {
    Absent,
    Valid(Arc<Credential>),
    Refreshing { generation: u64, refresh: Refresh },
}

/// Caches the credential of a [`TokenSource`] and refreshes it on expiry.
pub struct TokenProvider<S: TokenSource> {
    source: Arc<S>,
    state: Mutex<State>,
    refresh_margin: Duration,
    generations: AtomicU64,
}

impl<S: TokenSource> TokenProvider<S> {
    pub fn new(source: S, refresh_margin: Duration) -> Self {
        Self {
            source: Arc::new(source),
            state: Mutex::new(State::Absent),
            refresh_margin,
            generations: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// The cached credential, if one is held (usable or not).
    pub fn cached(&self) -> Option<Arc<Credential>> {
        match &*self.state.lock() {
            State::Valid(credential) => Some(Arc::clone(credential)),
            State::Absent | State::Refreshing { .. } => None,
        }
    }

    /// A credential that is usable now.
    ///
    /// Returns the cached credential while it is valid; otherwise joins the in-flight refresh
    /// or starts one.
    ///
    /// # Errors
    /// Returns [`Error::AuthFailure`] if issuance fails. Nothing is cached in that case, so
    /// the next call tries again.
    pub async fn get_token(&self) -> Result<Arc<Credential>> {
        let (generation, refresh) = {
            let mut state = self.state.lock();

            let in_flight = match &*state {
                State::Valid(credential) if credential.is_usable(self.refresh_margin) => {
                    return Ok(Arc::clone(credential));
                }
                State::Refreshing { generation, refresh } => Some((*generation, refresh.clone())),
                State::Valid(_) | State::Absent => None,
            };

            match in_flight {
                Some(joined) => {
                    tracing::trace!(generation = joined.0, "Joining in-flight token refresh");
                    joined
                }
                None => {
                    let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
                    let refresh = self.start_refresh();
                    tracing::debug!(generation, "Starting token refresh");
                    *state = State::Refreshing {
                        generation,
                        refresh: refresh.clone(),
                    };
                    (generation, refresh)
                }
            }
        };

        let outcome = refresh.await;
        self.settle(generation, &outcome);
        outcome.map_err(|message| Error::AuthFailure { message })
    }

    /// Replace a credential the upload endpoint rejected.
    ///
    /// The cache is only cleared if it still holds `rejected`, so concurrent rejections of the
    /// same token lead to a single issuance.
    pub async fn refresh_after_rejection(&self, rejected: &Arc<Credential>) -> Result<Arc<Credential>> {
        self.discard_rejected(rejected);
        self.get_token().await
    }

    /// Drop `rejected` from the cache if it is still the cached credential.
    pub fn discard_rejected(&self, rejected: &Arc<Credential>) {
        let mut state = self.state.lock();
        let is_current = matches!(&*state, State::Valid(current) if Arc::ptr_eq(current, rejected));
        if is_current {
            tracing::debug!("Discarding rejected access token");
            *state = State::Absent;
        }
    }

    /// Drop the cached credential; the next call issues a new one.
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        if matches!(&*state, State::Valid(_)) {
            *state = State::Absent;
        }
    }

    fn start_refresh(&self) -> Refresh {
        let source = Arc::clone(&self.source);
        async move {
            source.fetch().await.map(Arc::new).map_err(|e| match e {
                Error::AuthFailure { message } => message,
                other => other.to_string(),
            })
        }
        .boxed()
        .shared()
    }

    /// Record the outcome of refresh `generation`, unless a newer state replaced it already.
    fn settle(&self, generation: u64, outcome: &std::result::Result<Arc<Credential>, String>) {
        let mut state = self.state.lock();
        let is_current = matches!(&*state, State::Refreshing { generation: current, .. } if *current == generation);
        if !is_current {
            return;
        }

        *state = match outcome {
            Ok(credential) => State::Valid(Arc::clone(credential)),
            Err(message) => {
                tracing::warn!(generation, error = %message, "Token refresh failed, nothing cached");
                State::Absent
            }
        };
    }
}

impl<S: TokenSource> fmt::Debug for TokenProvider<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock() {
            State::Absent => "absent",
            State::Valid(_) => "valid",
            State::Refreshing { .. } => "refreshing",
        };
        f.debug_struct("TokenProvider")
            .field("state", &state)
            .field("refresh_margin", &self.refresh_margin)
            .finish()
    }
}
