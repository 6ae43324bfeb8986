//! Client configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The file path
//! defaults to `ftaas.yaml` and can be changed with the `-f` flag or the `FTAAS_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! 1. **YAML config file** - Base configuration (default: `ftaas.yaml`)
//! 2. **Environment variables** - Variables prefixed with `FTAAS_` override YAML values
//!
//! Nested values use double underscores, e.g. `FTAAS_AUTH__CLIENT_SECRET=...` sets
//! `auth.client_secret` and `FTAAS_RETRY__MAX_RETRIES=5` sets `retry.max_retries`.
//!
//! ## Example
//!
//! ```yaml
//! auth:
//!   token_url: https://api-test.raet.com/authentication/token
//!   client_id: MyClientId
//!   refresh_margin: 30s
//! upload:
//!   base_url: https://api-test.raet.com/mft/v1.0
//!   default_tenant_id: MyTenantId
//!   timeout: 5m
//! retry:
//!   max_retries: 3
//!   backoff: 1s
//! transfer:
//!   max_concurrency: 8
//! ```

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use reqwest::header::HeaderName;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::encoding::BodyMode;
use crate::error::Error;

/// Header carrying the tenant for multi-tenant tokens.
pub const DEFAULT_TENANT_HEADER: &str = "x-raet-tenant-id";

/// Command line arguments of the `ftaas` binary.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "FTAAS_CONFIG", default_value = "ftaas.yaml")]
    pub config: String,

    /// Validate configuration and exit
    #[arg(long)]
    pub validate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Retrieve an access token from the identity provider and print it
    Token,

    /// Upload one or more files
    Upload {
        /// Business type the files are classified as
        #[arg(long, default_value_t = 0)]
        business_type_id: i64,

        /// Tenant to upload into (only for multi-tenant tokens)
        #[arg(long)]
        tenant_id: Option<String>,

        /// Print results as each upload finishes instead of in submission order
        #[arg(long)]
        race: bool,

        /// Files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Identity provider settings
    pub auth: AuthConfig,
    /// Upload endpoint settings
    pub upload: UploadConfig,
    /// Retry policy for transport failures and server errors
    pub retry: RetryConfig,
    /// Concurrent transfer settings
    pub transfer: TransferConfig,
}

/// Client-credentials settings for the identity provider.
#[derive(Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Token endpoint of the identity provider
    pub token_url: Url,
    pub client_id: String,
    /// Never serialized back out
    #[serde(skip_serializing)]
    pub client_secret: SecretString,
    /// Validity assumed when the token response carries no `expires_in`
    #[serde(with = "humantime_serde")]
    pub default_validity: Duration,
    /// A cached token is refreshed this long before it expires
    #[serde(with = "humantime_serde")]
    pub refresh_margin: Duration,
    /// Deadline for the token request
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_url: Url::parse("https://api-test.raet.com/authentication/token").unwrap(),
            client_id: String::new(),
            client_secret: SecretString::default(),
            default_validity: Duration::from_secs(3600),
            refresh_margin: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("token_url", &self.token_url.as_str())
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("default_validity", &self.default_validity)
            .field("refresh_margin", &self.refresh_margin)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Upload endpoint settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadConfig {
    /// Base URL of the File API
    pub base_url: Url,
    /// Path of the upload operation, appended to `base_url`
    pub path: String,
    /// Header the tenant id is sent in
    pub tenant_header: String,
    /// Tenant used when neither the call nor the request names one
    pub default_tenant_id: Option<String>,
    /// Deadline for each upload attempt
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Whether content is buffered (known length, retryable) or streamed
    pub body_mode: BodyMode,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse("https://api-test.raet.com/mft/v1.0").unwrap(),
            path: "/files".to_string(),
            tenant_header: DEFAULT_TENANT_HEADER.to_string(),
            default_tenant_id: None,
            timeout: Duration::from_secs(300),
            body_mode: BodyMode::Buffered,
        }
    }
}

impl UploadConfig {
    /// Full URL of the upload operation.
    pub fn upload_url(&self) -> Result<Url, Error> {
        let url = format!("{}{}", self.base_url.as_str().trim_end_matches('/'), self.path);
        Url::parse(&url).map_err(|e| Error::Config {
            message: format!("invalid upload URL '{url}': {e}"),
        })
    }
}

/// Retry policy for retryable upload failures.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after the first attempt; 0 disables retrying
    pub max_retries: u32,
    /// Base backoff (will be exponentially increased)
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
    /// Factor by which the backoff is increased with each retry
    pub backoff_factor: u32,
    /// Upper bound for a single backoff
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(1),
            backoff_factor: 2,
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Backoff before retry number `retry_attempt + 1`:
    /// `backoff * backoff_factor ^ retry_attempt`, capped at `max_backoff`.
    pub fn backoff_for(&self, retry_attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(self.backoff_factor.saturating_pow(retry_attempt))
            .min(self.max_backoff)
    }
}

/// Concurrent transfer settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    /// Maximum uploads running at once; unbounded when unset
    pub max_concurrency: Option<usize>,
    /// Cancel the rest of a batch as soon as one upload fails
    pub abort_on_failure: bool,
}

impl Config {
    /// Load configuration from the file named in `args`, then the environment.
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            // FTAAS_CONFIG names the file itself
            .merge(Env::prefixed("FTAAS_").ignore(&["config"]).split("__"))
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.auth.client_id.trim().is_empty() {
            return Err(Error::Config {
                message: "auth.client_id is required".to_string(),
            });
        }
        if self.auth.client_secret.expose_secret().is_empty() {
            return Err(Error::Config {
                message: "auth.client_secret is required (set FTAAS_AUTH__CLIENT_SECRET)".to_string(),
            });
        }
        if !self.upload.path.starts_with('/') {
            return Err(Error::Config {
                message: format!("upload.path must start with '/', got '{}'", self.upload.path),
            });
        }
        if HeaderName::from_bytes(self.upload.tenant_header.as_bytes()).is_err() {
            return Err(Error::Config {
                message: format!("upload.tenant_header '{}' is not a valid header name", self.upload.tenant_header),
            });
        }
        if self.upload.timeout.is_zero() {
            return Err(Error::Config {
                message: "upload.timeout must be greater than zero".to_string(),
            });
        }
        if self.retry.backoff_factor == 0 {
            return Err(Error::Config {
                message: "retry.backoff_factor must be at least 1".to_string(),
            });
        }
        if self.transfer.max_concurrency == Some(0) {
            return Err(Error::Config {
                message: "transfer.max_concurrency must be at least 1 when set".to_string(),
            });
        }
        self.upload.upload_url()?;
        Ok(())
    }
}
