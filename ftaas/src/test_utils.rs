//! Shared fixtures: a mock identity provider, an echoing upload endpoint and a multipart parser.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use url::Url;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use crate::auth::{ClientCredentialsSource, TokenProvider};
use crate::client::UploadClient;
use crate::config::Config;

pub const TOKEN_PATH: &str = "/authentication/token";
pub const UPLOAD_PATH: &str = "/files";

/// Identity provider that issues `test-token` for an hour.
pub async fn mount_token_endpoint(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "test-token",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .mount(server)
        .await;
}

/// Configuration pointing both endpoints at `server`, with short backoffs.
pub fn test_config(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.auth.token_url = Url::parse(&format!("{}{}", server.uri(), TOKEN_PATH)).unwrap();
    config.auth.client_id = "MyClientId".to_string();
    config.auth.client_secret = SecretString::from("MyClientSecret");
    config.upload.base_url = Url::parse(&server.uri()).unwrap();
    config.upload.path = UPLOAD_PATH.to_string();
    config.retry.backoff = Duration::from_millis(10);
    config.retry.max_backoff = Duration::from_millis(50);
    config
}

pub fn upload_client(config: &Config) -> Arc<UploadClient<ClientCredentialsSource>> {
    let http = reqwest::Client::new();
    let source = ClientCredentialsSource::from_config(http.clone(), &config.auth);
    let tokens = Arc::new(TokenProvider::new(source, config.auth.refresh_margin));
    Arc::new(UploadClient::new(http, tokens, config.upload.clone(), config.retry).unwrap())
}

/// Printable content of exactly `len` bytes.
pub fn text_of_len(len: usize) -> Vec<u8> {
    const TEXT: &[u8] = b"A cat can jump up to six times its length. Cats sleep for most of the day. Meow. ";
    TEXT.iter().copied().cycle().take(len).collect()
}

#[derive(Debug, Clone)]
pub struct Part {
    pub filename: Option<String>,
    pub body: Vec<u8>,
}

/// Split a `multipart/form-data` body into its parts, keyed by field name.
pub fn parse_multipart(content_type: &str, body: &[u8]) -> HashMap<String, Part> {
    let boundary = content_type
        .split("boundary=")
        .nth(1)
        .expect("content type has no boundary")
        .trim();
    let delimiter = format!("\r\n--{boundary}");
    let delimiter = delimiter.as_bytes();

    // With a leading CRLF every delimiter looks the same
    let mut data = b"\r\n".to_vec();
    data.extend_from_slice(body);

    let mut parts = HashMap::new();
    let mut start = find(&data, delimiter, 0).expect("no opening boundary") + delimiter.len();
    while !data[start..].starts_with(b"--") {
        let end = find(&data, delimiter, start).expect("unterminated part");
        let segment = &data[start + 2..end];
        let header_end = find(segment, b"\r\n\r\n", 0).expect("part without header block");
        let headers = std::str::from_utf8(&segment[..header_end]).expect("non-UTF-8 part headers");

        let name = disposition_param(headers, "name").expect("part without name");
        parts.insert(
            name,
            Part {
                filename: disposition_param(headers, "filename"),
                body: segment[header_end + 4..].to_vec(),
            },
        );
        start = end + delimiter.len();
    }
    parts
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|position| position + from)
}

fn disposition_param(headers: &str, key: &str) -> Option<String> {
    let marker = format!(" {key}=\"");
    let start = headers.find(&marker)? + marker.len();
    let len = headers[start..].find('"')?;
    Some(headers[start..start + len].to_string())
}

/// Upload endpoint that stores nothing and describes what it received.
///
/// Responses can be delayed or replaced by an error per file name.
#[derive(Debug, Clone, Default)]
pub struct EchoUpload {
    delays: HashMap<String, Duration>,
    failures: HashMap<String, u16>,
}

impl EchoUpload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, name: &str, delay: Duration) -> Self {
        self.delays.insert(name.to_string(), delay);
        self
    }

    pub fn with_failure(mut self, name: &str, status: u16) -> Self {
        self.failures.insert(name.to_string(), status);
        self
    }
}

impl Respond for EchoUpload {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let content_type = request
            .headers
            .get("content-type")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let parts = parse_multipart(content_type, &request.body);

        let name = parts
            .get("name")
            .map(|part| String::from_utf8_lossy(&part.body).into_owned())
            .unwrap_or_default();
        let size = parts.get("file").map(|part| part.body.len()).unwrap_or_default();

        let response = match self.failures.get(&name) {
            Some(&status) => ResponseTemplate::new(status).set_body_string(format!("{name} rejected")),
            None => ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": Uuid::new_v4().to_string(),
                "name": name,
                "size": size,
                "status": "uploaded"
            })),
        };

        match self.delays.get(&name) {
            Some(&delay) => response.set_delay(delay),
            None => response,
        }
    }
}
