//! AWS Signature Version 4 request signing.
//!
//! Both remote collaborators of the pipeline (S3 for image bytes, the
//! SageMaker runtime for inference) authenticate with SigV4. Requests are
//! sent with plain `reqwest` and signed here rather than through an SDK.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Hash of an empty payload, used for bodiless requests such as S3 GET.
pub const EMPTY_PAYLOAD_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AwsError {
    #[error("AWS {0} must not be empty")]
    MissingField(&'static str),
}

/// Static AWS credentials.
#[derive(Clone)]
pub struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl std::fmt::Debug for AwsCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .field("session_token", &self.session_token.is_some())
            .finish()
    }
}

impl AwsCredentials {
    /// Validates that both key halves are non-empty.
    pub fn new(access_key_id: String, secret_access_key: String) -> Result<Self, AwsError> {
        if access_key_id.trim().is_empty() {
            return Err(AwsError::MissingField("access key ID"));
        }
        if secret_access_key.trim().is_empty() {
            return Err(AwsError::MissingField("secret access key"));
        }
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token: None,
        })
    }

    /// Attach an optional session token (temporary credentials / STS).
    /// An empty token clears it.
    pub fn with_session_token(mut self, token: Option<String>) -> Self {
        self.session_token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }
}

/// Signs requests for one AWS service in one region.
#[derive(Debug, Clone)]
pub struct SigV4Signer {
    region: String,
    service: &'static str,
    credentials: AwsCredentials,
}

impl SigV4Signer {
    pub fn new(region: impl Into<String>, service: &'static str, credentials: AwsCredentials) -> Self {
        Self {
            region: region.into(),
            service,
            credentials,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Produce the headers that authenticate a request.
    ///
    /// `uri_path` must already be percent-encoded exactly as it will be sent.
    /// `datetime` is the `YYYYMMDDTHHMMSSZ` timestamp from [`amz_datetime`].
    pub fn sign(
        &self,
        method: &str,
        host: &str,
        uri_path: &str,
        body: &[u8],
        datetime: &str,
    ) -> Vec<(String, String)> {
        let date = &datetime[..8.min(datetime.len())];
        let payload_hash = hex_sha256(body);

        let mut signed_header_names = vec!["host", "x-amz-content-sha256", "x-amz-date"];
        if self.credentials.session_token.is_some() {
            signed_header_names.push("x-amz-security-token");
        }
        signed_header_names.sort_unstable();

        let mut canonical_headers = String::new();
        for name in &signed_header_names {
            let value = match *name {
                "host" => host,
                "x-amz-content-sha256" => payload_hash.as_str(),
                "x-amz-date" => datetime,
                "x-amz-security-token" => self.credentials.session_token.as_deref().unwrap_or(""),
                _ => "",
            };
            canonical_headers.push_str(name);
            canonical_headers.push(':');
            canonical_headers.push_str(value);
            canonical_headers.push('\n');
        }
        let signed_headers = signed_header_names.join(";");

        // No query strings are used by either client, so the canonical query is empty.
        let canonical_request = format!(
            "{method}\n{uri_path}\n\n{canonical_headers}\n{signed_headers}\n{payload_hash}"
        );

        let credential_scope = format!("{}/{}/{}/aws4_request", date, self.region, self.service);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            datetime,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.credentials.secret_access_key,
            date,
            &self.region,
            self.service,
        );
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.credentials.access_key_id, credential_scope, signed_headers, signature
        );

        let mut headers = vec![
            ("x-amz-date".to_string(), datetime.to_string()),
            ("x-amz-content-sha256".to_string(), payload_hash),
            ("authorization".to_string(), authorization),
        ];
        if let Some(ref token) = self.credentials.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers
    }
}

/// Format a timestamp the way SigV4 expects it.
pub fn amz_datetime(now: DateTime<Utc>) -> String {
    now.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Percent-encode a single URI path segment (RFC 3986 unreserved set kept).
pub fn percent_encode_path_segment(s: &str) -> String {
    let mut result = String::with_capacity(s.len() * 2);
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char)
            }
            _ => {
                result.push('%');
                result.push_str(&format!("{:02X}", byte));
            }
        }
    }
    result
}

/// Host component of an endpoint URL, including a non-default port.
pub fn host_of(url: &url::Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    }
}

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// kSigning = HMAC(HMAC(HMAC(HMAC("AWS4" + secret, date), region), service), "aws4_request")
fn derive_signing_key(secret_access_key: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_secret = format!("AWS4{}", secret_access_key);
    let k_date = hmac_sha256(k_secret.as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}
