//! Firebase Cloud Messaging delivery for coalesced notifications.
//!
//! Each flush becomes one silent data-only message: the content ids are
//! packed into a [`DataUpdateNotification`], base64-encoded, and carried in
//! a single `payload` field. Push is best-effort; errors are classified and
//! returned, never retried here.

use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use prost::Message;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::proto::DataUpdateNotification;

const FCM_API_BASE: &str = "https://fcm.googleapis.com/";
const FCM_SCOPE: &str = "https://www.googleapis.com/auth/firebase.messaging";

/// Delivery failure, classified per the FCM error taxonomy. The display
/// string is what status queries expose to the sender.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("FCM token is no longer registered")]
    Unregistered,
    #[error("FCM rejected the message: {0}")]
    InvalidArgument(String),
    #[error("FCM send failed: {0}")]
    Provider(String),
}

/// Delivery seam used by the batching engine. Mocked in tests.
#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, fcm_token: &str, data_ids: &[Vec<u8>]) -> Result<(), SendError>;
}

/// Firebase service account credentials, as exported by the console.
#[derive(Debug, Clone, Deserialize)]
struct ServiceAccount {
    #[serde(default)]
    project_id: String,
    client_email: String,
    private_key: String,
    token_uri: String,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Sends notifications through the FCM HTTP v1 API.
pub struct FcmSender {
    http: Client,
    base_url: Url,
    project_id: String,
    account: ServiceAccount,
    token: Mutex<Option<CachedToken>>,
}

impl fmt::Debug for FcmSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FcmSender")
            .field("base_url", &self.base_url)
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

impl FcmSender {
    /// Build a sender from a service account file. `project_id` overrides
    /// the one embedded in the credentials when non-empty.
    pub fn new(credentials_file: &Path, project_id: &str) -> Result<Self> {
        let base_url = Url::parse(FCM_API_BASE).expect("valid default FCM URL");
        Self::with_base_url(credentials_file, project_id, base_url)
    }

    pub fn with_base_url(credentials_file: &Path, project_id: &str, base_url: Url) -> Result<Self> {
        let raw = std::fs::read_to_string(credentials_file)
            .with_context(|| format!("reading credentials file {}", credentials_file.display()))?;
        let account: ServiceAccount =
            serde_json::from_str(&raw).context("parsing service account credentials")?;
        let project_id = if project_id.is_empty() {
            account.project_id.clone()
        } else {
            project_id.to_string()
        };
        if project_id.is_empty() {
            anyhow::bail!("no project id in config or credentials file");
        }
        let http = Client::builder()
            .user_agent("pushserver/0.1")
            .build()
            .expect("reqwest client");
        Ok(Self {
            http,
            base_url,
            project_id,
            account,
            token: Mutex::new(None),
        })
    }

    /// OAuth2 JWT-bearer exchange, cached until shortly before expiry.
    async fn access_token(&self) -> Result<String, SendError> {
        let mut cached = self.token.lock().await;
        if let Some(tok) = cached.as_ref() {
            if tok.expires_at > Instant::now() + Duration::from_secs(60) {
                return Ok(tok.token.clone());
            }
        }

        #[derive(serde::Serialize)]
        struct Claims<'a> {
            iss: &'a str,
            scope: &'a str,
            aud: &'a str,
            iat: i64,
            exp: i64,
        }

        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: &self.account.client_email,
            scope: FCM_SCOPE,
            aud: &self.account.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let key = jsonwebtoken::EncodingKey::from_rsa_pem(self.account.private_key.as_bytes())
            .map_err(|e| SendError::Provider(format!("invalid service account key: {e}")))?;
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &key,
        )
        .map_err(|e| SendError::Provider(format!("signing token request: {e}")))?;

        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            expires_in: u64,
        }

        let resp = self
            .http
            .post(&self.account.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SendError::Provider(format!("token endpoint unreachable: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SendError::Provider(format!(
                "token endpoint returned {status}: {body}"
            )));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| SendError::Provider(format!("invalid token response: {e}")))?;

        let access = token.access_token.clone();
        *cached = Some(CachedToken {
            token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(access)
    }
}

#[async_trait]
impl PushSender for FcmSender {
    async fn send(&self, fcm_token: &str, data_ids: &[Vec<u8>]) -> Result<(), SendError> {
        let payload = encode_payload(data_ids);
        let body = json!({
            "message": {
                "token": fcm_token,
                "data": { "payload": payload },
                "android": { "priority": "high" },
            }
        });

        let endpoint = self
            .base_url
            .join(&format!("v1/projects/{}/messages:send", self.project_id))
            .map_err(|e| SendError::Provider(format!("invalid FCM URL: {e}")))?;
        let access_token = self.access_token().await?;

        let resp = self
            .http
            .post(endpoint)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::Provider(format!("FCM unreachable: {e}")))?;

        if resp.status().is_success() {
            #[derive(Deserialize)]
            struct SendResponse {
                #[serde(default)]
                name: String,
            }
            let sent: SendResponse = resp.json().await.unwrap_or(SendResponse {
                name: String::new(),
            });
            info!(
                message = %sent.name,
                token = %truncate_token(fcm_token),
                data_ids = data_ids.len(),
                "sent FCM message"
            );
            return Ok(());
        }

        let http_status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let err = classify_error(&body);
        match &err {
            SendError::Unregistered => {
                warn!(token = %truncate_token(fcm_token), "FCM token is no longer valid");
            }
            SendError::InvalidArgument(detail) => {
                warn!(token = %truncate_token(fcm_token), %detail, "FCM token has invalid registration");
            }
            SendError::Provider(detail) => {
                error!(token = %truncate_token(fcm_token), status = %http_status, %detail, "FCM send failed");
            }
        }
        Err(err)
    }
}

/// Pack content ids into the wire envelope carried in the `payload` field.
pub fn encode_payload(data_ids: &[Vec<u8>]) -> String {
    let notification = DataUpdateNotification {
        data_ids: data_ids.to_vec(),
    };
    BASE64.encode(notification.encode_to_vec())
}

/// Map an FCM v1 error body to a [`SendError`].
fn classify_error(body: &str) -> SendError {
    #[derive(Deserialize, Default)]
    struct ErrorBody {
        #[serde(default)]
        error: ErrorDetail,
    }
    #[derive(Deserialize, Default)]
    struct ErrorDetail {
        #[serde(default)]
        status: String,
        #[serde(default)]
        message: String,
    }

    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    match parsed.error.status.as_str() {
        "UNREGISTERED" | "NOT_FOUND" => SendError::Unregistered,
        "INVALID_ARGUMENT" => SendError::InvalidArgument(parsed.error.message),
        _ if !parsed.error.message.is_empty() => SendError::Provider(parsed.error.message),
        _ => SendError::Provider(body.trim().to_string()),
    }
}

/// FCM tokens are sensitive; log only the edges.
fn truncate_token(token: &str) -> String {
    if token.len() <= 12 {
        return token.to_string();
    }
    format!("{}...{}", &token[..6], &token[token.len() - 6..])
}
