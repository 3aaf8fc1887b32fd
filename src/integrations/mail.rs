//! Print-and-mail provider client.
//!
//! One logical operation: hand over a finished letter PDF and get back the
//! provider's receipt id. Authentication is client-credentials OAuth with the
//! token cached until shortly before expiry.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

const REQUEST_TIMEOUT_SECS: u64 = 30;
const TOKEN_SLACK_SECS: u64 = 60;

/// Hands finished letters to the postal provider.
#[async_trait]
pub trait MailDispatcher: Send + Sync {
    /// Upload and send one letter; returns the provider receipt id.
    async fn send_letter(&self, pdf: Vec<u8>, filename: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub organisation_id: String,
}

struct CachedToken {
    token: String,
    expires_at: std::time::Instant,
}

/// HTTP implementation of [`MailDispatcher`].
pub struct MailApi {
    config: MailConfig,
    client: reqwest::Client,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl MailApi {
    pub fn new(config: MailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(t) = cached.as_ref() {
            if t.expires_at > std::time::Instant::now() {
                return Ok(t.token.clone());
            }
        }

        let response = self
            .client
            .post(&self.config.token_url)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Mail(format!("token request failed: {e}")))?;

        let token: TokenResponse = response.json().await?;
        let ttl = token.expires_in.unwrap_or(3600).saturating_sub(TOKEN_SLACK_SECS);
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            expires_at: std::time::Instant::now() + std::time::Duration::from_secs(ttl),
        });
        Ok(token.access_token)
    }
}

#[async_trait]
impl MailDispatcher for MailApi {
    async fn send_letter(&self, pdf: Vec<u8>, filename: &str) -> Result<String> {
        let token = self.access_token().await?;

        let part = reqwest::multipart::Part::bytes(pdf)
            .file_name(filename.to_string())
            .mime_str("application/pdf")
            .map_err(Error::Http)?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("address_position", "left")
            .text("auto_send", "true");

        let response = self
            .client
            .post(format!(
                "{}/organisations/{}/letters",
                self.config.api_url, self.config.organisation_id
            ))
            .bearer_auth(&token)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .multipart(form)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::Mail(format!("letter upload failed: {e}")))?;

        let body: serde_json::Value = response.json().await?;
        body["data"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Mail("letter upload response without id".into()))
    }
}
