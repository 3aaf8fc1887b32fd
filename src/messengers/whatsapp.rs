//! WhatsApp adapter over the Graph API.
//!
//! # Configuration
//!
//! Environment variables (see [`crate::config::Config`]):
//! - `WHATSAPP_TOKEN`: Graph API bearer token
//! - `WHATSAPP_PHONE_NUMBER_ID`: sending phone number id
//! - `WHATSAPP_VERIFY_TOKEN`: webhook verification secret
//!
//! # Webhook setup
//!
//! Point the app's webhook at `https://your-domain.com/api/whatsapp`; the GET
//! verification handshake is handled by [`WhatsApp::verify`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::blob::BlobKind;
use crate::commands::parse_command;
use crate::db::UnitOfWork;
use crate::error::{Error, Result};
use crate::messengers::Messenger;
use crate::models::{now_ts, File, Message, MessageKind, PlatformMeta, User};

const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub token: String,
    pub api_version: String,
    pub phone_number_id: String,
    pub verify_token: String,
}

/// Inbound webhook envelope (the subset this bot consumes).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub changes: Vec<WebhookChange>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookChange {
    pub value: ChangeValue,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChangeValue {
    pub metadata: ChangeMetadata,
    #[serde(default)]
    pub contacts: Vec<WaContact>,
    #[serde(default)]
    pub messages: Vec<WaMessage>,
    #[serde(default)]
    pub statuses: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChangeMetadata {
    pub phone_number_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WaContact {
    pub wa_id: String,
    pub profile: WaProfile,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WaProfile {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WaMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<WaText>,
    #[serde(default)]
    pub audio: Option<WaMedia>,
    #[serde(default)]
    pub document: Option<WaMedia>,
    #[serde(default)]
    pub image: Option<WaMedia>,
    #[serde(default)]
    pub interactive: Option<WaInteractive>,
    #[serde(default)]
    pub context: Option<WaContext>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WaText {
    pub body: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WaMedia {
    pub id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WaInteractive {
    #[serde(default)]
    pub button_reply: Option<WaButtonReply>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WaButtonReply {
    pub id: String,
    pub title: String,
}

/// Reply context: the wamid of the message the user interacted with.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WaContext {
    pub id: String,
}

impl WebhookPayload {
    /// Delivery-status notifications carry no message and are acknowledged
    /// without processing.
    pub fn is_status_update(&self) -> bool {
        self.entry
            .first()
            .and_then(|e| e.changes.first())
            .map(|c| !c.value.statuses.is_empty())
            .unwrap_or(false)
    }
}

pub struct WhatsApp {
    config: WhatsAppConfig,
    client: reqwest::Client,
}

impl WhatsApp {
    pub fn new(config: WhatsAppConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Webhook verification handshake: echo `hub.challenge` when the verify
    /// token matches.
    pub fn verify(&self, mode: Option<&str>, token: Option<&str>, challenge: Option<&str>) -> Option<String> {
        if mode == Some("subscribe") && token == Some(self.config.verify_token.as_str()) {
            challenge.map(str::to_string)
        } else {
            None
        }
    }

    fn messages_endpoint(&self) -> String {
        format!(
            "https://graph.facebook.com/{}/{}/messages",
            self.config.api_version, self.config.phone_number_id
        )
    }

    async fn post_json(&self, payload: serde_json::Value) -> Result<String> {
        let response = self
            .client
            .post(self.messages_endpoint())
            .bearer_auth(&self.config.token)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        let body: serde_json::Value = response.json().await?;
        body["messages"][0]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Classification("send response without message id".into()))
    }

    async fn download_media(&self, media_id: &str) -> Result<Vec<u8>> {
        let endpoint = format!(
            "https://graph.facebook.com/{}/{}",
            self.config.api_version, media_id
        );
        let lookup: serde_json::Value = self
            .client
            .get(&endpoint)
            .bearer_auth(&self.config.token)
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let url = lookup["url"]
            .as_str()
            .ok_or_else(|| Error::Classification("media lookup without url".into()))?;

        let bytes = self
            .client
            .get(url)
            .bearer_auth(&self.config.token)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }

    async fn upload_media(&self, bytes: Vec<u8>, filename: &str, mime_type: &str) -> Result<String> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime_type)
            .map_err(Error::Http)?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("type", mime_type.to_string())
            .text("messaging_product", "whatsapp");

        let endpoint = format!(
            "https://graph.facebook.com/{}/{}/media",
            self.config.api_version, self.config.phone_number_id
        );
        let response: serde_json::Value = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.config.token)
            .timeout(std::time::Duration::from_secs(30))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Classification("media upload without id".into()))
    }

    fn get_or_create_user(
        &self,
        uow: &UnitOfWork,
        phone_number: &str,
        profile_name: Option<&str>,
    ) -> Result<User> {
        if let Some(user) = uow.users().find_one(&[(
            "phone_number",
            rusqlite::types::Value::from(phone_number.to_string()),
        )])? {
            return Ok(user);
        }
        let mut user = User::new(now_ts());
        user.phone_number = Some(phone_number.to_string());
        user.first_name = profile_name
            .and_then(|n| n.split_whitespace().next())
            .map(str::to_string);
        uow.users().add(&user)?;
        info!("created user {} from whatsapp contact", user.user_id);
        Ok(user)
    }

    /// Normalize one inbound webhook delivery into a persisted [`Message`].
    pub async fn process_message(
        &self,
        payload: &WebhookPayload,
        uow: &UnitOfWork,
    ) -> Result<Message> {
        let value = payload
            .entry
            .first()
            .and_then(|e| e.changes.first())
            .map(|c| &c.value)
            .ok_or_else(|| Error::Classification("webhook without changes".into()))?;
        if value.messages.len() != 1 {
            return Err(Error::Classification(format!(
                "expected exactly one message, got {}",
                value.messages.len()
            )));
        }
        let wa_message = &value.messages[0];
        let contact = value
            .contacts
            .first()
            .ok_or_else(|| Error::Classification("webhook without contact".into()))?;

        let kind = MessageKind::parse(&wa_message.kind).ok_or_else(|| {
            Error::Classification(format!("unsupported message type '{}'", wa_message.kind))
        })?;

        let user = self.get_or_create_user(uow, &contact.wa_id, Some(&contact.profile.name))?;

        let mut message = Message::inbound(
            &user.user_id,
            kind,
            PlatformMeta::WhatsApp {
                phone_number: contact.wa_id.clone(),
                phone_number_id: value.metadata.phone_number_id.clone(),
                profile_name: Some(contact.profile.name.clone()),
            },
        );
        message.platform_msg_id = Some(wa_message.id.clone());
        // Insert before any file rows so their message reference resolves.
        uow.messages().add(&message)?;

        match kind {
            MessageKind::Text => {
                let body = wa_message
                    .text
                    .as_ref()
                    .map(|t| t.body.as_str())
                    .unwrap_or_default();
                let (command, rest) = parse_command(body);
                message.command = Some(command);
                message.body = Some(rest);
            }
            MessageKind::Audio | MessageKind::Document | MessageKind::Image => {
                self.process_media(wa_message, &mut message, uow).await?;
            }
            MessageKind::Interactive => {
                self.process_interactive(wa_message, &mut message, uow)?;
            }
        }

        uow.messages().update(&message)?;
        Ok(message)
    }

    async fn process_media(
        &self,
        wa_message: &WaMessage,
        message: &mut Message,
        uow: &UnitOfWork,
    ) -> Result<()> {
        let media = match message.kind {
            MessageKind::Audio => wa_message.audio.as_ref(),
            MessageKind::Document => wa_message.document.as_ref(),
            _ => wa_message.image.as_ref(),
        }
        .ok_or_else(|| Error::Classification("media message without media object".into()))?;

        let mime_type = media
            .mime_type
            .as_deref()
            .unwrap_or("audio/ogg")
            .split(';')
            .next()
            .unwrap_or("audio/ogg")
            .to_string();
        let bytes = self.download_media(&media.id).await?;

        if message.kind == MessageKind::Audio {
            message.command = Some("voice".to_string());
            message.memo_duration = Some(ogg_duration_seconds(&bytes));
        }
        message.attachment_mime = Some(mime_type.clone());

        // Store what the blob layer knows how to keep; anything else is
        // logged as an attachment without bytes.
        match uow
            .blobs
            .upload(&bytes, BlobKind::Memo, &message.user_id, &mime_type)
        {
            Ok(path) => {
                uow.files().add(&File {
                    file_id: crate::models::new_id(),
                    message_id: message.message_id.clone(),
                    mime_type,
                    blob_path: path,
                })?;
            }
            Err(Error::UnsupportedContent(_)) if message.kind != MessageKind::Audio => {
                debug!("skipping blob for attachment of type {mime_type}");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn process_interactive(
        &self,
        wa_message: &WaMessage,
        message: &mut Message,
        uow: &UnitOfWork,
    ) -> Result<()> {
        let reply = wa_message
            .interactive
            .as_ref()
            .and_then(|i| i.button_reply.as_ref())
            .ok_or_else(|| Error::Classification("interactive message without button reply".into()))?;
        message.action_confirmed = match reply.id.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            other => {
                return Err(Error::Classification(format!(
                    "button id is not a boolean: '{other}'"
                )))
            }
        };

        let context_id = wa_message
            .context
            .as_ref()
            .map(|c| c.id.clone())
            .ok_or_else(|| Error::BrokenChain("button tap without reply context".into()))?;
        let proposal = uow
            .messages()
            .find_one(&[(
                "platform_msg_id",
                rusqlite::types::Value::from(context_id.clone()),
            )])?
            .ok_or_else(|| {
                Error::BrokenChain(format!("referenced message '{context_id}' not found"))
            })?;
        let command = proposal
            .command
            .as_deref()
            .ok_or_else(|| {
                Error::BrokenChain(format!(
                    "referenced message {} has no command",
                    proposal.message_id
                ))
            })?;
        message.command = Some(format!("{command}_callback"));
        message.response_to = Some(proposal.message_id.clone());
        Ok(())
    }

    fn target_phone(ref_message: &Message) -> Result<&str> {
        match &ref_message.meta {
            PlatformMeta::WhatsApp { phone_number, .. } => Ok(phone_number),
            _ => Err(Error::Classification(
                "whatsapp reply to a non-whatsapp message".into(),
            )),
        }
    }
}

#[async_trait]
impl Messenger for WhatsApp {
    async fn reply_text(
        &self,
        ref_message: &Message,
        body: &str,
        uow: &UnitOfWork,
    ) -> Result<Message> {
        let to = Self::target_phone(ref_message)?;
        let wamid = self
            .post_json(json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "text",
                "text": {"preview_url": false, "body": body},
            }))
            .await?;

        let mut response = Message::reply_to(ref_message, MessageKind::Text);
        response.body = Some(body.to_string());
        response.platform_msg_id = Some(wamid);
        uow.messages().add(&response)?;
        Ok(response)
    }

    async fn reply_document(
        &self,
        ref_message: &Message,
        bytes: Vec<u8>,
        filename: &str,
        mime_type: &str,
        uow: &UnitOfWork,
    ) -> Result<Message> {
        let to = Self::target_phone(ref_message)?;
        let media_id = self.upload_media(bytes, filename, mime_type).await?;
        let wamid = self
            .post_json(json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "document",
                "document": {"filename": filename, "id": media_id},
            }))
            .await?;

        let mut response = Message::reply_to(ref_message, MessageKind::Document);
        response.attachment_mime = Some(mime_type.to_string());
        response.platform_msg_id = Some(wamid);
        uow.messages().add(&response)?;
        Ok(response)
    }

    async fn reply_buttons(
        &self,
        ref_message: &Message,
        main_text: &str,
        cancel_label: &str,
        confirm_label: &str,
        uow: &UnitOfWork,
    ) -> Result<Message> {
        let to = Self::target_phone(ref_message)?;
        let wamid = self
            .post_json(json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "interactive",
                "interactive": {
                    "type": "button",
                    "body": {"text": main_text},
                    "action": {"buttons": [
                        {"type": "reply", "reply": {"id": "false", "title": cancel_label}},
                        {"type": "reply", "reply": {"id": "true", "title": confirm_label}},
                    ]},
                },
            }))
            .await?;
        debug!("sent confirm/cancel prompt {wamid}");

        // The platform echoes this outbound wamid back as the tap's reply
        // context, which is how the callback finds its proposal.
        let mut response = Message::reply_to(ref_message, MessageKind::Interactive);
        response.body = Some(main_text.to_string());
        response.platform_msg_id = Some(wamid);
        uow.messages().add(&response)?;
        Ok(response)
    }

    async fn reply_edit_or_text(
        &self,
        ref_message: &Message,
        body: &str,
        uow: &UnitOfWork,
    ) -> Result<Message> {
        // WhatsApp cannot edit sent messages.
        self.reply_text(ref_message, body, uow).await
    }
}

/// Duration of an Ogg stream from the granule position of its last page
/// (Opus streams run at 48 kHz).
pub fn ogg_duration_seconds(bytes: &[u8]) -> f64 {
    const MAGIC: &[u8] = b"OggS";
    let mut last_granule: u64 = 0;
    let mut pos = 0;
    while pos + 14 <= bytes.len() {
        match bytes[pos..].windows(4).position(|w| w == MAGIC) {
            Some(offset) => {
                let page = pos + offset;
                if page + 14 <= bytes.len() {
                    let mut granule = [0u8; 8];
                    granule.copy_from_slice(&bytes[page + 6..page + 14]);
                    let value = u64::from_le_bytes(granule);
                    if value != u64::MAX {
                        last_granule = last_granule.max(value);
                    }
                }
                pos = page + 4;
            }
            None => break,
        }
    }
    last_granule as f64 / 48_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ogg_page(granule: u64) -> Vec<u8> {
        let mut page = Vec::new();
        page.extend_from_slice(b"OggS");
        page.extend_from_slice(&[0, 0]); // version, header type
        page.extend_from_slice(&granule.to_le_bytes());
        page.extend_from_slice(&[0; 12]); // serial, sequence, checksum
        page
    }

    #[test]
    fn test_ogg_duration_from_last_page() {
        let mut bytes = ogg_page(48_000);
        bytes.extend(ogg_page(96_000));
        bytes.extend(ogg_page(240_000));
        assert_eq!(ogg_duration_seconds(&bytes), 5.0);
    }

    #[test]
    fn test_ogg_duration_of_garbage_is_zero() {
        assert_eq!(ogg_duration_seconds(b"not an ogg stream"), 0.0);
        assert_eq!(ogg_duration_seconds(&[]), 0.0);
    }

    #[test]
    fn test_status_update_detection() {
        let payload: WebhookPayload = serde_json::from_value(serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{"id": "1", "changes": [{"value": {
                "metadata": {"phone_number_id": "1066"},
                "statuses": [{"status": "delivered"}],
            }}]}],
        }))
        .unwrap();
        assert!(payload.is_status_update());
    }

    #[test]
    fn test_message_payload_parses() {
        let payload: WebhookPayload = serde_json::from_value(serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{"id": "1", "changes": [{"value": {
                "metadata": {"phone_number_id": "1066"},
                "contacts": [{"wa_id": "491701234567", "profile": {"name": "John Doe"}}],
                "messages": [{
                    "id": "wamid.abc",
                    "type": "text",
                    "text": {"body": "/help"},
                }],
            }}]}],
        }))
        .unwrap();
        assert!(!payload.is_status_update());
        let msg = &payload.entry[0].changes[0].value.messages[0];
        assert_eq!(msg.kind, "text");
        assert_eq!(msg.text.as_ref().unwrap().body, "/help");
    }

    #[test]
    fn test_verify_handshake() {
        let adapter = WhatsApp::new(WhatsAppConfig {
            token: "t".into(),
            api_version: "v18.0".into(),
            phone_number_id: "1066".into(),
            verify_token: "secret".into(),
        });
        assert_eq!(
            adapter.verify(Some("subscribe"), Some("secret"), Some("42")),
            Some("42".to_string())
        );
        assert_eq!(adapter.verify(Some("subscribe"), Some("wrong"), Some("42")), None);
        assert_eq!(adapter.verify(None, Some("secret"), Some("42")), None);
    }
}
