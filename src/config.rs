//! Configuration management

use anyhow::Result;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::integrations::mail::MailConfig;
use crate::integrations::payments::PaymentLinks;
use crate::messengers::whatsapp::WhatsAppConfig;

/// Server configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Webhook server bind address
    pub bind_addr: SocketAddr,

    /// SQLite database path
    pub db_path: PathBuf,

    /// Root directory for blob storage (memos, rendered letters)
    pub blob_root: PathBuf,

    /// Optional override for the user-facing message catalog
    pub messages_path: Option<PathBuf>,

    /// Telegram bot token
    pub telegram_token: String,

    /// WhatsApp Graph API settings
    pub whatsapp: WhatsAppConfig,

    /// Model provider (transcription + letter composition)
    pub model_api_url: String,
    pub model_api_key: String,
    pub transcription_model: String,
    pub completion_model: String,

    /// Print-and-mail provider
    pub mail: MailConfig,

    /// Preconfigured checkout links per credit bundle
    pub payment_links: PaymentLinks,
}

fn required(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| anyhow::anyhow!("{name} not set"))
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let bind_addr = std::env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
            .parse()?;

        let db_path = std::env::var("DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/voicepost.db"));

        let blob_root = std::env::var("BLOB_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/blobs"));

        let messages_path = std::env::var("MESSAGES_PATH").map(PathBuf::from).ok();

        let whatsapp = WhatsAppConfig {
            token: required("WHATSAPP_TOKEN")?,
            api_version: std::env::var("WHATSAPP_API_VERSION")
                .unwrap_or_else(|_| "v18.0".to_string()),
            phone_number_id: required("WHATSAPP_PHONE_NUMBER_ID")?,
            verify_token: required("WHATSAPP_VERIFY_TOKEN")?,
        };

        let mail = MailConfig {
            api_url: required("MAIL_API_URL")?,
            token_url: required("MAIL_TOKEN_URL")?,
            client_id: required("MAIL_CLIENT_ID")?,
            client_secret: required("MAIL_CLIENT_SECRET")?,
            organisation_id: required("MAIL_ORGANISATION_ID")?,
        };

        let payment_links = PaymentLinks {
            single: required("PAYMENT_LINK_1_CREDIT")?,
            five: required("PAYMENT_LINK_5_CREDITS")?,
            ten: required("PAYMENT_LINK_10_CREDITS")?,
        };

        Ok(Self {
            bind_addr,
            db_path,
            blob_root,
            messages_path,
            telegram_token: required("TELEGRAM_BOT_TOKEN")?,
            whatsapp,
            model_api_url: std::env::var("MODEL_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            model_api_key: required("MODEL_API_KEY")?,
            transcription_model: std::env::var("TRANSCRIPTION_MODEL")
                .unwrap_or_else(|_| "whisper-1".to_string()),
            completion_model: std::env::var("COMPLETION_MODEL")
                .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            mail,
            payment_links,
        })
    }
}
