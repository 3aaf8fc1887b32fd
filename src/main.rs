//! voicepost - Entry Point
//!
//! Runs the webhook server for both messaging platforms plus the payment
//! provider. All configuration comes from the environment (see
//! [`voicepost::Config`]).

use std::sync::Arc;
use std::time::Instant;

use tracing_subscriber::EnvFilter;

use voicepost::integrations::compose::ChatComposer;
use voicepost::integrations::mail::MailApi;
use voicepost::integrations::transcribe::WhisperTranscriber;
use voicepost::server::AppState;
use voicepost::{Config, LetterPipeline, Service, Store, SystemMessages, Telegram, WhatsApp};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "voicepost=info,info".into()),
        )
        .init();

    let config = Config::from_env()?;

    let sys = match &config.messages_path {
        Some(path) => SystemMessages::from_file(path)?,
        None => SystemMessages::embedded(),
    };
    let store = Store::open(&config.db_path, &config.blob_root, sys)?;

    let whatsapp = WhatsApp::new(config.whatsapp.clone());
    let telegram = Telegram::new(config.telegram_token.clone());

    let pipeline = LetterPipeline::new(
        Box::new(WhisperTranscriber::new(
            config.model_api_url.clone(),
            config.model_api_key.clone(),
            config.transcription_model.clone(),
        )),
        Box::new(ChatComposer::new(
            config.model_api_url.clone(),
            config.model_api_key.clone(),
            config.completion_model.clone(),
        )),
        Box::new(MailApi::new(config.mail.clone())),
    );
    let service = Service::new(pipeline, config.payment_links.clone());

    let state = Arc::new(AppState {
        store,
        service,
        whatsapp,
        telegram,
        start_time: Instant::now(),
    });

    voicepost::server::run(state, config.bind_addr).await
}
