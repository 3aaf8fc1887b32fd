//! Voice-memo transcription.

use async_trait::async_trait;
use reqwest::multipart;

use crate::error::{Error, Result};

/// Speech-to-text over an audio byte buffer.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe a memo. `duration_secs` sizes the request timeout: a slow
    /// upstream fails the request instead of blocking the handler.
    async fn transcribe(&self, audio: Vec<u8>, duration_secs: f64) -> Result<String>;
}

/// Whisper-API implementation.
pub struct WhisperTranscriber {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl WhisperTranscriber {
    pub fn new(api_url: String, api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
            api_key,
            model,
        }
    }

    fn timeout_for(duration_secs: f64) -> std::time::Duration {
        // Scales with memo length; floor covers connection setup on tiny memos.
        std::time::Duration::from_secs_f64((duration_secs * 0.75).clamp(10.0, 120.0))
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: Vec<u8>, duration_secs: f64) -> Result<String> {
        let part = multipart::Part::bytes(audio)
            .file_name("memo.ogg")
            .mime_str("audio/ogg")
            .map_err(Error::Http)?;
        let form = multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.api_url))
            .bearer_auth(&self.api_key)
            .timeout(Self::timeout_for(duration_secs))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;

        let body: serde_json::Value = response.json().await?;
        body["text"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| Error::UnsupportedContent("transcription without text".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_scales_with_duration() {
        assert_eq!(WhisperTranscriber::timeout_for(4.0).as_secs(), 10);
        assert_eq!(WhisperTranscriber::timeout_for(60.0).as_secs(), 45);
        assert_eq!(WhisperTranscriber::timeout_for(1000.0).as_secs(), 120);
    }
}
