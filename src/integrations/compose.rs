//! Letter composition: transcript -> letter text, and applying edit
//! instructions to an existing letter.

use async_trait::async_trait;
use serde_json::json;

use crate::error::{Error, Result};

const COMPLETION_TIMEOUT_SECS: u64 = 30;

const SYSTEM_PROMPT: &str =
    "You ghost-write warm, personal letters from voice-memo transcripts. \
     Keep the sender's voice; fix transcription artifacts; never invent facts.";

const EDIT_SYSTEM_PROMPT: &str =
    "You revise letters. Apply the requested edits faithfully and change \
     nothing else.";

/// Turns transcripts into letters and letters into revised letters.
#[async_trait]
pub trait Composer: Send + Sync {
    /// Compose letter text from a transcript, honoring the user's standing
    /// style instruction when present.
    async fn compose(&self, transcript: &str, user_prompt: Option<&str>) -> Result<String>;

    /// Apply edit instructions to an existing letter.
    async fn revise(&self, old_text: &str, instructions: &str) -> Result<String>;
}

/// Chat-completions implementation.
pub struct ChatComposer {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl ChatComposer {
    pub fn new(api_url: String, api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
            api_key,
            model,
        }
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_url))
            .bearer_auth(&self.api_key)
            .timeout(std::time::Duration::from_secs(COMPLETION_TIMEOUT_SECS))
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": system},
                    {"role": "user", "content": prompt},
                ],
            }))
            .send()
            .await?
            .error_for_status()?;

        let body: serde_json::Value = response.json().await?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| Error::UnsupportedContent("completion without text content".into()))
    }
}

#[async_trait]
impl Composer for ChatComposer {
    async fn compose(&self, transcript: &str, user_prompt: Option<&str>) -> Result<String> {
        let style = user_prompt
            .map(|p| format!("Additional instructions from the sender: {p}\n\n"))
            .unwrap_or_default();
        let prompt = format!(
            "Turn the transcript below into a letter. Correct mistakes that may \
             have arisen from a faulty transcription of the audio.\n\n{style}\
             Transcript of the message:\n{transcript}\n\nYour letter:\n"
        );
        let letter = self.complete(SYSTEM_PROMPT, &prompt).await?;
        ensure_printable(&letter)?;
        Ok(letter)
    }

    async fn revise(&self, old_text: &str, instructions: &str) -> Result<String> {
        let prompt = format!(
            "Current letter:\n{old_text}\n\nRequested edits:\n{instructions}\n\n\
             The revised letter:\n"
        );
        let letter = self.complete(EDIT_SYSTEM_PROMPT, &prompt).await?;
        ensure_printable(&letter)?;
        Ok(letter)
    }
}

// Approximate coverage of the letter font: ASCII, Latin-1 and extensions,
// Greek, Cyrillic.
const SUPPORTED_RANGES: &[(char, char)] = &[
    ('\u{0020}', '\u{007E}'),
    ('\u{00A0}', '\u{00FF}'),
    ('\u{0100}', '\u{017F}'),
    ('\u{0180}', '\u{024F}'),
    ('\u{0370}', '\u{03FF}'),
    ('\u{0400}', '\u{04FF}'),
];

/// Reject text the letter font cannot print. The caller turns this into a
/// user-visible reply rather than propagating it.
pub fn ensure_printable(text: &str) -> Result<()> {
    let unsupported: Vec<char> = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .filter(|c| !SUPPORTED_RANGES.iter().any(|&(lo, hi)| (lo..=hi).contains(c)))
        .collect();
    if unsupported.is_empty() {
        Ok(())
    } else {
        Err(Error::UnsupportedContent(format!(
            "characters not supported by the letter font: {unsupported:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_printable_accepts_latin_greek_cyrillic() {
        ensure_printable("Dear Doris, schöne Grüße!").unwrap();
        ensure_printable("αβγ и так далее").unwrap();
    }

    #[test]
    fn test_printable_rejects_cjk_and_emoji() {
        assert!(matches!(
            ensure_printable("hello 世界").unwrap_err(),
            Error::UnsupportedContent(_)
        ));
        assert!(ensure_printable("hi 🙂").is_err());
    }

    #[test]
    fn test_whitespace_is_always_fine() {
        ensure_printable("line one\n\nline two\t end").unwrap();
    }
}
