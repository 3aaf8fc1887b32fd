//! Telegram adapter on top of teloxide.
//!
//! Inbound webhook bodies decode as `teloxide::types::Update`; outbound
//! traffic goes through a shared `Bot`. Button callbacks carry a JSON payload
//! `{"mid": <outbound message id>, "conf": <bool>}` so the proposal resolves
//! by primary key when the tap comes back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId, Update, UpdateKind,
};
use tracing::{debug, info, warn};

use crate::blob::BlobKind;
use crate::commands::parse_command;
use crate::db::UnitOfWork;
use crate::error::{Error, Result};
use crate::messengers::Messenger;
use crate::models::{new_id, now_ts, File, Message, MessageKind, PlatformMeta, User};

/// Callback payload behind each confirm/cancel button.
#[derive(Debug, Serialize, Deserialize)]
struct ButtonPayload {
    /// Id of the outbound interactive message itself.
    mid: String,
    /// true for confirm, false for cancel.
    conf: bool,
}

pub struct Telegram {
    bot: Bot,
    token: String,
    http: reqwest::Client,
}

impl Telegram {
    pub fn new(token: String) -> Self {
        Self {
            bot: Bot::new(token.clone()),
            token,
            http: reqwest::Client::new(),
        }
    }

    /// Normalize one webhook update into a persisted [`Message`].
    pub async fn process_update(&self, update: Update, uow: &UnitOfWork) -> Result<Message> {
        match update.kind {
            UpdateKind::Message(msg) => self.process_chat_message(msg, uow).await,
            UpdateKind::CallbackQuery(query) => self.process_callback(query, uow).await,
            other => Err(Error::Classification(format!(
                "unsupported update kind: {other:?}"
            ))),
        }
    }

    async fn process_chat_message(
        &self,
        msg: teloxide::types::Message,
        uow: &UnitOfWork,
    ) -> Result<Message> {
        let from = msg
            .from
            .as_ref()
            .ok_or_else(|| Error::Classification("message without sender".into()))?;
        let user = self.get_or_create_user(uow, from)?;

        let kind = if msg.voice().is_some() {
            MessageKind::Audio
        } else if msg.document().is_some() {
            MessageKind::Document
        } else if msg.photo().is_some() {
            MessageKind::Image
        } else if msg.text().is_some() {
            MessageKind::Text
        } else {
            return Err(Error::Classification("unsupported telegram payload".into()));
        };

        let mut message = Message::inbound(
            &user.user_id,
            kind,
            PlatformMeta::Telegram {
                chat_id: msg.chat.id.0,
            },
        );
        message.platform_msg_id = Some(format!("{}-{}", msg.chat.id.0, msg.id.0));
        uow.messages().add(&message)?;

        match kind {
            MessageKind::Text => {
                let (command, rest) = parse_command(msg.text().unwrap_or_default());
                message.command = Some(command);
                message.body = Some(rest);
            }
            MessageKind::Audio => {
                self.process_voice(&msg, &mut message, uow).await?;
            }
            // Documents and images are logged as-is; no media pipeline for
            // them on this platform.
            MessageKind::Document => {
                message.attachment_mime = msg
                    .document()
                    .and_then(|d| d.mime_type.as_ref())
                    .map(|m| m.to_string());
            }
            MessageKind::Image => {}
            MessageKind::Interactive => unreachable!("classified above"),
        }

        uow.messages().update(&message)?;
        Ok(message)
    }

    async fn process_voice(
        &self,
        msg: &teloxide::types::Message,
        message: &mut Message,
        uow: &UnitOfWork,
    ) -> Result<()> {
        let voice = msg
            .voice()
            .ok_or_else(|| Error::Classification("voice message without voice".into()))?;
        message.command = Some("voice".to_string());
        message.memo_duration = Some(voice.duration.seconds() as f64);

        let bytes = self.download_file(&voice.file.id).await?;
        let mime_type = "audio/ogg";
        message.attachment_mime = Some(mime_type.to_string());
        let path = uow
            .blobs
            .upload(&bytes, BlobKind::Memo, &message.user_id, mime_type)?;
        uow.files().add(&File {
            file_id: new_id(),
            message_id: message.message_id.clone(),
            mime_type: mime_type.to_string(),
            blob_path: path,
        })?;
        Ok(())
    }

    async fn process_callback(&self, query: CallbackQuery, uow: &UnitOfWork) -> Result<Message> {
        // Stop the client-side spinner whatever happens next.
        if let Err(e) = self.bot.answer_callback_query(&query.id).await {
            warn!("failed to answer callback query: {e}");
        }

        let data = query
            .data
            .as_deref()
            .ok_or_else(|| Error::BrokenChain("callback without payload".into()))?;
        let payload: ButtonPayload = serde_json::from_str(data)
            .map_err(|_| Error::BrokenChain(format!("unparseable callback payload '{data}'")))?;

        let proposal = uow
            .messages()
            .maybe_get_one(&payload.mid)?
            .ok_or_else(|| Error::BrokenChain(format!("proposal '{}' not found", payload.mid)))?;
        let command = proposal.command.as_deref().ok_or_else(|| {
            Error::BrokenChain(format!(
                "proposal {} has no command",
                proposal.message_id
            ))
        })?;

        let user = self.get_or_create_user(uow, &query.from)?;
        let chat_id = query
            .message
            .as_ref()
            .map(|m| m.chat().id.0)
            .or(match &proposal.meta {
                PlatformMeta::Telegram { chat_id } => Some(*chat_id),
                _ => None,
            })
            .ok_or_else(|| Error::BrokenChain("callback without resolvable chat".into()))?;

        let mut message = Message::inbound(
            &user.user_id,
            MessageKind::Interactive,
            PlatformMeta::Telegram { chat_id },
        );
        // The platform id of the tapped (proposal) message, so an in-place
        // edit can find it later.
        message.platform_msg_id = query
            .message
            .as_ref()
            .map(|m| format!("{}-{}", m.chat().id.0, m.id().0));
        message.command = Some(format!("{command}_callback"));
        message.response_to = Some(proposal.message_id.clone());
        message.action_confirmed = Some(payload.conf);
        uow.messages().add(&message)?;
        Ok(message)
    }

    fn get_or_create_user(&self, uow: &UnitOfWork, from: &teloxide::types::User) -> Result<User> {
        let handle = from
            .username
            .clone()
            .unwrap_or_else(|| from.id.0.to_string());
        if let Some(user) = uow.users().find_one(&[(
            "telegram_id",
            rusqlite::types::Value::from(handle.clone()),
        )])? {
            return Ok(user);
        }
        let mut user = User::new(now_ts());
        user.telegram_id = Some(handle);
        user.first_name = Some(from.first_name.clone());
        user.last_name = from.last_name.clone();
        uow.users().add(&user)?;
        info!("created user {} from telegram contact", user.user_id);
        Ok(user)
    }

    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let file = self.bot.get_file(file_id).await?;
        let url = format!(
            "https://api.telegram.org/file/bot{}/{}",
            self.token, file.path
        );
        let bytes = self
            .http
            .get(&url)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }

    fn chat_of(ref_message: &Message) -> Result<ChatId> {
        match &ref_message.meta {
            PlatformMeta::Telegram { chat_id } => Ok(ChatId(*chat_id)),
            _ => Err(Error::Classification(
                "telegram reply to a non-telegram message".into(),
            )),
        }
    }
}

#[async_trait]
impl Messenger for Telegram {
    async fn reply_text(
        &self,
        ref_message: &Message,
        body: &str,
        uow: &UnitOfWork,
    ) -> Result<Message> {
        let chat_id = Self::chat_of(ref_message)?;
        let sent = self.bot.send_message(chat_id, body).await?;

        let mut response = Message::reply_to(ref_message, MessageKind::Text);
        response.body = Some(body.to_string());
        response.platform_msg_id = Some(format!("{}-{}", sent.chat.id.0, sent.id.0));
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
        let chat_id = Self::chat_of(ref_message)?;
        let document = InputFile::memory(bytes).file_name(filename.to_string());
        let sent = self.bot.send_document(chat_id, document).await?;

        let mut response = Message::reply_to(ref_message, MessageKind::Document);
        response.attachment_mime = Some(mime_type.to_string());
        response.platform_msg_id = Some(format!("{}-{}", sent.chat.id.0, sent.id.0));
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
        let chat_id = Self::chat_of(ref_message)?;

        // The message id is generated up front so the buttons can embed it;
        // the row below is stored under the same id.
        let proposal_id = new_id();
        let confirm = serde_json::to_string(&ButtonPayload {
            mid: proposal_id.clone(),
            conf: true,
        })?;
        let cancel = serde_json::to_string(&ButtonPayload {
            mid: proposal_id.clone(),
            conf: false,
        })?;
        let keyboard = InlineKeyboardMarkup::new(vec![vec![
            InlineKeyboardButton::callback(confirm_label, confirm),
            InlineKeyboardButton::callback(cancel_label, cancel),
        ]]);

        let sent = self
            .bot
            .send_message(chat_id, main_text)
            .reply_markup(keyboard)
            .await?;
        debug!("sent confirm/cancel prompt {proposal_id}");

        let mut response = Message::reply_to(ref_message, MessageKind::Interactive);
        response.message_id = proposal_id;
        response.body = Some(main_text.to_string());
        response.platform_msg_id = Some(format!("{}-{}", sent.chat.id.0, sent.id.0));
        uow.messages().add(&response)?;
        Ok(response)
    }

    async fn reply_edit_or_text(
        &self,
        ref_message: &Message,
        body: &str,
        uow: &UnitOfWork,
    ) -> Result<Message> {
        let chat_id = Self::chat_of(ref_message)?;

        // The callback message's platform id names the interactive message
        // the user tapped; edit that one in place when it parses.
        let target = ref_message
            .platform_msg_id
            .as_deref()
            .and_then(|id| id.split_once('-'))
            .and_then(|(_, msg)| msg.parse::<i32>().ok());
        let Some(target_id) = target else {
            return self.reply_text(ref_message, body, uow).await;
        };

        let edited = self
            .bot
            .edit_message_text(chat_id, MessageId(target_id), body)
            .await?;

        let mut response = Message::reply_to(ref_message, MessageKind::Text);
        response.body = Some(body.to_string());
        response.platform_msg_id = Some(format!("{}-{}", edited.chat.id.0, edited.id.0));
        uow.messages().add(&response)?;
        Ok(response)
    }
}
