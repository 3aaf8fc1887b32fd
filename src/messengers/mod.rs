//! Platform adapters.
//!
//! Each platform implements the [`Messenger`] capability trait for outbound
//! replies plus its own inbound `process_*` entry point (raw event types
//! differ per platform). Every operation that reaches the platform appends
//! exactly one new [`Message`](crate::models::Message) row; replies never
//! mutate the message they reference.

use async_trait::async_trait;

use crate::db::UnitOfWork;
use crate::error::Result;
use crate::models::Message;

pub mod telegram;
pub mod whatsapp;

pub use telegram::Telegram;
pub use whatsapp::WhatsApp;

/// Outbound reply capabilities, one implementation per platform.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Plain text reply in the conversation `ref_message` belongs to.
    async fn reply_text(
        &self,
        ref_message: &Message,
        body: &str,
        uow: &UnitOfWork,
    ) -> Result<Message>;

    /// Send a document (letter PDF) into the conversation.
    async fn reply_document(
        &self,
        ref_message: &Message,
        bytes: Vec<u8>,
        filename: &str,
        mime_type: &str,
        uow: &UnitOfWork,
    ) -> Result<Message>;

    /// Interactive confirm/cancel prompt. The callback payload embeds the id
    /// of the newly created outbound message itself, so the platform echoes
    /// it back and `response_to` resolves deterministically.
    async fn reply_buttons(
        &self,
        ref_message: &Message,
        main_text: &str,
        cancel_label: &str,
        confirm_label: &str,
        uow: &UnitOfWork,
    ) -> Result<Message>;

    /// Edit the referenced interactive message in place where the platform
    /// supports it; otherwise send a fresh text message.
    async fn reply_edit_or_text(
        &self,
        ref_message: &Message,
        body: &str,
        uow: &UnitOfWork,
    ) -> Result<Message>;
}
