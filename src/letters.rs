//! Entity lifecycle: how voice memos become drafts, drafts become new draft
//! versions, and addressed drafts become dispatched orders.
//!
//! Every operation inserts a new draft row rather than mutating an existing
//! one; `builds_on` links each version to its predecessor. Order dispatch is
//! the only hard-to-reverse external effect and runs at most once per order.

use tracing::{error, info};

use crate::blob::BlobKind;
use crate::db::UnitOfWork;
use crate::error::Result;
use crate::integrations::compose::Composer;
use crate::integrations::mail::MailDispatcher;
use crate::integrations::pdf::render_letter;
use crate::integrations::transcribe::Transcriber;
use crate::models::{new_id, now_ts, Address, Draft, Message, Order, OrderStatus, User};

/// Result of turning a voice memo into a first draft.
pub struct VoiceDraft {
    pub draft: Draft,
    pub pdf: Vec<u8>,
    pub transcript: String,
}

/// Owns the external collaborators of the letter flows.
pub struct LetterPipeline {
    transcriber: Box<dyn Transcriber>,
    composer: Box<dyn Composer>,
    mail: Box<dyn MailDispatcher>,
}

impl LetterPipeline {
    pub fn new(
        transcriber: Box<dyn Transcriber>,
        composer: Box<dyn Composer>,
        mail: Box<dyn MailDispatcher>,
    ) -> Self {
        Self {
            transcriber,
            composer,
            mail,
        }
    }

    fn insert_draft(
        &self,
        uow: &UnitOfWork,
        user_id: &str,
        text: String,
        address_id: Option<String>,
        builds_on: Option<String>,
        address: Option<&Address>,
    ) -> Result<(Draft, Vec<u8>)> {
        let pdf = render_letter(&text, address);
        let blob_path = uow
            .blobs
            .upload(&pdf, BlobKind::Draft, user_id, "application/pdf")?;
        let draft = Draft {
            draft_id: new_id(),
            user_id: user_id.to_string(),
            created_at: now_ts(),
            text,
            blob_path,
            address_id,
            builds_on,
        };
        uow.drafts().add(&draft)?;
        Ok((draft, pdf))
    }

    /// Voice -> Draft: transcribe the stored memo, compose letter text with
    /// the user's style instruction, render, and insert a root draft.
    pub async fn draft_from_voice(
        &self,
        message: &Message,
        user: &User,
        uow: &UnitOfWork,
    ) -> Result<VoiceDraft> {
        let file = uow
            .files()
            .find_one(&[(
                "message_id",
                rusqlite::types::Value::from(message.message_id.clone()),
            )])?
            .ok_or_else(|| {
                crate::error::Error::NotFound(format!(
                    "file for message {}",
                    message.message_id
                ))
            })?;
        let audio = uow.blobs.download(&file.blob_path)?;
        let duration = message.memo_duration.unwrap_or(0.0);

        let transcript = self.transcriber.transcribe(audio, duration).await?;
        let text = self
            .composer
            .compose(&transcript, user.prompt.as_deref())
            .await?;

        let (draft, pdf) = self.insert_draft(uow, &user.user_id, text, None, None, None)?;
        info!("created draft {} from voice memo", draft.draft_id);
        Ok(VoiceDraft {
            draft,
            pdf,
            transcript,
        })
    }

    /// Edit -> Draft: apply instructions to the previous version; the new row
    /// links back via `builds_on` and carries `address_id` forward unchanged.
    pub async fn revised_draft(
        &self,
        old: &Draft,
        instructions: &str,
        uow: &UnitOfWork,
    ) -> Result<(Draft, Vec<u8>)> {
        let text = self.composer.revise(&old.text, instructions).await?;
        let (draft, pdf) = self.insert_draft(
            uow,
            &old.user_id,
            text,
            old.address_id.clone(),
            Some(old.draft_id.clone()),
            None,
        )?;
        info!("created draft {} building on {}", draft.draft_id, old.draft_id);
        Ok((draft, pdf))
    }

    /// Send -> Draft: stamp the latest version with the resolved address and
    /// render the final, addressed letter.
    pub fn addressed_draft(
        &self,
        base: &Draft,
        address: &Address,
        uow: &UnitOfWork,
    ) -> Result<(Draft, Vec<u8>)> {
        self.insert_draft(
            uow,
            &base.user_id,
            base.text.clone(),
            Some(address.address_id.clone()),
            Some(base.draft_id.clone()),
            Some(address),
        )
    }

    /// Hand the order's letter to the mail provider and move the order to
    /// `transferred`. Returns `true` only when this call performed the
    /// dispatch; an already-transferred order is a no-op, so duplicate
    /// confirm deliveries cannot dispatch (or bill) twice.
    pub async fn dispatch_order(&self, order: &Order, uow: &UnitOfWork) -> Result<bool> {
        if order.status == OrderStatus::Transferred {
            return Ok(false);
        }

        let draft = uow.drafts().get_one(&order.draft_id)?;
        let pdf = uow.blobs.download(&draft.blob_path)?;
        let filename = format!("order_{}_{}.pdf", order.order_id, now_ts());

        let receipt = match self.mail.send_letter(pdf, &filename).await {
            Ok(receipt) => receipt,
            Err(e) => {
                error!("dispatch of order {} failed: {e}", order.order_id);
                return Err(e);
            }
        };

        if !uow.mark_order_transferred(&order.order_id)? {
            // A concurrent delivery already claimed the transition.
            return Ok(false);
        }
        info!(
            "order {} dispatched, provider receipt {receipt}",
            order.order_id
        );
        Ok(true)
    }
}
