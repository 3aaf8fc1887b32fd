//! Command handlers and the dispatch entry point.
//!
//! A handler gets the normalized message, the request's Unit of Work, and the
//! adapter the message arrived through. Precondition failures (empty body,
//! no prior draft, empty address book) reply with a specific message and
//! return without side effects; only chain-integrity and infrastructure
//! problems propagate as errors.

use tracing::{info, warn};

use crate::commands::{CommandRegistry, HandlerFn, NO_COMMAND};
use crate::db::UnitOfWork;
use crate::error::{Error, Result};
use crate::fuzzy::{closest_address_index, closest_command};
use crate::integrations::payments::{PaymentEvent, PaymentLinks};
use crate::letters::LetterPipeline;
use crate::messengers::Messenger;
use crate::models::{
    format_address_book, Address, AddressBlockError, Message, Order, OrderStatus, PaymentType,
};

/// Outcome of a settled payment webhook, for the reply back to the user.
pub struct Settlement {
    pub message: Message,
    pub credits_bought: i64,
    pub balance: i64,
    pub dispatched: bool,
}

macro_rules! handler {
    ($method:ident) => {{
        fn shim<'a>(
            service: &'a Service,
            message: &'a Message,
            uow: &'a UnitOfWork,
            messenger: &'a dyn Messenger,
        ) -> futures_util::future::BoxFuture<'a, Result<()>> {
            Box::pin(service.$method(message, uow, messenger))
        }
        shim as HandlerFn
    }};
}

pub struct Service {
    pipeline: LetterPipeline,
    links: PaymentLinks,
    registry: CommandRegistry,
}

impl Service {
    pub fn new(pipeline: LetterPipeline, links: PaymentLinks) -> Self {
        let mut registry = CommandRegistry::new();
        registry.register("help", handler!(handle_help));
        registry.register("report_bug", handler!(handle_report_bug));
        registry.register("edit_prompt", handler!(handle_edit_prompt));
        registry.register("voice", handler!(handle_voice));
        registry.register("edit", handler!(handle_edit));
        registry.register("show_address_book", handler!(handle_show_address_book));
        registry.register("add_address", handler!(handle_add_address));
        registry.register("add_address_callback", handler!(handle_add_address_callback));
        registry.register("delete_address", handler!(handle_delete_address));
        registry.register("send", handler!(handle_send));
        registry.register("send_callback", handler!(handle_send_callback));

        Self {
            pipeline,
            links,
            registry,
        }
    }

    /// Dispatch a normalized inbound message to its handler.
    pub async fn receive_and_process(
        &self,
        message: &Message,
        uow: &UnitOfWork,
        messenger: &dyn Messenger,
    ) -> Result<()> {
        let command = message.command.clone().unwrap_or_else(|| NO_COMMAND.to_string());

        // Commands with long-running externals get an immediate signal that
        // something is happening.
        let confirmation = match command.as_str() {
            "voice" => Some("voice-confirm"),
            "edit" => Some("edit-confirm"),
            _ => None,
        };
        if let Some(identifier) = confirmation {
            messenger
                .reply_text(message, &uow.sys.get(identifier)?, uow)
                .await?;
        }

        match self.registry.get(&command) {
            Some(handler) => handler(self, message, uow, messenger).await,
            None if command == NO_COMMAND => {
                messenger
                    .reply_text(message, &uow.sys.get("no_command-success")?, uow)
                    .await?;
                Ok(())
            }
            None => {
                let candidates = self.registry.suggestible();
                let suggestion = closest_command(&command, &candidates).unwrap_or("help");
                info!("unknown command '{command}', suggesting '{suggestion}'");
                messenger
                    .reply_text(
                        message,
                        &uow.sys.render("unknown_command-success", &[suggestion])?,
                        uow,
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// Resolve a confirm/cancel callback to its proposal and, one hop
    /// further, the original inbound message that started the flow. All data
    /// a callback commits is re-derived from that original message; the
    /// message log is the only persisted state.
    fn resolve_proposal(
        &self,
        callback: &Message,
        uow: &UnitOfWork,
    ) -> Result<(Message, Message)> {
        let proposal_id = callback
            .response_to
            .as_deref()
            .ok_or_else(|| Error::BrokenChain("callback without response_to".into()))?;
        let proposal = uow
            .messages()
            .maybe_get_one(proposal_id)?
            .ok_or_else(|| Error::BrokenChain(format!("proposal {proposal_id} not found")))?;
        let original_id = proposal.response_to.as_deref().ok_or_else(|| {
            Error::BrokenChain(format!("proposal {} has no response_to", proposal.message_id))
        })?;
        let original = uow
            .messages()
            .maybe_get_one(original_id)?
            .ok_or_else(|| {
                Error::BrokenChain(format!("original message {original_id} not found"))
            })?;
        Ok((proposal, original))
    }

    async fn handle_help(
        &self,
        message: &Message,
        uow: &UnitOfWork,
        messenger: &dyn Messenger,
    ) -> Result<()> {
        messenger
            .reply_text(message, &uow.sys.get("help-success")?, uow)
            .await?;
        Ok(())
    }

    async fn handle_report_bug(
        &self,
        message: &Message,
        uow: &UnitOfWork,
        messenger: &dyn Messenger,
    ) -> Result<()> {
        let identifier = if message.body_text().is_empty() {
            "report_bug-error-msg_empty"
        } else {
            warn!("bug report from {}: {}", message.user_id, message.body_text());
            "report_bug-success"
        };
        messenger
            .reply_text(message, &uow.sys.get(identifier)?, uow)
            .await?;
        Ok(())
    }

    async fn handle_edit_prompt(
        &self,
        message: &Message,
        uow: &UnitOfWork,
        messenger: &dyn Messenger,
    ) -> Result<()> {
        if message.body_text().is_empty() {
            messenger
                .reply_text(message, &uow.sys.get("edit_prompt-error-msg_empty")?, uow)
                .await?;
            return Ok(());
        }

        let new_prompt = message.body_text().to_string();
        let mut user = uow.users().get_one(&message.user_id)?;
        user.prompt = Some(new_prompt.clone());
        uow.users().update(&user)?;

        messenger
            .reply_text(
                message,
                &uow.sys.render("edit_prompt-success", &[&new_prompt])?,
                uow,
            )
            .await?;
        Ok(())
    }

    async fn handle_voice(
        &self,
        message: &Message,
        uow: &UnitOfWork,
        messenger: &dyn Messenger,
    ) -> Result<()> {
        // A very short memo gets a warning but still goes through the full
        // flow.
        if message.memo_duration.unwrap_or(0.0) < 5.0 {
            messenger
                .reply_text(message, &uow.sys.get("voice-warning-duration")?, uow)
                .await?;
        }

        let user = uow.users().get_one(&message.user_id)?;
        let voice_draft = match self.pipeline.draft_from_voice(message, &user, uow).await {
            Ok(result) => result,
            Err(Error::UnsupportedContent(reason)) => {
                info!("letter for {} not printable: {reason}", message.message_id);
                messenger
                    .reply_text(
                        message,
                        &uow.sys.get("voice-error-characters_not_supported")?,
                        uow,
                    )
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // Back-fill the transcript onto the inbound message row.
        let mut updated = message.clone();
        updated.transcript = Some(voice_draft.transcript);
        updated.draft_referenced = Some(voice_draft.draft.draft_id.clone());
        uow.messages().update(&updated)?;

        messenger
            .reply_document(&updated, voice_draft.pdf, "draft.pdf", "application/pdf", uow)
            .await?;
        messenger
            .reply_text(&updated, &uow.sys.get("voice-success")?, uow)
            .await?;
        Ok(())
    }

    async fn handle_edit(
        &self,
        message: &Message,
        uow: &UnitOfWork,
        messenger: &dyn Messenger,
    ) -> Result<()> {
        if message.body_text().is_empty() {
            messenger
                .reply_text(message, &uow.sys.get("edit-error-msg_empty")?, uow)
                .await?;
            return Ok(());
        }

        let Some(old_draft) = uow.latest_draft(&message.user_id)? else {
            messenger
                .reply_text(message, &uow.sys.get("edit-error-no_draft_found")?, uow)
                .await?;
            return Ok(());
        };

        let (draft, pdf) = match self
            .pipeline
            .revised_draft(&old_draft, message.body_text(), uow)
            .await
        {
            Ok(result) => result,
            Err(Error::UnsupportedContent(reason)) => {
                info!("revision for {} not printable: {reason}", message.message_id);
                messenger
                    .reply_text(
                        message,
                        &uow.sys.get("voice-error-characters_not_supported")?,
                        uow,
                    )
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let mut updated = message.clone();
        updated.draft_referenced = Some(draft.draft_id.clone());
        uow.messages().update(&updated)?;

        messenger
            .reply_document(&updated, pdf, "draft_updated.pdf", "application/pdf", uow)
            .await?;
        messenger
            .reply_text(&updated, &uow.sys.get("edit-success")?, uow)
            .await?;
        Ok(())
    }

    async fn handle_show_address_book(
        &self,
        message: &Message,
        uow: &UnitOfWork,
        messenger: &dyn Messenger,
    ) -> Result<()> {
        let book = uow.address_book(&message.user_id)?;
        if book.is_empty() {
            messenger
                .reply_text(
                    message,
                    &uow.sys.get("show_address_book-error-user_has_no_addresses")?,
                    uow,
                )
                .await?;
            return Ok(());
        }

        let formatted = format_address_book(&book);
        let first_name = book[0]
            .addressee
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_string();
        messenger
            .reply_text(
                message,
                &uow.sys
                    .render("show_address_book-success", &[&formatted, &first_name])?,
                uow,
            )
            .await?;
        Ok(())
    }

    async fn handle_add_address(
        &self,
        message: &Message,
        uow: &UnitOfWork,
        messenger: &dyn Messenger,
    ) -> Result<()> {
        let address = match Address::parse_block(message.body_text(), &message.user_id) {
            Ok(address) => address,
            Err(AddressBlockError::TooShort) => {
                messenger
                    .reply_text(message, &uow.sys.get("add_address-error-too_short")?, uow)
                    .await?;
                return Ok(());
            }
            Err(AddressBlockError::TooLong) => {
                messenger
                    .reply_text(message, &uow.sys.get("add_address-error-too_long")?, uow)
                    .await?;
                return Ok(());
            }
        };

        // Nothing is inserted yet: the parse only feeds the confirmation
        // summary, and the callback re-parses from the original message.
        let summary = address.format_for_confirmation();
        messenger
            .reply_buttons(
                message,
                &uow.sys.render("add_address-success", &[&summary])?,
                &uow.sys.get("add_address-option-cancel")?,
                &uow.sys.get("add_address-option-confirm")?,
                uow,
            )
            .await?;
        Ok(())
    }

    async fn handle_add_address_callback(
        &self,
        message: &Message,
        uow: &UnitOfWork,
        messenger: &dyn Messenger,
    ) -> Result<()> {
        if message.action_confirmed != Some(true) {
            messenger
                .reply_edit_or_text(message, &uow.sys.get("add_address_callback-cancel")?, uow)
                .await?;
            return Ok(());
        }

        let (_proposal, original) = self.resolve_proposal(message, uow)?;
        let address = Address::parse_block(original.body_text(), &message.user_id)
            .map_err(|e| {
                Error::BrokenChain(format!(
                    "original message {} no longer parses as an address: {e:?}",
                    original.message_id
                ))
            })?;
        uow.addresses().add(&address)?;
        info!("added address {} for {}", address.address_id, message.user_id);

        messenger
            .reply_edit_or_text(message, &uow.sys.get("add_address_callback-confirm")?, uow)
            .await?;

        let book = uow.address_book(&message.user_id)?;
        messenger
            .reply_text(
                message,
                &uow.sys.render(
                    "add_address_callback-success-follow_up",
                    &[&format_address_book(&book)],
                )?,
                uow,
            )
            .await?;
        Ok(())
    }

    async fn handle_delete_address(
        &self,
        message: &Message,
        uow: &UnitOfWork,
        messenger: &dyn Messenger,
    ) -> Result<()> {
        if message.body_text().is_empty() {
            messenger
                .reply_text(message, &uow.sys.get("delete_address-error-msg_empty")?, uow)
                .await?;
            return Ok(());
        }

        let book = uow.address_book(&message.user_id)?;
        // An integer body is a 1-based index into the book; anything else is
        // matched fuzzily against the entries.
        let reference_idx = match message.body_text().parse::<usize>() {
            Ok(idx) => idx,
            Err(_) => match closest_address_index(message.body_text(), &book) {
                Some(idx) => {
                    info!(
                        "fuzzy-matched '{}' to address book entry {}",
                        message.body_text(),
                        idx + 1
                    );
                    idx + 1
                }
                None => 0,
            },
        };
        if reference_idx == 0 || reference_idx > book.len() {
            messenger
                .reply_text(message, &uow.sys.get("delete_address-error-invalid_idx")?, uow)
                .await?;
            return Ok(());
        }

        let to_delete = &book[reference_idx - 1];
        uow.addresses().delete(&to_delete.address_id)?;
        messenger
            .reply_text(message, &uow.sys.get("delete_address-success")?, uow)
            .await?;

        let book = uow.address_book(&message.user_id)?;
        messenger
            .reply_text(
                message,
                &uow.sys.render(
                    "delete_address-success-follow_up",
                    &[&format_address_book(&book)],
                )?,
                uow,
            )
            .await?;
        Ok(())
    }

    async fn handle_send(
        &self,
        message: &Message,
        uow: &UnitOfWork,
        messenger: &dyn Messenger,
    ) -> Result<()> {
        let user = uow.users().get_one(&message.user_id)?;

        // Checks in order: body names a recipient, a draft exists, the
        // address book is non-empty.
        if message.body_text().is_empty() {
            messenger
                .reply_text(message, &uow.sys.get("send-error-msg_empty")?, uow)
                .await?;
            return Ok(());
        }
        let Some(last_draft) = uow.latest_draft(&message.user_id)? else {
            messenger
                .reply_text(message, &uow.sys.get("send-error-no_draft")?, uow)
                .await?;
            return Ok(());
        };
        let book = uow.address_book(&message.user_id)?;
        if book.is_empty() {
            messenger
                .reply_text(message, &uow.sys.get("send-error-user_has_no_addresses")?, uow)
                .await?;
            return Ok(());
        }

        let Some(address_idx) = closest_address_index(message.body_text(), &book) else {
            messenger
                .reply_text(
                    message,
                    &uow.sys.render(
                        "send-error-no_good_address_match",
                        &[&format_address_book(&book)],
                    )?,
                    uow,
                )
                .await?;
            return Ok(());
        };
        let address = &book[address_idx];

        let (draft, pdf) = self.pipeline.addressed_draft(&last_draft, address, uow)?;

        let payment_type = if user.letter_credits > 0 {
            PaymentType::Credits
        } else {
            PaymentType::Direct
        };
        let order = Order {
            order_id: crate::models::new_id(),
            user_id: user.user_id.clone(),
            draft_id: draft.draft_id.clone(),
            address_id: address.address_id.clone(),
            message_id: message.message_id.clone(),
            created_at: crate::models::now_ts(),
            status: OrderStatus::PaymentPending,
            payment_type,
        };
        uow.orders().add(&order)?;

        // Back-fill the triggering message so the callback (or the payment
        // webhook) can recover the order without ambiguity.
        let mut updated = message.clone();
        updated.draft_referenced = Some(draft.draft_id.clone());
        updated.order_referenced = Some(order.order_id.clone());
        uow.messages().update(&updated)?;

        messenger
            .reply_document(&updated, pdf, "final_letter.pdf", "application/pdf", uow)
            .await?;

        match payment_type {
            PaymentType::Credits => {
                let first_name = user
                    .first_name
                    .as_deref()
                    .map(|n| format!(" {n}"))
                    .unwrap_or_default();
                let credits = user.letter_credits.to_string();
                let body = uow.sys.render(
                    "send-success-credits",
                    &[&first_name, &credits, &address.format_simple()],
                )?;
                messenger
                    .reply_buttons(
                        &updated,
                        &body,
                        &uow.sys.get("send-option-cancel_sending")?,
                        &uow.sys.get("send-option-confirm_sending")?,
                        uow,
                    )
                    .await?;
            }
            PaymentType::Direct => {
                let single = self.links.link_for(1, &order.order_id)?;
                let five = self.links.link_for(5, &order.order_id)?;
                let ten = self.links.link_for(10, &order.order_id)?;
                messenger
                    .reply_text(
                        &updated,
                        &uow.sys
                            .render("send-success-one_off", &[&single, &five, &ten])?,
                        uow,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn handle_send_callback(
        &self,
        message: &Message,
        uow: &UnitOfWork,
        messenger: &dyn Messenger,
    ) -> Result<()> {
        if message.action_confirmed != Some(true) {
            messenger
                .reply_edit_or_text(message, &uow.sys.get("send_callback-cancel")?, uow)
                .await?;
            return Ok(());
        }

        let (_proposal, original) = self.resolve_proposal(message, uow)?;
        let order_id = original.order_referenced.as_deref().ok_or_else(|| {
            Error::BrokenChain(format!(
                "original message {} references no order",
                original.message_id
            ))
        })?;
        let order = uow.orders().get_one(order_id)?;

        let dispatched = self.pipeline.dispatch_order(&order, uow).await?;
        if dispatched && order.payment_type == PaymentType::Credits {
            let balance = uow.adjust_credits(&order.user_id, -1)?;
            info!(
                "order {} paid with a credit, {balance} remaining for {}",
                order.order_id, order.user_id
            );
        }

        messenger
            .reply_edit_or_text(message, &uow.sys.get("send_callback-confirm")?, uow)
            .await?;
        Ok(())
    }

    /// Settle a payment webhook: credit the purchase, dispatch the order, and
    /// report what to tell the user. Returns `None` for a re-delivered event
    /// (idempotency ledger hit), which the caller acknowledges as a no-op.
    pub async fn settle_payment(
        &self,
        event: &PaymentEvent,
        uow: &UnitOfWork,
    ) -> Result<Option<Settlement>> {
        if !uow.record_webhook_event(&event.event_id)? {
            info!("payment event {} already processed", event.event_id);
            return Ok(None);
        }

        let mut order = uow.orders().get_one(&event.order_id)?;
        let original = uow.messages().get_one(&order.message_id)?;

        uow.adjust_credits(&order.user_id, event.credits_bought)?;
        if order.status == OrderStatus::PaymentPending {
            order.status = OrderStatus::Paid;
            uow.orders().update(&order)?;
        }

        let dispatched = match self.pipeline.dispatch_order(&order, uow).await {
            Ok(dispatched) => dispatched,
            Err(e) => {
                // Paid but not yet transferred; the order record says so and
                // a later delivery or manual retry can finish the job.
                tracing::error!("post-payment dispatch of order {} failed: {e}", order.order_id);
                false
            }
        };
        let balance = if dispatched {
            uow.adjust_credits(&order.user_id, -1)?
        } else {
            uow.users().get_one(&order.user_id)?.letter_credits
        };

        Ok(Some(Settlement {
            message: original,
            credits_bought: event.credits_bought,
            balance,
            dispatched,
        }))
    }
}
