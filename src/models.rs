//! Domain records and the normalized message model.
//!
//! Every inbound and outbound platform event becomes one [`Message`] row in an
//! append-only log. Platform-specific reply-threading data lives in the
//! [`PlatformMeta`] union on the record, so the dispatch engine and lifecycle
//! code only ever see a single concrete message type.

use serde::{Deserialize, Serialize};

/// RFC 3339 UTC timestamp with fixed microsecond precision, so lexicographic
/// order in the database equals chronological order.
pub fn now_ts() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Fresh entity id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Messaging platform discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    WhatsApp,
    Telegram,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::WhatsApp => "whatsapp",
            Platform::Telegram => "telegram",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "whatsapp" => Some(Platform::WhatsApp),
            "telegram" => Some(Platform::Telegram),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentBy {
    User,
    System,
}

impl SentBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SentBy::User => "user",
            SentBy::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(SentBy::User),
            "system" => Some(SentBy::System),
            _ => None,
        }
    }
}

/// Payload classification of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Audio,
    Document,
    Image,
    Interactive,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Audio => "audio",
            MessageKind::Document => "document",
            MessageKind::Image => "image",
            MessageKind::Interactive => "interactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "audio" => Some(MessageKind::Audio),
            "document" => Some(MessageKind::Document),
            "image" => Some(MessageKind::Image),
            "interactive" => Some(MessageKind::Interactive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    PaymentPending,
    Paid,
    Transferred,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PaymentPending => "payment_pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Transferred => "transferred",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "payment_pending" => Some(OrderStatus::PaymentPending),
            "paid" => Some(OrderStatus::Paid),
            "transferred" => Some(OrderStatus::Transferred),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentType {
    Credits,
    Direct,
}

impl PaymentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentType::Credits => "credits",
            PaymentType::Direct => "direct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credits" => Some(PaymentType::Credits),
            "direct" => Some(PaymentType::Direct),
            _ => None,
        }
    }
}

/// Platform-specific reply-threading metadata, stored as one JSON column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "platform", rename_all = "snake_case")]
pub enum PlatformMeta {
    Telegram {
        chat_id: i64,
    },
    WhatsApp {
        phone_number: String,
        phone_number_id: String,
        #[serde(default)]
        profile_name: Option<String>,
    },
}

impl PlatformMeta {
    pub fn platform(&self) -> Platform {
        match self {
            PlatformMeta::Telegram { .. } => Platform::Telegram,
            PlatformMeta::WhatsApp { .. } => Platform::WhatsApp,
        }
    }
}

/// A person talking to the bot. Identity is anchored by at least one of
/// email, phone number, or telegram handle; never hard-deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub user_id: String,
    pub created_at: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub telegram_id: Option<String>,
    pub letter_credits: i64,
    /// Free-text style instruction applied when composing letters.
    pub prompt: Option<String>,
}

impl User {
    pub fn new(created_at: String) -> Self {
        Self {
            user_id: new_id(),
            created_at,
            first_name: None,
            last_name: None,
            email: None,
            phone_number: None,
            telegram_id: None,
            letter_credits: 0,
            prompt: None,
        }
    }
}

/// One entry in the append-only conversation log.
///
/// Immutable once written, except for back-filling `draft_referenced` /
/// `order_referenced` within the same logical operation. A message whose
/// command ends in `_callback` always carries a `response_to`.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_id: String,
    pub user_id: String,
    pub platform: Platform,
    pub sent_by: SentBy,
    pub kind: MessageKind,
    pub created_at: String,
    pub body: Option<String>,
    pub command: Option<String>,
    pub transcript: Option<String>,
    pub memo_duration: Option<f64>,
    pub attachment_mime: Option<String>,
    pub draft_referenced: Option<String>,
    pub order_referenced: Option<String>,
    /// Id of the message this one replies to.
    pub response_to: Option<String>,
    /// Tri-state: unset until a confirm/cancel button resolves it.
    pub action_confirmed: Option<bool>,
    /// The platform's own id for this message (wamid, chat-scoped Telegram id).
    /// Indexed; interactive-callback resolution filters on it.
    pub platform_msg_id: Option<String>,
    pub meta: PlatformMeta,
}

impl Message {
    /// New inbound message shell; the adapter fills in the classified payload.
    pub fn inbound(user_id: &str, kind: MessageKind, meta: PlatformMeta) -> Self {
        Self {
            message_id: new_id(),
            user_id: user_id.to_string(),
            platform: meta.platform(),
            sent_by: SentBy::User,
            kind,
            created_at: now_ts(),
            body: None,
            command: None,
            transcript: None,
            memo_duration: None,
            attachment_mime: None,
            draft_referenced: None,
            order_referenced: None,
            response_to: None,
            action_confirmed: None,
            platform_msg_id: None,
            meta,
        }
    }

    /// New outbound message replying to `ref_message`. Carries the referenced
    /// message's command and entity references forward so callback resolution
    /// can follow the chain without extra lookups.
    pub fn reply_to(ref_message: &Message, kind: MessageKind) -> Self {
        Self {
            message_id: new_id(),
            user_id: ref_message.user_id.clone(),
            platform: ref_message.platform,
            sent_by: SentBy::System,
            kind,
            created_at: now_ts(),
            body: None,
            command: ref_message.command.clone(),
            transcript: None,
            memo_duration: None,
            attachment_mime: None,
            draft_referenced: ref_message.draft_referenced.clone(),
            order_referenced: ref_message.order_referenced.clone(),
            response_to: Some(ref_message.message_id.clone()),
            action_confirmed: None,
            platform_msg_id: None,
            meta: ref_message.meta.clone(),
        }
    }

    /// Trimmed message body, empty string when absent.
    pub fn body_text(&self) -> &str {
        self.body.as_deref().map(str::trim).unwrap_or("")
    }

    pub fn command_str(&self) -> &str {
        self.command.as_deref().unwrap_or("")
    }
}

/// Pointer to binary content belonging to exactly one message.
#[derive(Debug, Clone, PartialEq)]
pub struct File {
    pub file_id: String,
    pub message_id: String,
    pub mime_type: String,
    pub blob_path: String,
}

/// Why an address block could not be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressBlockError {
    TooShort,
    TooLong,
}

/// A postal address in a user's address book. Never updated in place:
/// delete-and-recreate semantics.
#[derive(Debug, Clone, PartialEq)]
pub struct Address {
    pub address_id: String,
    pub user_id: String,
    pub created_at: String,
    pub addressee: String,
    pub line1: String,
    pub line2: Option<String>,
    pub postal_code: String,
    pub city: String,
    pub country: String,
}

impl Address {
    /// Parse the newline-delimited block a user sends with `/add_address`:
    /// addressee, line 1, optional line 2, postal code, city, country.
    pub fn parse_block(
        body: &str,
        user_id: &str,
    ) -> std::result::Result<Address, AddressBlockError> {
        let lines: Vec<&str> = body
            .trim()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        if lines.len() < 5 {
            return Err(AddressBlockError::TooShort);
        }
        if lines.len() > 6 {
            return Err(AddressBlockError::TooLong);
        }
        let line2 = if lines.len() == 6 {
            Some(lines[2].to_string())
        } else {
            None
        };
        let tail = &lines[lines.len() - 3..];
        Ok(Address {
            address_id: new_id(),
            user_id: user_id.to_string(),
            created_at: now_ts(),
            addressee: lines[0].to_string(),
            line1: lines[1].to_string(),
            line2,
            postal_code: tail[0].to_string(),
            city: tail[1].to_string(),
            country: tail[2].to_string(),
        })
    }

    /// Complete iff addressee, line 1, postal code, city, and country are all
    /// non-empty. Line 2 is optional.
    pub fn is_complete(&self) -> bool {
        ![
            &self.addressee,
            &self.line1,
            &self.postal_code,
            &self.city,
            &self.country,
        ]
        .iter()
        .any(|f| f.trim().is_empty())
    }

    /// The same newline-delimited block [`Address::parse_block`] accepts;
    /// parsing the result yields identical fields.
    pub fn to_message_block(&self) -> String {
        let mut lines = vec![self.addressee.clone(), self.line1.clone()];
        if let Some(line2) = &self.line2 {
            lines.push(line2.clone());
        }
        lines.push(self.postal_code.clone());
        lines.push(self.city.clone());
        lines.push(self.country.clone());
        lines.join("\n")
    }

    /// Envelope-style rendering used in the address book and on letters.
    pub fn format_simple(&self) -> String {
        let mut out = format!("{}\n{}\n", self.addressee, self.line1);
        if let Some(line2) = &self.line2 {
            out.push_str(line2);
            out.push('\n');
        }
        out.push_str(&format!("{} {}\n{}", self.postal_code, self.city, self.country));
        out
    }

    /// Labeled rendering so each field can be checked before confirming.
    pub fn format_for_confirmation(&self) -> String {
        let mut out = format!(
            "Addressee: {}\nAddress line 1: {}\n",
            self.addressee, self.line1
        );
        if let Some(line2) = &self.line2 {
            out.push_str(&format!("Address line 2: {}\n", line2));
        }
        out.push_str(&format!(
            "Postal code: {}\nCity/Town: {}\nCountry: {}",
            self.postal_code, self.city, self.country
        ));
        out
    }

    /// Address lines for the letter sheet itself.
    pub fn to_address_lines(&self) -> Vec<String> {
        let mut lines = vec![self.addressee.clone(), self.line1.clone()];
        if let Some(line2) = &self.line2 {
            lines.push(line2.clone());
        }
        lines.push(format!("{} {}", self.postal_code, self.city));
        lines.push(self.country.clone());
        lines
    }
}

/// Numbered rendering of a user's full address book.
pub fn format_address_book(addresses: &[Address]) -> String {
    addresses
        .iter()
        .enumerate()
        .map(|(idx, a)| format!("\n{})\n{}\n", idx + 1, a.format_simple()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A versioned snapshot of letter text plus its rendered PDF.
///
/// Edits and sends insert new rows; `builds_on` links each version to its
/// predecessor, terminating at the first transcription (`builds_on = None`).
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub draft_id: String,
    pub user_id: String,
    pub created_at: String,
    pub text: String,
    pub blob_path: String,
    pub address_id: Option<String>,
    pub builds_on: Option<String>,
}

/// One send-and-pay attempt for a draft/address pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub order_id: String,
    pub user_id: String,
    pub draft_id: String,
    pub address_id: String,
    /// The inbound message that triggered the send.
    pub message_id: String,
    pub created_at: String,
    pub status: OrderStatus,
    pub payment_type: PaymentType,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_address() -> Address {
        Address::parse_block(
            "John Doe\nMain St 1\n12345\nBerlin\nGermany",
            "user-1",
        )
        .unwrap()
    }

    #[test]
    fn test_parse_five_line_block() {
        let addr = sample_address();
        assert_eq!(addr.addressee, "John Doe");
        assert_eq!(addr.line1, "Main St 1");
        assert_eq!(addr.line2, None);
        assert_eq!(addr.postal_code, "12345");
        assert_eq!(addr.city, "Berlin");
        assert_eq!(addr.country, "Germany");
        assert!(addr.is_complete());
    }

    #[test]
    fn test_parse_six_line_block() {
        let addr = Address::parse_block(
            "Jane Doe\nLong Road 4\nApartment 5b\n67890\nHamburg\nGermany",
            "user-1",
        )
        .unwrap();
        assert_eq!(addr.line2.as_deref(), Some("Apartment 5b"));
        assert_eq!(addr.postal_code, "67890");
    }

    #[test]
    fn test_parse_rejects_wrong_line_counts() {
        assert_eq!(
            Address::parse_block("Jane\nStreet\n123", "u"),
            Err(AddressBlockError::TooShort)
        );
        assert_eq!(
            Address::parse_block("a\nb\nc\nd\ne\nf\ng", "u"),
            Err(AddressBlockError::TooLong)
        );
    }

    #[test]
    fn test_message_block_round_trip() {
        for block in [
            "John Doe\nMain St 1\n12345\nBerlin\nGermany",
            "Jane Doe\nLong Road 4\nApartment 5b\n67890\nHamburg\nGermany",
        ] {
            let parsed = Address::parse_block(block, "u").unwrap();
            let reparsed = Address::parse_block(&parsed.to_message_block(), "u").unwrap();
            assert_eq!(reparsed.addressee, parsed.addressee);
            assert_eq!(reparsed.line1, parsed.line1);
            assert_eq!(reparsed.line2, parsed.line2);
            assert_eq!(reparsed.postal_code, parsed.postal_code);
            assert_eq!(reparsed.city, parsed.city);
            assert_eq!(reparsed.country, parsed.country);
        }
    }

    #[test]
    fn test_address_book_formatting() {
        let book = vec![sample_address(), sample_address()];
        let rendered = format_address_book(&book);
        assert!(rendered.contains("1)"));
        assert!(rendered.contains("2)"));
        assert!(rendered.contains("12345 Berlin"));
    }

    #[test]
    fn test_reply_carries_references() {
        let mut inbound = Message::inbound(
            "user-1",
            MessageKind::Text,
            PlatformMeta::Telegram { chat_id: 42 },
        );
        inbound.command = Some("send".to_string());
        inbound.draft_referenced = Some("draft-1".to_string());
        inbound.order_referenced = Some("order-1".to_string());

        let reply = Message::reply_to(&inbound, MessageKind::Text);
        assert_eq!(reply.sent_by, SentBy::System);
        assert_eq!(reply.response_to.as_deref(), Some(inbound.message_id.as_str()));
        assert_eq!(reply.command.as_deref(), Some("send"));
        assert_eq!(reply.draft_referenced.as_deref(), Some("draft-1"));
        assert_eq!(reply.order_referenced.as_deref(), Some("order-1"));
        assert_eq!(reply.platform, Platform::Telegram);
    }

    #[test]
    fn test_platform_meta_round_trips_through_json() {
        let meta = PlatformMeta::WhatsApp {
            phone_number: "491701234567".to_string(),
            phone_number_id: "1066".to_string(),
            profile_name: Some("John".to_string()),
        };
        let json = serde_json::to_string(&meta).unwrap();
        let back: PlatformMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
        assert_eq!(back.platform(), Platform::WhatsApp);
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let a = now_ts();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_ts();
        assert!(a < b);
    }
}
