//! End-to-end command-flow tests.
//!
//! Flows run against a real temp-file SQLite store; the platform adapter is a
//! recording mock and the external collaborators (transcription, composition,
//! mail) are stubs, so nothing touches the network.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::blob::BlobKind;
use crate::commands::parse_command;
use crate::db::{Store, UnitOfWork};
use crate::error::{Error, Result};
use crate::integrations::compose::Composer;
use crate::integrations::mail::MailDispatcher;
use crate::integrations::payments::{PaymentEvent, PaymentLinks};
use crate::integrations::transcribe::Transcriber;
use crate::letters::LetterPipeline;
use crate::messengers::Messenger;
use crate::models::{
    new_id, now_ts, Address, Draft, Message, MessageKind, OrderStatus, PlatformMeta, SentBy, User,
};
use crate::service::Service;
use crate::sysmsg::SystemMessages;

struct StubTranscriber;

#[async_trait]
impl Transcriber for StubTranscriber {
    async fn transcribe(&self, _audio: Vec<u8>, _duration_secs: f64) -> Result<String> {
        Ok("hello grandma, the garden is blooming".to_string())
    }
}

struct StubComposer {
    fail_unsupported: bool,
}

#[async_trait]
impl Composer for StubComposer {
    async fn compose(&self, transcript: &str, user_prompt: Option<&str>) -> Result<String> {
        if self.fail_unsupported {
            return Err(Error::UnsupportedContent("stub rejection".into()));
        }
        let style = user_prompt.unwrap_or("plain");
        Ok(format!("Dear friend,\n\n{transcript}\n\n[{style}]"))
    }

    async fn revise(&self, old_text: &str, instructions: &str) -> Result<String> {
        if self.fail_unsupported {
            return Err(Error::UnsupportedContent("stub rejection".into()));
        }
        Ok(format!("{old_text} [edited: {instructions}]"))
    }
}

struct StubMail {
    calls: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait]
impl MailDispatcher for StubMail {
    async fn send_letter(&self, _pdf: Vec<u8>, _filename: &str) -> Result<String> {
        if self.fail {
            return Err(Error::Mail("stub outage".into()));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok("receipt-1".to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Reply {
    Text(String),
    Document(String),
    Buttons {
        body: String,
        cancel: String,
        confirm: String,
    },
    Edit(String),
}

/// Records every reply and appends outbound message rows the way a real
/// adapter would.
#[derive(Default)]
struct MockMessenger {
    sent: Mutex<Vec<Reply>>,
}

impl MockMessenger {
    fn replies(&self) -> Vec<Reply> {
        self.sent.lock().unwrap().clone()
    }

    fn texts(&self) -> Vec<String> {
        self.replies()
            .into_iter()
            .filter_map(|r| match r {
                Reply::Text(t) | Reply::Edit(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    fn any_text_contains(&self, needle: &str) -> bool {
        self.texts().iter().any(|t| t.contains(needle))
    }

    fn documents(&self) -> Vec<String> {
        self.replies()
            .into_iter()
            .filter_map(|r| match r {
                Reply::Document(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    fn buttons(&self) -> Option<(String, String, String)> {
        self.replies().into_iter().rev().find_map(|r| match r {
            Reply::Buttons {
                body,
                cancel,
                confirm,
            } => Some((body, cancel, confirm)),
            _ => None,
        })
    }
}

#[async_trait]
impl Messenger for MockMessenger {
    async fn reply_text(
        &self,
        ref_message: &Message,
        body: &str,
        uow: &UnitOfWork,
    ) -> Result<Message> {
        let mut response = Message::reply_to(ref_message, MessageKind::Text);
        response.body = Some(body.to_string());
        uow.messages().add(&response)?;
        self.sent.lock().unwrap().push(Reply::Text(body.to_string()));
        Ok(response)
    }

    async fn reply_document(
        &self,
        ref_message: &Message,
        _bytes: Vec<u8>,
        filename: &str,
        mime_type: &str,
        uow: &UnitOfWork,
    ) -> Result<Message> {
        let mut response = Message::reply_to(ref_message, MessageKind::Document);
        response.attachment_mime = Some(mime_type.to_string());
        uow.messages().add(&response)?;
        self.sent
            .lock()
            .unwrap()
            .push(Reply::Document(filename.to_string()));
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
        let mut response = Message::reply_to(ref_message, MessageKind::Interactive);
        response.body = Some(main_text.to_string());
        uow.messages().add(&response)?;
        self.sent.lock().unwrap().push(Reply::Buttons {
            body: main_text.to_string(),
            cancel: cancel_label.to_string(),
            confirm: confirm_label.to_string(),
        });
        Ok(response)
    }

    async fn reply_edit_or_text(
        &self,
        ref_message: &Message,
        body: &str,
        uow: &UnitOfWork,
    ) -> Result<Message> {
        let mut response = Message::reply_to(ref_message, MessageKind::Text);
        response.body = Some(body.to_string());
        uow.messages().add(&response)?;
        self.sent.lock().unwrap().push(Reply::Edit(body.to_string()));
        Ok(response)
    }
}

struct TestBot {
    store: Store,
    service: Service,
    messenger: MockMessenger,
    mail_calls: Arc<AtomicUsize>,
    _dir: tempfile::TempDir,
}

fn bot_with(compose_fails: bool, mail_fails: bool) -> TestBot {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(
        &dir.path().join("bot.db"),
        &dir.path().join("blobs"),
        SystemMessages::embedded(),
    )
    .unwrap();

    let mail_calls = Arc::new(AtomicUsize::new(0));
    let pipeline = LetterPipeline::new(
        Box::new(StubTranscriber),
        Box::new(StubComposer {
            fail_unsupported: compose_fails,
        }),
        Box::new(StubMail {
            calls: mail_calls.clone(),
            fail: mail_fails,
        }),
    );
    let links = PaymentLinks {
        single: "https://pay.example/one".into(),
        five: "https://pay.example/five".into(),
        ten: "https://pay.example/ten".into(),
    };

    TestBot {
        store,
        service: Service::new(pipeline, links),
        messenger: MockMessenger::default(),
        mail_calls,
        _dir: dir,
    }
}

fn bot() -> TestBot {
    bot_with(false, false)
}

fn seed_user(uow: &UnitOfWork, credits: i64) -> User {
    let mut user = User::new(now_ts());
    user.telegram_id = Some(format!("tester_{}", &new_id()[..8]));
    user.first_name = Some("Sam".to_string());
    user.letter_credits = credits;
    uow.users().add(&user).unwrap();
    user
}

fn inbound_text(uow: &UnitOfWork, user: &User, text: &str) -> Message {
    let (command, body) = parse_command(text);
    let mut message = Message::inbound(
        &user.user_id,
        MessageKind::Text,
        PlatformMeta::Telegram { chat_id: 42 },
    );
    message.command = Some(command);
    message.body = Some(body);
    uow.messages().add(&message).unwrap();
    message
}

fn inbound_voice(uow: &UnitOfWork, user: &User, duration: f64) -> Message {
    let mut message = Message::inbound(
        &user.user_id,
        MessageKind::Audio,
        PlatformMeta::Telegram { chat_id: 42 },
    );
    message.command = Some("voice".to_string());
    message.memo_duration = Some(duration);
    message.attachment_mime = Some("audio/ogg".to_string());
    uow.messages().add(&message).unwrap();

    let path = uow
        .blobs
        .upload(b"fake ogg bytes", BlobKind::Memo, &user.user_id, "audio/ogg")
        .unwrap();
    uow.files()
        .add(&crate::models::File {
            file_id: new_id(),
            message_id: message.message_id.clone(),
            mime_type: "audio/ogg".to_string(),
            blob_path: path,
        })
        .unwrap();
    message
}

fn inbound_callback(
    uow: &UnitOfWork,
    user: &User,
    proposal: &Message,
    confirmed: bool,
) -> Message {
    let mut message = Message::inbound(
        &user.user_id,
        MessageKind::Interactive,
        PlatformMeta::Telegram { chat_id: 42 },
    );
    message.command = proposal.command.as_ref().map(|c| format!("{c}_callback"));
    message.response_to = Some(proposal.message_id.clone());
    message.action_confirmed = Some(confirmed);
    uow.messages().add(&message).unwrap();
    message
}

/// The most recent interactive prompt the bot sent.
fn last_proposal(uow: &UnitOfWork) -> Message {
    uow.messages()
        .get_all(
            &[
                ("kind", rusqlite::types::Value::from("interactive".to_string())),
                ("sent_by", rusqlite::types::Value::from("system".to_string())),
            ],
            Some(("created_at", crate::db::Dir::Desc)),
        )
        .unwrap()
        .into_iter()
        .next()
        .expect("no interactive prompt was sent")
}

fn seed_address(uow: &UnitOfWork, user: &User, block: &str) -> Address {
    let addr = Address::parse_block(block, &user.user_id).unwrap();
    uow.addresses().add(&addr).unwrap();
    addr
}

fn seed_draft(uow: &UnitOfWork, user: &User, text: &str, address_id: Option<&str>) -> Draft {
    let draft = Draft {
        draft_id: new_id(),
        user_id: user.user_id.clone(),
        created_at: now_ts(),
        text: text.to_string(),
        blob_path: uow
            .blobs
            .upload(b"%PDF", BlobKind::Draft, &user.user_id, "application/pdf")
            .unwrap(),
        address_id: address_id.map(str::to_string),
        builds_on: None,
    };
    uow.drafts().add(&draft).unwrap();
    draft
}

#[tokio::test]
async fn test_free_text_gets_fallback() {
    let bot = bot();
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 0);
    let msg = inbound_text(&uow, &user, "hey, what's up?");

    bot.service
        .receive_and_process(&msg, &uow, &bot.messenger)
        .await
        .unwrap();

    assert!(bot.messenger.any_text_contains("voice memos"));
}

#[tokio::test]
async fn test_unknown_command_suggests_closest() {
    let bot = bot();
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 0);
    let msg = inbound_text(&uow, &user, "/sned Doris");

    bot.service
        .receive_and_process(&msg, &uow, &bot.messenger)
        .await
        .unwrap();

    assert!(bot.messenger.any_text_contains("/send"));
    // Suggestion only; nothing was executed.
    assert!(uow.orders().get_all(&[], None).unwrap().is_empty());
}

#[tokio::test]
async fn test_short_voice_memo_warns_and_still_drafts() {
    let bot = bot();
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 0);
    let msg = inbound_voice(&uow, &user, 3.0);

    bot.service
        .receive_and_process(&msg, &uow, &bot.messenger)
        .await
        .unwrap();

    // Pre-ack, duration warning, and the success message all arrive; the
    // warning does not short-circuit the flow.
    assert!(bot.messenger.any_text_contains("give me a moment"));
    assert!(bot.messenger.any_text_contains("very short"));
    assert_eq!(bot.messenger.documents(), vec!["draft.pdf"]);

    let draft = uow.latest_draft(&user.user_id).unwrap().unwrap();
    assert!(draft.builds_on.is_none());
    assert!(draft.address_id.is_none());
    assert!(draft.text.contains("garden is blooming"));

    // Transcript and draft reference are back-filled onto the inbound row.
    let stored = uow.messages().get_one(&msg.message_id).unwrap();
    assert!(stored.transcript.unwrap().contains("garden"));
    assert_eq!(stored.draft_referenced.as_deref(), Some(draft.draft_id.as_str()));
}

#[tokio::test]
async fn test_normal_voice_memo_has_no_warning() {
    let bot = bot();
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 0);
    let msg = inbound_voice(&uow, &user, 30.0);

    bot.service
        .receive_and_process(&msg, &uow, &bot.messenger)
        .await
        .unwrap();

    assert!(!bot.messenger.any_text_contains("very short"));
    assert_eq!(bot.messenger.documents(), vec!["draft.pdf"]);
}

#[tokio::test]
async fn test_unprintable_letter_becomes_user_reply() {
    let bot = bot_with(true, false);
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 0);
    let msg = inbound_voice(&uow, &user, 30.0);

    bot.service
        .receive_and_process(&msg, &uow, &bot.messenger)
        .await
        .unwrap();

    assert!(bot.messenger.any_text_contains("can't print"));
    assert!(bot.messenger.documents().is_empty());
    assert!(uow.latest_draft(&user.user_id).unwrap().is_none());
}

#[tokio::test]
async fn test_edit_without_draft_is_a_precondition_reply() {
    let bot = bot();
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 0);
    let msg = inbound_text(&uow, &user, "/edit make it shorter");

    bot.service
        .receive_and_process(&msg, &uow, &bot.messenger)
        .await
        .unwrap();

    assert!(bot.messenger.any_text_contains("no draft to edit"));
    assert!(uow.latest_draft(&user.user_id).unwrap().is_none());
}

#[tokio::test]
async fn test_edit_builds_new_version_and_keeps_address() {
    let bot = bot();
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 0);
    let root = seed_draft(&uow, &user, "Dear Doris, hello.", Some("addr-1"));
    let msg = inbound_text(&uow, &user, "/edit sign off with love");

    bot.service
        .receive_and_process(&msg, &uow, &bot.messenger)
        .await
        .unwrap();

    let latest = uow.latest_draft(&user.user_id).unwrap().unwrap();
    assert_ne!(latest.draft_id, root.draft_id);
    assert_eq!(latest.builds_on.as_deref(), Some(root.draft_id.as_str()));
    assert_eq!(latest.address_id.as_deref(), Some("addr-1"));
    assert!(latest.text.contains("[edited: sign off with love]"));
    assert_eq!(bot.messenger.documents(), vec!["draft_updated.pdf"]);

    // The old version is untouched.
    let old = uow.drafts().get_one(&root.draft_id).unwrap();
    assert_eq!(old.text, "Dear Doris, hello.");
}

#[tokio::test]
async fn test_add_address_confirm_flow() {
    let bot = bot();
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 0);
    let msg = inbound_text(
        &uow,
        &user,
        "/add_address\nJohn Doe\nMain St 1\n12345\nBerlin\nGermany",
    );

    bot.service
        .receive_and_process(&msg, &uow, &bot.messenger)
        .await
        .unwrap();

    // A labeled confirmation with confirm/cancel buttons; nothing inserted.
    let (body, cancel, confirm) = bot.messenger.buttons().expect("buttons expected");
    assert!(body.contains("Addressee: John Doe"));
    assert!(body.contains("Postal code: 12345"));
    assert_eq!(cancel, "Cancel");
    assert_eq!(confirm, "Looks good");
    assert!(uow.address_book(&user.user_id).unwrap().is_empty());

    // Tap confirm: the callback re-parses the original message and commits.
    let proposal = last_proposal(&uow);
    let callback = inbound_callback(&uow, &user, &proposal, true);
    bot.service
        .receive_and_process(&callback, &uow, &bot.messenger)
        .await
        .unwrap();

    let book = uow.address_book(&user.user_id).unwrap();
    assert_eq!(book.len(), 1);
    assert_eq!(book[0].addressee, "John Doe");
    assert!(bot.messenger.any_text_contains("Saved!"));
    assert!(bot.messenger.any_text_contains("address book now looks like"));
}

#[tokio::test]
async fn test_add_address_cancel_inserts_nothing() {
    let bot = bot();
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 0);
    let msg = inbound_text(
        &uow,
        &user,
        "/add_address\nJohn Doe\nMain St 1\n12345\nBerlin\nGermany",
    );
    bot.service
        .receive_and_process(&msg, &uow, &bot.messenger)
        .await
        .unwrap();

    let proposal = last_proposal(&uow);
    let callback = inbound_callback(&uow, &user, &proposal, false);
    bot.service
        .receive_and_process(&callback, &uow, &bot.messenger)
        .await
        .unwrap();

    assert!(uow.address_book(&user.user_id).unwrap().is_empty());
    assert!(bot.messenger.any_text_contains("didn't save"));
}

#[tokio::test]
async fn test_add_address_rejects_short_block() {
    let bot = bot();
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 0);
    let msg = inbound_text(&uow, &user, "/add_address\nJohn Doe\nMain St 1");

    bot.service
        .receive_and_process(&msg, &uow, &bot.messenger)
        .await
        .unwrap();

    assert!(bot.messenger.any_text_contains("incomplete"));
    assert!(bot.messenger.buttons().is_none());
}

#[tokio::test]
async fn test_broken_callback_chain_is_an_internal_error() {
    let bot = bot();
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 0);

    // A callback whose proposal points at nothing.
    let mut orphan = Message::inbound(
        &user.user_id,
        MessageKind::Interactive,
        PlatformMeta::Telegram { chat_id: 42 },
    );
    orphan.command = Some("add_address_callback".to_string());
    orphan.action_confirmed = Some(true);
    uow.messages().add(&orphan).unwrap();

    let err = bot
        .service
        .receive_and_process(&orphan, &uow, &bot.messenger)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BrokenChain(_)));
}

#[tokio::test]
async fn test_delete_address_invalid_index() {
    let bot = bot();
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 0);
    seed_address(&uow, &user, "Anna\nWay 1\n10000\nTown\nLand");
    seed_address(&uow, &user, "Bert\nWay 2\n10001\nTown\nLand");

    let msg = inbound_text(&uow, &user, "/delete_address 3");
    bot.service
        .receive_and_process(&msg, &uow, &bot.messenger)
        .await
        .unwrap();

    assert!(bot.messenger.any_text_contains("doesn't match an entry"));
    assert_eq!(uow.address_book(&user.user_id).unwrap().len(), 2);
}

#[tokio::test]
async fn test_delete_address_by_fuzzy_name() {
    let bot = bot();
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 0);
    seed_address(&uow, &user, "Doris Meyer\nWay 1\n10000\nBerlin\nGermany");
    seed_address(&uow, &user, "John Doe\nWay 2\n10001\nHamburg\nGermany");

    let msg = inbound_text(&uow, &user, "/delete_address doris");
    bot.service
        .receive_and_process(&msg, &uow, &bot.messenger)
        .await
        .unwrap();

    let book = uow.address_book(&user.user_id).unwrap();
    assert_eq!(book.len(), 1);
    assert_eq!(book[0].addressee, "John Doe");
    assert!(bot.messenger.any_text_contains("Address deleted"));
}

#[tokio::test]
async fn test_send_without_match_renders_book_and_creates_nothing() {
    let bot = bot();
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 3);
    seed_draft(&uow, &user, "Dear Doris, hello.", None);
    seed_address(&uow, &user, "Doris Meyer\nWay 1\n10000\nBerlin\nGermany");
    let drafts_before = uow.drafts().get_all(&[], None).unwrap().len();

    let msg = inbound_text(&uow, &user, "/send zzzyyyxxx");
    bot.service
        .receive_and_process(&msg, &uow, &bot.messenger)
        .await
        .unwrap();

    assert!(bot.messenger.any_text_contains("couldn't match"));
    assert!(bot.messenger.any_text_contains("Doris Meyer"));
    assert!(uow.orders().get_all(&[], None).unwrap().is_empty());
    assert_eq!(uow.drafts().get_all(&[], None).unwrap().len(), drafts_before);
}

#[tokio::test]
async fn test_send_with_credits_confirms_and_dispatches_once() {
    let bot = bot();
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 3);
    let root = seed_draft(&uow, &user, "Dear Doris, hello.", None);
    let address = seed_address(&uow, &user, "Doris Meyer\nWay 1\n10000\nBerlin\nGermany");

    let msg = inbound_text(&uow, &user, "/send Doris");
    bot.service
        .receive_and_process(&msg, &uow, &bot.messenger)
        .await
        .unwrap();

    // Final letter goes out, then a confirm/cancel prompt.
    assert_eq!(bot.messenger.documents(), vec!["final_letter.pdf"]);
    let (body, _, confirm) = bot.messenger.buttons().expect("buttons expected");
    assert!(body.contains("3 letter credit(s)"));
    assert!(body.contains("Doris Meyer"));
    assert_eq!(confirm, "Send it");

    // The addressed draft chains onto the previous version.
    let addressed = uow.latest_draft(&user.user_id).unwrap().unwrap();
    assert_eq!(addressed.builds_on.as_deref(), Some(root.draft_id.as_str()));
    assert_eq!(
        addressed.address_id.as_deref(),
        Some(address.address_id.as_str())
    );

    // The order is pending and back-filled onto the triggering message.
    let order = uow.orders().get_all(&[], None).unwrap().remove(0);
    assert_eq!(order.status, OrderStatus::PaymentPending);
    let stored = uow.messages().get_one(&msg.message_id).unwrap();
    assert_eq!(stored.order_referenced.as_deref(), Some(order.order_id.as_str()));
    assert_eq!(
        stored.draft_referenced.as_deref(),
        Some(addressed.draft_id.as_str())
    );

    // Confirm: exactly one dispatch, exactly one credit.
    let proposal = last_proposal(&uow);
    let callback = inbound_callback(&uow, &user, &proposal, true);
    bot.service
        .receive_and_process(&callback, &uow, &bot.messenger)
        .await
        .unwrap();

    assert_eq!(bot.mail_calls.load(Ordering::SeqCst), 1);
    let order = uow.orders().get_one(&order.order_id).unwrap();
    assert_eq!(order.status, OrderStatus::Transferred);
    assert_eq!(uow.users().get_one(&user.user_id).unwrap().letter_credits, 2);
    assert!(bot.messenger.any_text_contains("on its way"));

    // The platform re-delivers the confirm: no second dispatch, no second
    // decrement.
    let duplicate = inbound_callback(&uow, &user, &proposal, true);
    bot.service
        .receive_and_process(&duplicate, &uow, &bot.messenger)
        .await
        .unwrap();

    assert_eq!(bot.mail_calls.load(Ordering::SeqCst), 1);
    assert_eq!(uow.users().get_one(&user.user_id).unwrap().letter_credits, 2);
}

#[tokio::test]
async fn test_send_callback_cancel_leaves_order_pending() {
    let bot = bot();
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 1);
    seed_draft(&uow, &user, "Dear Doris, hello.", None);
    seed_address(&uow, &user, "Doris Meyer\nWay 1\n10000\nBerlin\nGermany");

    let msg = inbound_text(&uow, &user, "/send Doris");
    bot.service
        .receive_and_process(&msg, &uow, &bot.messenger)
        .await
        .unwrap();

    let proposal = last_proposal(&uow);
    let callback = inbound_callback(&uow, &user, &proposal, false);
    bot.service
        .receive_and_process(&callback, &uow, &bot.messenger)
        .await
        .unwrap();

    assert_eq!(bot.mail_calls.load(Ordering::SeqCst), 0);
    let order = uow.orders().get_all(&[], None).unwrap().remove(0);
    assert_eq!(order.status, OrderStatus::PaymentPending);
    assert_eq!(uow.users().get_one(&user.user_id).unwrap().letter_credits, 1);
    assert!(bot.messenger.any_text_contains("won't send it"));
}

#[tokio::test]
async fn test_send_without_credits_emits_payment_links() {
    let bot = bot();
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 0);
    seed_draft(&uow, &user, "Dear Doris, hello.", None);
    seed_address(&uow, &user, "Doris Meyer\nWay 1\n10000\nBerlin\nGermany");

    let msg = inbound_text(&uow, &user, "/send Doris");
    bot.service
        .receive_and_process(&msg, &uow, &bot.messenger)
        .await
        .unwrap();

    let order = uow.orders().get_all(&[], None).unwrap().remove(0);
    assert_eq!(order.status, OrderStatus::PaymentPending);
    let reference = format!("client_reference_id={}", order.order_id);
    assert!(bot.messenger.any_text_contains(&format!(
        "https://pay.example/one?{reference}"
    )));
    assert!(bot.messenger.any_text_contains(&format!(
        "https://pay.example/five?{reference}"
    )));
    assert!(bot.messenger.any_text_contains(&format!(
        "https://pay.example/ten?{reference}"
    )));
    assert!(bot.messenger.buttons().is_none());
    assert_eq!(bot.mail_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_payment_webhook_settles_and_deduplicates() {
    let bot = bot();
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 0);
    seed_draft(&uow, &user, "Dear Doris, hello.", None);
    seed_address(&uow, &user, "Doris Meyer\nWay 1\n10000\nBerlin\nGermany");

    let msg = inbound_text(&uow, &user, "/send Doris");
    bot.service
        .receive_and_process(&msg, &uow, &bot.messenger)
        .await
        .unwrap();
    let order = uow.orders().get_all(&[], None).unwrap().remove(0);

    let event = PaymentEvent {
        event_id: "evt_1".to_string(),
        order_id: order.order_id.clone(),
        credits_bought: 1,
    };
    let settlement = bot
        .service
        .settle_payment(&event, &uow)
        .await
        .unwrap()
        .expect("first delivery settles");

    assert!(settlement.dispatched);
    assert_eq!(settlement.credits_bought, 1);
    assert_eq!(settlement.balance, 0);
    assert_eq!(settlement.message.message_id, msg.message_id);
    assert_eq!(bot.mail_calls.load(Ordering::SeqCst), 1);
    let order = uow.orders().get_one(&order.order_id).unwrap();
    assert_eq!(order.status, OrderStatus::Transferred);

    // Same event id again: idempotent no-op.
    let duplicate = bot.service.settle_payment(&event, &uow).await.unwrap();
    assert!(duplicate.is_none());
    assert_eq!(bot.mail_calls.load(Ordering::SeqCst), 1);
    assert_eq!(uow.users().get_one(&user.user_id).unwrap().letter_credits, 0);
}

#[tokio::test]
async fn test_payment_webhook_survives_mail_outage() {
    let bot = bot_with(false, true);
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 0);
    seed_draft(&uow, &user, "Dear Doris, hello.", None);
    seed_address(&uow, &user, "Doris Meyer\nWay 1\n10000\nBerlin\nGermany");

    let msg = inbound_text(&uow, &user, "/send Doris");
    bot.service
        .receive_and_process(&msg, &uow, &bot.messenger)
        .await
        .unwrap();
    let order = uow.orders().get_all(&[], None).unwrap().remove(0);

    let event = PaymentEvent {
        event_id: "evt_2".to_string(),
        order_id: order.order_id.clone(),
        credits_bought: 5,
    };
    let settlement = bot
        .service
        .settle_payment(&event, &uow)
        .await
        .unwrap()
        .expect("settles despite outage");

    // The purchase sticks, the letter does not go out, and the order record
    // shows payment arrived without a transfer.
    assert!(!settlement.dispatched);
    assert_eq!(settlement.balance, 5);
    let order = uow.orders().get_one(&order.order_id).unwrap();
    assert_eq!(order.status, OrderStatus::Paid);
}

#[tokio::test]
async fn test_replies_are_recorded_as_messages() {
    let bot = bot();
    let uow = bot.store.begin().unwrap();
    let user = seed_user(&uow, 0);
    let msg = inbound_text(&uow, &user, "/help");

    bot.service
        .receive_and_process(&msg, &uow, &bot.messenger)
        .await
        .unwrap();

    let outbound = uow
        .messages()
        .get_all(
            &[("sent_by", rusqlite::types::Value::from("system".to_string()))],
            None,
        )
        .unwrap();
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].sent_by, SentBy::System);
    assert_eq!(
        outbound[0].response_to.as_deref(),
        Some(msg.message_id.as_str())
    );
}
