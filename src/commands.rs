//! Command parsing and the dispatch registry.
//!
//! Parsing is a pure function; it never validates the command. Whether a
//! token names a real handler is decided at dispatch time against the
//! registry, which is an explicit command-string -> handler-fn table built
//! once at startup.

use futures_util::future::BoxFuture;

use crate::db::UnitOfWork;
use crate::error::Result;
use crate::messengers::Messenger;
use crate::models::Message;
use crate::service::Service;

/// Sentinel command for free text without a leading `/token`.
pub const NO_COMMAND: &str = "_no_command";

/// Split text into `(command, body)`.
///
/// A leading `/token` (case-folded) is the command and the remainder the
/// body; the token may be terminated by any whitespace, including the
/// newline that starts a multi-line body like an address block. Without a
/// leading slash the command is [`NO_COMMAND`] and the whole text the body.
pub fn parse_command(text: &str) -> (String, String) {
    let text = text.trim();
    match text.strip_prefix('/') {
        Some(rest) => match rest.find(char::is_whitespace) {
            Some(idx) => (rest[..idx].to_lowercase(), rest[idx..].trim().to_string()),
            None => (rest.to_lowercase(), String::new()),
        },
        None => (NO_COMMAND.to_string(), text.to_string()),
    }
}

/// A registered command handler. Handlers get the normalized message, the
/// request's Unit of Work, and the adapter the message arrived through.
pub type HandlerFn = for<'a> fn(
    &'a Service,
    &'a Message,
    &'a UnitOfWork,
    &'a dyn Messenger,
) -> BoxFuture<'a, Result<()>>;

/// Command-string -> handler table.
#[derive(Default)]
pub struct CommandRegistry {
    entries: Vec<(&'static str, HandlerFn)>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &'static str, handler: HandlerFn) {
        debug_assert!(
            self.entries.iter().all(|(n, _)| *n != name),
            "duplicate command registration: {name}"
        );
        self.entries.push((name, handler));
    }

    pub fn get(&self, name: &str) -> Option<HandlerFn> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, h)| *h)
    }

    /// Registered names, used for fuzzy suggestions. Callback commands are
    /// excluded: suggesting `/send_callback` to a human is never right.
    pub fn suggestible(&self) -> Vec<&'static str> {
        self.entries
            .iter()
            .map(|(n, _)| *n)
            .filter(|n| !n.ends_with("_callback"))
            .collect()
    }
}
