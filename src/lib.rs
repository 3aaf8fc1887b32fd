//! voicepost
//!
//! A messaging-platform bot that turns voice memos into physical letters.
//! Users talk to it over WhatsApp or Telegram; it transcribes audio, drafts
//! letter text, lets the user edit/address/pay, and hands the finished
//! document to a print-and-mail provider.
//!
//! # Architecture
//!
//! ```text
//! webhook ──► Platform Adapter ──► normalized Message ──► Dispatch Engine
//!                (messengers/)         (models)              (service)
//!                                                               │
//!                        Repositories + Blob store ◄── Command Handler
//!                              (db, blob)                       │
//!                                                     Entity Lifecycle
//!                                                        (letters)
//! ```
//!
//! The conversation is stateless between requests: confirm/cancel flows are
//! resolved by following `response_to` pointers through the message log, not
//! by a session store.

pub mod blob;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod fuzzy;
pub mod integrations;
pub mod letters;
pub mod messengers;
pub mod models;
pub mod server;
pub mod service;
pub mod sysmsg;

#[cfg(test)]
mod service_tests;

pub use blob::{BlobKind, BlobStore};
pub use commands::{parse_command, CommandRegistry, NO_COMMAND};
pub use config::Config;
pub use db::{Dir, Repo, Store, UnitOfWork};
pub use error::{Error, Result};
pub use letters::LetterPipeline;
pub use messengers::{Messenger, Telegram, WhatsApp};
pub use models::{
    Address, Draft, File, Message, MessageKind, Order, OrderStatus, PaymentType, Platform,
    PlatformMeta, SentBy, User,
};
pub use service::Service;
pub use sysmsg::SystemMessages;
