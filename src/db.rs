//! SQLite persistence: schema, generic repositories, and the per-request
//! Unit of Work.
//!
//! Each webhook request opens one [`UnitOfWork`] (its own connection plus the
//! blob-store and message-catalog handles) and drops it at the end of the
//! request. There is no cross-store transaction: relational writes and blob
//! uploads are separate operations, and an orphaned blob after a crash is
//! acceptable because nothing references it.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};

use crate::blob::BlobStore;
use crate::error::{Error, Result};
use crate::models::{
    Address, Draft, File, Message, MessageKind, Order, OrderStatus, PaymentType, Platform,
    PlatformMeta, SentBy, User,
};
use crate::sysmsg::SystemMessages;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    user_id         TEXT PRIMARY KEY,
    created_at      TEXT NOT NULL,
    first_name      TEXT,
    last_name       TEXT,
    email           TEXT UNIQUE,
    phone_number    TEXT UNIQUE,
    telegram_id     TEXT UNIQUE,
    letter_credits  INTEGER NOT NULL DEFAULT 0,
    prompt          TEXT
);

CREATE TABLE IF NOT EXISTS messages (
    message_id       TEXT PRIMARY KEY,
    user_id          TEXT NOT NULL REFERENCES users(user_id),
    platform         TEXT NOT NULL,
    sent_by          TEXT NOT NULL,
    kind             TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    body             TEXT,
    command          TEXT,
    transcript       TEXT,
    memo_duration    REAL,
    attachment_mime  TEXT,
    draft_referenced TEXT,
    order_referenced TEXT,
    response_to      TEXT REFERENCES messages(message_id),
    action_confirmed INTEGER,
    platform_msg_id  TEXT,
    platform_meta    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_user ON messages(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_platform_msg_id ON messages(platform_msg_id);

CREATE TABLE IF NOT EXISTS files (
    file_id    TEXT PRIMARY KEY,
    message_id TEXT NOT NULL REFERENCES messages(message_id),
    mime_type  TEXT NOT NULL,
    blob_path  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_files_message ON files(message_id);

CREATE TABLE IF NOT EXISTS addresses (
    address_id  TEXT PRIMARY KEY,
    user_id     TEXT NOT NULL REFERENCES users(user_id),
    created_at  TEXT NOT NULL,
    addressee   TEXT NOT NULL,
    line1       TEXT NOT NULL,
    line2       TEXT,
    postal_code TEXT NOT NULL,
    city        TEXT NOT NULL,
    country     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_addresses_user ON addresses(user_id, created_at);

CREATE TABLE IF NOT EXISTS drafts (
    draft_id   TEXT PRIMARY KEY,
    user_id    TEXT NOT NULL REFERENCES users(user_id),
    created_at TEXT NOT NULL,
    text       TEXT NOT NULL,
    blob_path  TEXT NOT NULL,
    address_id TEXT,
    builds_on  TEXT REFERENCES drafts(draft_id)
);
CREATE INDEX IF NOT EXISTS idx_drafts_user ON drafts(user_id, created_at);

CREATE TABLE IF NOT EXISTS orders (
    order_id     TEXT PRIMARY KEY,
    user_id      TEXT NOT NULL REFERENCES users(user_id),
    draft_id     TEXT NOT NULL REFERENCES drafts(draft_id),
    address_id   TEXT NOT NULL,
    message_id   TEXT NOT NULL REFERENCES messages(message_id),
    created_at   TEXT NOT NULL,
    status       TEXT NOT NULL,
    payment_type TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id, created_at);

CREATE TABLE IF NOT EXISTS webhook_events (
    event_id    TEXT PRIMARY KEY,
    received_at TEXT NOT NULL
);
"#;

/// Sort direction for `get_all`.
#[derive(Debug, Clone, Copy)]
pub enum Dir {
    Asc,
    Desc,
}

impl Dir {
    fn sql(self) -> &'static str {
        match self {
            Dir::Asc => "ASC",
            Dir::Desc => "DESC",
        }
    }
}

/// Equality filter: column name and value.
pub type Filter = (&'static str, Value);

/// Maps a domain record to its table.
pub trait Record: Sized {
    const TABLE: &'static str;
    const ID_COL: &'static str;
    const COLUMNS: &'static [&'static str];

    fn id(&self) -> &str;
    /// Values in `COLUMNS` order.
    fn to_params(&self) -> Vec<Value>;
    /// Row mapped in `COLUMNS` order.
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self>;
}

fn parse_col<T>(idx: usize, raw: &str, parsed: Option<T>) -> rusqlite::Result<T> {
    parsed.ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unexpected value '{raw}'").into(),
        )
    })
}

impl Record for User {
    const TABLE: &'static str = "users";
    const ID_COL: &'static str = "user_id";
    const COLUMNS: &'static [&'static str] = &[
        "user_id",
        "created_at",
        "first_name",
        "last_name",
        "email",
        "phone_number",
        "telegram_id",
        "letter_credits",
        "prompt",
    ];

    fn id(&self) -> &str {
        &self.user_id
    }

    fn to_params(&self) -> Vec<Value> {
        vec![
            Value::from(self.user_id.clone()),
            Value::from(self.created_at.clone()),
            Value::from(self.first_name.clone()),
            Value::from(self.last_name.clone()),
            Value::from(self.email.clone()),
            Value::from(self.phone_number.clone()),
            Value::from(self.telegram_id.clone()),
            Value::from(self.letter_credits),
            Value::from(self.prompt.clone()),
        ]
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(User {
            user_id: row.get(0)?,
            created_at: row.get(1)?,
            first_name: row.get(2)?,
            last_name: row.get(3)?,
            email: row.get(4)?,
            phone_number: row.get(5)?,
            telegram_id: row.get(6)?,
            letter_credits: row.get(7)?,
            prompt: row.get(8)?,
        })
    }
}

impl Record for Message {
    const TABLE: &'static str = "messages";
    const ID_COL: &'static str = "message_id";
    const COLUMNS: &'static [&'static str] = &[
        "message_id",
        "user_id",
        "platform",
        "sent_by",
        "kind",
        "created_at",
        "body",
        "command",
        "transcript",
        "memo_duration",
        "attachment_mime",
        "draft_referenced",
        "order_referenced",
        "response_to",
        "action_confirmed",
        "platform_msg_id",
        "platform_meta",
    ];

    fn id(&self) -> &str {
        &self.message_id
    }

    fn to_params(&self) -> Vec<Value> {
        vec![
            Value::from(self.message_id.clone()),
            Value::from(self.user_id.clone()),
            Value::from(self.platform.as_str().to_string()),
            Value::from(self.sent_by.as_str().to_string()),
            Value::from(self.kind.as_str().to_string()),
            Value::from(self.created_at.clone()),
            Value::from(self.body.clone()),
            Value::from(self.command.clone()),
            Value::from(self.transcript.clone()),
            Value::from(self.memo_duration),
            Value::from(self.attachment_mime.clone()),
            Value::from(self.draft_referenced.clone()),
            Value::from(self.order_referenced.clone()),
            Value::from(self.response_to.clone()),
            Value::from(self.action_confirmed.map(i64::from)),
            Value::from(self.platform_msg_id.clone()),
            Value::from(serde_json::to_string(&self.meta).unwrap_or_default()),
        ]
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let platform: String = row.get(2)?;
        let sent_by: String = row.get(3)?;
        let kind: String = row.get(4)?;
        let meta_json: String = row.get(16)?;
        let meta: PlatformMeta = serde_json::from_str(&meta_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(16, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(Message {
            message_id: row.get(0)?,
            user_id: row.get(1)?,
            platform: parse_col(2, &platform, Platform::parse(&platform))?,
            sent_by: parse_col(3, &sent_by, SentBy::parse(&sent_by))?,
            kind: parse_col(4, &kind, MessageKind::parse(&kind))?,
            created_at: row.get(5)?,
            body: row.get(6)?,
            command: row.get(7)?,
            transcript: row.get(8)?,
            memo_duration: row.get(9)?,
            attachment_mime: row.get(10)?,
            draft_referenced: row.get(11)?,
            order_referenced: row.get(12)?,
            response_to: row.get(13)?,
            action_confirmed: row.get::<_, Option<i64>>(14)?.map(|v| v != 0),
            platform_msg_id: row.get(15)?,
            meta,
        })
    }
}

impl Record for File {
    const TABLE: &'static str = "files";
    const ID_COL: &'static str = "file_id";
    const COLUMNS: &'static [&'static str] = &["file_id", "message_id", "mime_type", "blob_path"];

    fn id(&self) -> &str {
        &self.file_id
    }

    fn to_params(&self) -> Vec<Value> {
        vec![
            Value::from(self.file_id.clone()),
            Value::from(self.message_id.clone()),
            Value::from(self.mime_type.clone()),
            Value::from(self.blob_path.clone()),
        ]
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(File {
            file_id: row.get(0)?,
            message_id: row.get(1)?,
            mime_type: row.get(2)?,
            blob_path: row.get(3)?,
        })
    }
}

impl Record for Address {
    const TABLE: &'static str = "addresses";
    const ID_COL: &'static str = "address_id";
    const COLUMNS: &'static [&'static str] = &[
        "address_id",
        "user_id",
        "created_at",
        "addressee",
        "line1",
        "line2",
        "postal_code",
        "city",
        "country",
    ];

    fn id(&self) -> &str {
        &self.address_id
    }

    fn to_params(&self) -> Vec<Value> {
        vec![
            Value::from(self.address_id.clone()),
            Value::from(self.user_id.clone()),
            Value::from(self.created_at.clone()),
            Value::from(self.addressee.clone()),
            Value::from(self.line1.clone()),
            Value::from(self.line2.clone()),
            Value::from(self.postal_code.clone()),
            Value::from(self.city.clone()),
            Value::from(self.country.clone()),
        ]
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Address {
            address_id: row.get(0)?,
            user_id: row.get(1)?,
            created_at: row.get(2)?,
            addressee: row.get(3)?,
            line1: row.get(4)?,
            line2: row.get(5)?,
            postal_code: row.get(6)?,
            city: row.get(7)?,
            country: row.get(8)?,
        })
    }
}

impl Record for Draft {
    const TABLE: &'static str = "drafts";
    const ID_COL: &'static str = "draft_id";
    const COLUMNS: &'static [&'static str] = &[
        "draft_id",
        "user_id",
        "created_at",
        "text",
        "blob_path",
        "address_id",
        "builds_on",
    ];

    fn id(&self) -> &str {
        &self.draft_id
    }

    fn to_params(&self) -> Vec<Value> {
        vec![
            Value::from(self.draft_id.clone()),
            Value::from(self.user_id.clone()),
            Value::from(self.created_at.clone()),
            Value::from(self.text.clone()),
            Value::from(self.blob_path.clone()),
            Value::from(self.address_id.clone()),
            Value::from(self.builds_on.clone()),
        ]
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Draft {
            draft_id: row.get(0)?,
            user_id: row.get(1)?,
            created_at: row.get(2)?,
            text: row.get(3)?,
            blob_path: row.get(4)?,
            address_id: row.get(5)?,
            builds_on: row.get(6)?,
        })
    }
}

impl Record for Order {
    const TABLE: &'static str = "orders";
    const ID_COL: &'static str = "order_id";
    const COLUMNS: &'static [&'static str] = &[
        "order_id",
        "user_id",
        "draft_id",
        "address_id",
        "message_id",
        "created_at",
        "status",
        "payment_type",
    ];

    fn id(&self) -> &str {
        &self.order_id
    }

    fn to_params(&self) -> Vec<Value> {
        vec![
            Value::from(self.order_id.clone()),
            Value::from(self.user_id.clone()),
            Value::from(self.draft_id.clone()),
            Value::from(self.address_id.clone()),
            Value::from(self.message_id.clone()),
            Value::from(self.created_at.clone()),
            Value::from(self.status.as_str().to_string()),
            Value::from(self.payment_type.as_str().to_string()),
        ]
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(6)?;
        let payment_type: String = row.get(7)?;
        Ok(Order {
            order_id: row.get(0)?,
            user_id: row.get(1)?,
            draft_id: row.get(2)?,
            address_id: row.get(3)?,
            message_id: row.get(4)?,
            created_at: row.get(5)?,
            status: parse_col(6, &status, OrderStatus::parse(&status))?,
            payment_type: parse_col(7, &payment_type, PaymentType::parse(&payment_type))?,
        })
    }
}

fn map_db_err(err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(e, msg)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::DuplicateEntry(msg.clone().unwrap_or_else(|| "constraint violation".into()))
        }
        _ => Error::Db(err),
    }
}

/// Handler futures hold `&UnitOfWork` across await points, so the connection
/// sits behind a mutex (requests are sequential within one Unit of Work; the
/// lock is never contended, it only provides `Sync`).
fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Typed access to one table through a borrowed connection.
pub struct Repo<'c, T: Record> {
    conn: &'c Mutex<Connection>,
    _marker: PhantomData<T>,
}

impl<'c, T: Record> Repo<'c, T> {
    fn new(conn: &'c Mutex<Connection>) -> Self {
        Self {
            conn,
            _marker: PhantomData,
        }
    }

    pub fn add(&self, entity: &T) -> Result<()> {
        let placeholders = (1..=T::COLUMNS.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            T::TABLE,
            T::COLUMNS.join(", "),
            placeholders
        );
        lock(self.conn)
            .execute(&sql, params_from_iter(entity.to_params()))
            .map_err(map_db_err)?;
        Ok(())
    }

    pub fn get_one(&self, id: &str) -> Result<T> {
        self.maybe_get_one(id)?
            .ok_or_else(|| Error::NotFound(format!("{} {id}", T::TABLE)))
    }

    pub fn maybe_get_one(&self, id: &str) -> Result<Option<T>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1",
            T::COLUMNS.join(", "),
            T::TABLE,
            T::ID_COL
        );
        let conn = lock(self.conn);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![id], |row| T::from_row(row))?;
        rows.next().transpose().map_err(Error::Db)
    }

    /// First match for the given filters, or `None`.
    pub fn find_one(&self, filters: &[Filter]) -> Result<Option<T>> {
        Ok(self.get_all(filters, None)?.into_iter().next())
    }

    pub fn get_all(&self, filters: &[Filter], order: Option<(&str, Dir)>) -> Result<Vec<T>> {
        let mut sql = format!("SELECT {} FROM {}", T::COLUMNS.join(", "), T::TABLE);
        if !filters.is_empty() {
            let clauses = filters
                .iter()
                .enumerate()
                .map(|(i, (col, _))| format!("{} = ?{}", col, i + 1))
                .collect::<Vec<_>>()
                .join(" AND ");
            sql.push_str(" WHERE ");
            sql.push_str(&clauses);
        }
        if let Some((col, dir)) = order {
            sql.push_str(&format!(" ORDER BY {} {}", col, dir.sql()));
        }
        let conn = lock(self.conn);
        let mut stmt = conn.prepare(&sql)?;
        let values = filters.iter().map(|(_, v)| v.clone());
        let rows = stmt.query_map(params_from_iter(values), |row| T::from_row(row))?;
        rows.collect::<rusqlite::Result<Vec<T>>>().map_err(Error::Db)
    }

    pub fn update(&self, entity: &T) -> Result<()> {
        let assignments = T::COLUMNS
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{} = ?{}", col, i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            T::TABLE,
            assignments,
            T::ID_COL,
            T::COLUMNS.len() + 1
        );
        let mut values = entity.to_params();
        values.push(Value::from(entity.id().to_string()));
        let changed = lock(self.conn)
            .execute(&sql, params_from_iter(values))
            .map_err(map_db_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("{} {}", T::TABLE, entity.id())));
        }
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE {} = ?1", T::TABLE, T::ID_COL);
        let changed = lock(self.conn).execute(&sql, params![id])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("{} {id}", T::TABLE)));
        }
        Ok(())
    }
}

/// Connection factory. Opens the database once at startup to apply the
/// schema, then hands out one connection per request via [`Store::begin`].
#[derive(Clone)]
pub struct Store {
    db_path: PathBuf,
    blob_root: PathBuf,
    sys: SystemMessages,
}

impl Store {
    pub fn open(db_path: &Path, blob_root: &Path, sys: SystemMessages) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!("database ready at {}", db_path.display());
        Ok(Self {
            db_path: db_path.to_path_buf(),
            blob_root: blob_root.to_path_buf(),
            sys,
        })
    }

    /// Open a Unit of Work for one request.
    pub fn begin(&self) -> Result<UnitOfWork> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(UnitOfWork {
            conn: Mutex::new(conn),
            blobs: BlobStore::new(&self.blob_root),
            sys: self.sys.clone(),
        })
    }
}

/// Scoped bundle of repository and blob-store handles for one request.
pub struct UnitOfWork {
    conn: Mutex<Connection>,
    pub blobs: BlobStore,
    pub sys: SystemMessages,
}

impl UnitOfWork {
    pub fn users(&self) -> Repo<'_, User> {
        Repo::new(&self.conn)
    }

    pub fn messages(&self) -> Repo<'_, Message> {
        Repo::new(&self.conn)
    }

    pub fn files(&self) -> Repo<'_, File> {
        Repo::new(&self.conn)
    }

    pub fn addresses(&self) -> Repo<'_, Address> {
        Repo::new(&self.conn)
    }

    pub fn drafts(&self) -> Repo<'_, Draft> {
        Repo::new(&self.conn)
    }

    pub fn orders(&self) -> Repo<'_, Order> {
        Repo::new(&self.conn)
    }

    /// User's address book in insertion order.
    pub fn address_book(&self, user_id: &str) -> Result<Vec<Address>> {
        self.addresses().get_all(
            &[("user_id", Value::from(user_id.to_string()))],
            Some(("created_at", Dir::Asc)),
        )
    }

    /// Most recently created draft for a user. The builds-on chain is
    /// informational; latest-by-creation wins for "continue editing".
    pub fn latest_draft(&self, user_id: &str) -> Result<Option<Draft>> {
        Ok(self
            .drafts()
            .get_all(
                &[("user_id", Value::from(user_id.to_string()))],
                Some(("created_at", Dir::Desc)),
            )?
            .into_iter()
            .next())
    }

    /// Record an external callback's idempotency key. Returns `false` when
    /// the event was already seen, in which case the caller acknowledges the
    /// delivery as a no-op.
    pub fn record_webhook_event(&self, event_id: &str) -> Result<bool> {
        let inserted = lock(&self.conn).execute(
            "INSERT OR IGNORE INTO webhook_events (event_id, received_at) VALUES (?1, ?2)",
            params![event_id, crate::models::now_ts()],
        )?;
        Ok(inserted > 0)
    }

    /// Conditional transition to `transferred`. Returns `true` only for the
    /// call that actually performed the transition, so dispatch side effects
    /// run at most once per order.
    pub fn mark_order_transferred(&self, order_id: &str) -> Result<bool> {
        let changed = lock(&self.conn).execute(
            "UPDATE orders SET status = 'transferred'
             WHERE order_id = ?1 AND status != 'transferred'",
            params![order_id],
        )?;
        Ok(changed > 0)
    }

    /// Apply a credit delta and return the new balance.
    pub fn adjust_credits(&self, user_id: &str, delta: i64) -> Result<i64> {
        let conn = lock(&self.conn);
        let changed = conn.execute(
            "UPDATE users SET letter_credits = letter_credits + ?1 WHERE user_id = ?2",
            params![delta, user_id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("users {user_id}")));
        }
        let balance = conn.query_row(
            "SELECT letter_credits FROM users WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(balance)
    }
}
