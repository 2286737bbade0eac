pub mod schema;

use crate::error::{RepeaterError, Result};
use crate::models::{BlackList, Context, ContextDelta, GroupId, Message};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Durable side of the write-back cache.
///
/// Implementations must make `merge_contexts` an upsert-with-increment: a
/// delta for an unknown fingerprint creates the document, a delta for a known
/// one adds to it.
#[async_trait]
pub trait Store: Send + Sync {
    async fn load_contexts(&self) -> Result<Vec<Context>>;
    async fn load_blacklists(&self) -> Result<Vec<BlackList>>;
    /// Newest first.
    async fn load_recent_messages(&self, limit: usize) -> Result<Vec<Message>>;
    async fn append_messages(&self, messages: &[Message]) -> Result<()>;
    async fn merge_contexts(&self, deltas: &[ContextDelta]) -> Result<()>;
    async fn save_blacklists(&self, lists: &[BlackList]) -> Result<()>;
    async fn group_keywords(&self, group_id: GroupId, limit: usize) -> Result<Vec<String>>;
}

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

type ContextRow = (String, i64, i64, i64, String, String);

impl Database {
    /// Opens a SQLite file, creating parent directories. `:memory:` is accepted.
    pub fn open(database_url: &str) -> Result<Self> {
        if database_url != ":memory:" {
            if let Some(parent) = Path::new(database_url).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let conn = Connection::open(database_url)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Self::open(":memory:")?;
        db.execute_init()?;
        Ok(db)
    }

    pub fn execute_init(&self) -> Result<()> {
        info!("Database: Initializing schema...");
        let conn = self.conn()?;
        conn.execute_batch(schema::SCHEMA)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| RepeaterError::Poisoned)
    }

    /// Runs a synchronous database call on the blocking pool.
    pub async fn run_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    // --- Messages ---

    pub fn save_messages(&self, messages: &[Message]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO messages (group_id, user_id, bot_id, raw_message, is_plain_text, plain_text, keywords, time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for m in messages {
                stmt.execute(params![
                    m.group_id,
                    m.user_id,
                    m.bot_id,
                    m.raw_message,
                    m.is_plain_text,
                    m.plain_text,
                    m.keywords,
                    m.time,
                ])?;
            }
        }
        tx.commit()?;
        debug!("Database: Saved {} messages", messages.len());
        Ok(messages.len())
    }

    pub fn get_recent_messages(&self, limit: usize) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT group_id, user_id, bot_id, raw_message, is_plain_text, plain_text, keywords, time
             FROM messages ORDER BY time DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(Message {
                group_id: row.get(0)?,
                user_id: row.get(1)?,
                bot_id: row.get(2)?,
                raw_message: row.get(3)?,
                is_plain_text: row.get(4)?,
                plain_text: row.get(5)?,
                keywords: row.get(6)?,
                time: row.get(7)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn count_messages(&self) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?)
    }

    // --- Contexts ---

    pub fn get_context(&self, keywords: &str) -> Result<Option<Context>> {
        let conn = self.conn()?;
        read_context(&conn, keywords)
    }

    pub fn get_all_contexts(&self) -> Result<Vec<Context>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT keywords, time, count, clear_time, answers, bans FROM contexts ORDER BY count DESC",
        )?;
        let rows = stmt.query_map([], context_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(context_from_row(row?)?);
        }
        Ok(results)
    }

    /// Applies deltas in a single transaction.
    pub fn merge_context_deltas(&self, deltas: &[ContextDelta]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for delta in deltas {
            let mut context = read_context(&tx, &delta.keywords)?
                .unwrap_or_else(|| Context::new(&delta.keywords, delta.time));
            context.merge_delta(delta);

            tx.execute(
                "INSERT INTO contexts (keywords, time, count, clear_time, answers, bans)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(keywords) DO UPDATE SET
                    time = ?2, count = ?3, clear_time = ?4, answers = ?5, bans = ?6",
                params![
                    context.keywords,
                    context.time,
                    context.count,
                    context.clear_time,
                    serde_json::to_string(&context.answers)?,
                    serde_json::to_string(&context.ban)?,
                ],
            )?;

            if delta.cleared_at.is_some() {
                tx.execute(
                    "DELETE FROM context_answers WHERE keywords = ?1",
                    [&context.keywords],
                )?;
            }
            for answer in &context.answers {
                tx.execute(
                    "INSERT OR IGNORE INTO context_answers (group_id, keywords) VALUES (?1, ?2)",
                    params![answer.group_id, context.keywords],
                )?;
            }
        }
        tx.commit()?;
        debug!("Database: Merged {} context deltas", deltas.len());
        Ok(deltas.len())
    }

    pub fn get_group_keywords(&self, group_id: GroupId, limit: usize) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT a.keywords FROM context_answers a
             JOIN contexts c ON c.keywords = a.keywords
             WHERE a.group_id = ?1
             ORDER BY c.count DESC, a.keywords
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![group_id, limit as i64], |row| row.get(0))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // --- Blacklists ---

    pub fn get_blacklists(&self) -> Result<Vec<BlackList>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT group_id, answers, answers_reserve FROM blacklists")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, GroupId>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (group_id, answers, reserve) = row?;
            results.push(BlackList {
                group_id,
                answers: serde_json::from_str(&answers)?,
                answers_reserve: serde_json::from_str(&reserve)?,
            });
        }
        Ok(results)
    }

    pub fn save_blacklists(&self, lists: &[BlackList]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for list in lists {
            tx.execute(
                "INSERT INTO blacklists (group_id, answers, answers_reserve) VALUES (?1, ?2, ?3)
                 ON CONFLICT(group_id) DO UPDATE SET answers = ?2, answers_reserve = ?3",
                params![
                    list.group_id,
                    serde_json::to_string(&list.answers)?,
                    serde_json::to_string(&list.answers_reserve)?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn context_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContextRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn context_from_row(row: ContextRow) -> Result<Context> {
    let (keywords, time, count, clear_time, answers, bans) = row;
    Ok(Context {
        keywords,
        time,
        count,
        answers: serde_json::from_str(&answers)?,
        ban: serde_json::from_str(&bans)?,
        clear_time,
    })
}

fn read_context(conn: &Connection, keywords: &str) -> Result<Option<Context>> {
    let row = conn
        .query_row(
            "SELECT keywords, time, count, clear_time, answers, bans FROM contexts WHERE keywords = ?1",
            [keywords],
            context_row,
        )
        .optional()?;
    row.map(context_from_row).transpose()
}

#[async_trait]
impl Store for Database {
    async fn load_contexts(&self) -> Result<Vec<Context>> {
        self.run_blocking(|db| db.get_all_contexts()).await
    }

    async fn load_blacklists(&self) -> Result<Vec<BlackList>> {
        self.run_blocking(|db| db.get_blacklists()).await
    }

    async fn load_recent_messages(&self, limit: usize) -> Result<Vec<Message>> {
        self.run_blocking(move |db| db.get_recent_messages(limit)).await
    }

    async fn append_messages(&self, messages: &[Message]) -> Result<()> {
        let messages = messages.to_vec();
        self.run_blocking(move |db| db.save_messages(&messages).map(|_| ()))
            .await
    }

    async fn merge_contexts(&self, deltas: &[ContextDelta]) -> Result<()> {
        let deltas = deltas.to_vec();
        self.run_blocking(move |db| db.merge_context_deltas(&deltas).map(|_| ()))
            .await
    }

    async fn save_blacklists(&self, lists: &[BlackList]) -> Result<()> {
        let lists = lists.to_vec();
        self.run_blocking(move |db| db.save_blacklists(&lists)).await
    }

    async fn group_keywords(&self, group_id: GroupId, limit: usize) -> Result<Vec<String>> {
        self.run_blocking(move |db| db.get_group_keywords(group_id, limit))
            .await
    }
}
