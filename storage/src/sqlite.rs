use std::path::Path;

use log::{debug, info};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::{Message, MessageFilter, PreparedMessage, StoreError};

const CREATE_MESSAGES_SQL: &str = "
CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    msg_id TEXT UNIQUE,
    sender TEXT,
    recipient TEXT,
    payload TEXT,
    ts REAL,
    original_ts REAL,
    corrected_ts REAL,
    receive_ts REAL,
    correction_metadata TEXT
);
";

const CREATE_RAFT_SQL: &str = "
CREATE TABLE IF NOT EXISTS raft_state (
    id INTEGER PRIMARY KEY CHECK (id=1),
    current_term INTEGER NOT NULL,
    voted_for TEXT
);
";

const UPSERT_RAFT_SQL: &str = "
INSERT INTO raft_state (id, current_term, voted_for)
VALUES (1, ?1, ?2)
ON CONFLICT(id) DO UPDATE SET current_term=excluded.current_term, voted_for=excluded.voted_for;
";

const SELECT_RAFT_SQL: &str = "SELECT current_term, voted_for FROM raft_state WHERE id=1;";

const INSERT_MSG_SQL: &str = "
INSERT OR IGNORE INTO messages
    (msg_id, sender, recipient, payload, ts, original_ts, corrected_ts, receive_ts, correction_metadata)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9);
";

const MESSAGE_COLUMNS: &str =
    "seq, msg_id, sender, recipient, payload, ts, original_ts, corrected_ts, receive_ts, correction_metadata";

const CREATE_INDEX_SQL: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_messages_recipient ON messages(recipient, corrected_ts);",
    "CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender, corrected_ts);",
];

/// Columns added after the first schema revision; older databases are
/// upgraded in place when opened.
const EXTENDED_COLUMNS: &[(&str, &str, &str)] = &[
    ("original_ts", "REAL", "0"),
    ("corrected_ts", "REAL", "0"),
    ("receive_ts", "REAL", "0"),
    ("correction_metadata", "TEXT", "'{}'"),
];

/// The durable log: an append-only message table keyed by a dense `seq`,
/// deduplicated by `msg_id`, plus the persisted consensus term state.
///
/// The commit index itself is volatile. Reopening a store treats every
/// durable row as committed, which is exactly the recovery path: a restarted
/// node re-converges through catch-up sync and consensus from there.
pub struct LogStore {
    conn: Connection,
    committed_seq: u64,
}

impl LogStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!("opened message log at {}", path.display());
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    pub fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(CREATE_MESSAGES_SQL)?;
        conn.execute_batch(CREATE_RAFT_SQL)?;
        Self::ensure_extended_schema(&conn)?;
        for statement in CREATE_INDEX_SQL {
            conn.execute_batch(statement)?;
        }
        let mut store = LogStore {
            conn,
            committed_seq: 0,
        };
        store.committed_seq = store.max_seq()?;
        Ok(store)
    }

    /// Add the timestamp/metadata columns to databases created before they
    /// existed.
    fn ensure_extended_schema(conn: &Connection) -> Result<(), StoreError> {
        let mut stmt = conn.prepare("PRAGMA table_info(messages);")?;
        let existing = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<String>, _>>()?;
        for (name, column_type, default) in EXTENDED_COLUMNS {
            if !existing.iter().any(|column| column == name) {
                debug!("upgrading schema: adding column {}", name);
                conn.execute_batch(&format!(
                    "ALTER TABLE messages ADD COLUMN {} {} DEFAULT {};",
                    name, column_type, default
                ))?;
            }
        }
        Ok(())
    }

    /// Load the persisted term state, initializing the row on first start.
    pub fn load_term_state(&mut self) -> Result<(u64, Option<String>), StoreError> {
        let row = self
            .conn
            .query_row(SELECT_RAFT_SQL, [], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .optional()?;
        match row {
            Some((term, voted_for)) => Ok((term.max(0) as u64, voted_for)),
            None => {
                self.save_term_state(0, None)?;
                Ok((0, None))
            }
        }
    }

    pub fn save_term_state(
        &mut self,
        current_term: u64,
        voted_for: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(UPSERT_RAFT_SQL, params![current_term as i64, voted_for])?;
        Ok(())
    }

    /// Upsert by `msg_id`. Returns the stored row and whether it was newly
    /// inserted; a duplicate returns the existing row unchanged.
    pub fn insert(&mut self, prepared: &PreparedMessage) -> Result<(Message, bool), StoreError> {
        let changed = self.conn.execute(
            INSERT_MSG_SQL,
            params![
                prepared.msg_id,
                prepared.sender,
                prepared.recipient,
                prepared.payload,
                prepared.ts,
                prepared.original_ts,
                prepared.corrected_ts,
                prepared.receive_ts,
                prepared.correction_metadata.to_string(),
            ],
        )?;
        let message = self.conn.query_row(
            &format!(
                "SELECT {} FROM messages WHERE msg_id = ?1;",
                MESSAGE_COLUMNS
            ),
            params![prepared.msg_id],
            row_to_message,
        )?;
        Ok((message, changed > 0))
    }

    /// All entries after `seq`, unbounded; the catch-up sync payload.
    pub fn messages_since(&mut self, seq: u64) -> Result<Vec<Message>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM messages WHERE seq > ?1 ORDER BY seq ASC;",
            MESSAGE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![seq as i64], row_to_message)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Entries after `seq`, capped at the commit index and bounded by
    /// `limit`; used for consensus append batching.
    pub fn log_entries_since(
        &mut self,
        seq: u64,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM messages WHERE seq > ?1 AND seq <= ?2 ORDER BY seq ASC LIMIT ?3;",
            MESSAGE_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![seq as i64, self.committed_seq as i64, limit as i64],
            row_to_message,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Committed entries matching `filter`, ascending by `seq`.
    pub fn committed_messages(
        &mut self,
        filter: &MessageFilter,
    ) -> Result<Vec<Message>, StoreError> {
        let mut clauses = vec!["seq <= ?".to_owned()];
        let mut values: Vec<SqlValue> = vec![SqlValue::Integer(self.committed_seq as i64)];

        if let Some(after_seq) = filter.after_seq {
            clauses.push("seq > ?".to_owned());
            values.push(SqlValue::Integer(after_seq as i64));
        }
        if let Some(sender) = &filter.sender {
            clauses.push("sender = ?".to_owned());
            values.push(SqlValue::Text(sender.clone()));
        }
        if let Some(recipient) = &filter.recipient {
            clauses.push("recipient = ?".to_owned());
            values.push(SqlValue::Text(recipient.clone()));
        }

        let mut query = format!(
            "SELECT {} FROM messages WHERE {} ORDER BY seq ASC",
            MESSAGE_COLUMNS,
            clauses.join(" AND ")
        );
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            values.push(SqlValue::Integer(limit as i64));
        }

        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), row_to_message)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn max_seq(&mut self) -> Result<u64, StoreError> {
        let max: i64 = self
            .conn
            .query_row("SELECT IFNULL(MAX(seq), 0) FROM messages;", [], |row| {
                row.get(0)
            })?;
        Ok(max.max(0) as u64)
    }

    /// Raise the commit index to `seq`. Lowering it is a no-op.
    pub fn commit(&mut self, seq: u64) {
        if seq > self.committed_seq {
            self.committed_seq = seq;
        }
    }

    pub fn committed_seq(&self) -> u64 {
        self.committed_seq
    }
}

impl raft::Store for LogStore {
    type Entry = Message;
    type Error = StoreError;

    fn max_seq(&mut self) -> Result<u64, StoreError> {
        LogStore::max_seq(self)
    }

    fn commit_index(&self) -> u64 {
        self.committed_seq
    }

    fn apply(&mut self, entry: &Message) -> Result<(u64, bool), StoreError> {
        let (stored, inserted) = self.insert(&PreparedMessage::from(entry))?;
        Ok((stored.seq, inserted))
    }

    fn commit(&mut self, seq: u64) -> Result<(), StoreError> {
        LogStore::commit(self, seq);
        Ok(())
    }

    fn save_term_state(
        &mut self,
        current_term: u64,
        voted_for: Option<&str>,
    ) -> Result<(), StoreError> {
        LogStore::save_term_state(self, current_term, voted_for)
    }
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let metadata: Option<String> = row.get(9)?;
    let correction_metadata = metadata
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
    Ok(Message {
        seq: row.get::<_, i64>(0)?.max(0) as u64,
        msg_id: row.get(1)?,
        sender: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        recipient: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        payload: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        ts: row.get::<_, Option<f64>>(5)?.unwrap_or_default(),
        original_ts: row.get::<_, Option<f64>>(6)?.unwrap_or_default(),
        corrected_ts: row.get::<_, Option<f64>>(7)?.unwrap_or_default(),
        receive_ts: row.get::<_, Option<f64>>(8)?.unwrap_or_default(),
        correction_metadata,
    })
}
