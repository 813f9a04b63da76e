//! Durable per-conversation message ledger.
//!
//! Conversations are created once and never renamed. Messages are unique on
//! `(conversation_id, order_id)`, so appending the same entry twice is a no-op
//! that hands back the row already stored.

use crate::RecapError;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub conversation_id: String,
    pub text: String,
    pub is_from_me: bool,
    pub order_id: u64,
}

/// Result of `append_message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Appended {
    Inserted(Message),
    /// The `(conversation_id, order_id)` pair was already stored; nothing was written.
    Duplicate(Message),
}

impl Appended {
    pub fn message(&self) -> &Message {
        match self {
            Appended::Inserted(m) | Appended::Duplicate(m) => m,
        }
    }

    pub fn is_inserted(&self) -> bool {
        matches!(self, Appended::Inserted(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub conversations: i64,
    pub messages: i64,
    pub skipped: i64,
    pub summaries: i64,
}

pub trait Ledger {
    fn ensure_conversation(&self, id: &str, name: &str) -> Result<Conversation, RecapError>;

    fn append_message(
        &self,
        conversation_id: &str,
        text: &str,
        is_from_me: bool,
        order_id: u64,
    ) -> Result<Appended, RecapError>;

    /// All messages of a conversation, `order_id` ascending.
    fn messages_for(&self, conversation_id: &str) -> Result<Vec<Message>, RecapError>;

    /// Note a message entry that could not be decoded.
    fn record_skipped(
        &self,
        conversation_id: &str,
        order_id: Option<u64>,
        reason: &str,
    ) -> Result<(), RecapError>;

    fn record_summary(
        &self,
        conversation_id: &str,
        through_order_id: u64,
        message_count: usize,
        response: &str,
    ) -> Result<(), RecapError>;

    /// Run `f` in one transaction. Everything `f` wrote is rolled back if it fails.
    fn atomically(
        &self,
        f: &mut dyn FnMut(&dyn Ledger) -> Result<(), RecapError>,
    ) -> Result<(), RecapError>;

    fn stats(&self) -> Result<LedgerStats, RecapError>;
}

pub struct SqliteLedger {
    conn: Connection,
}

fn to_sql_order(order_id: u64) -> Result<i64, RecapError> {
    i64::try_from(order_id)
        .map_err(|_| RecapError::Ledger(format!("order id {order_id} out of range")))
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        text: row.get(2)?,
        is_from_me: row.get(3)?,
        order_id: row.get::<_, i64>(4)? as u64,
    })
}

impl SqliteLedger {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn open(db_path: &Path) -> Result<Self, RecapError> {
        Ok(Self::new(crate::db::open_db(db_path)?))
    }

    pub fn open_in_memory() -> Result<Self, RecapError> {
        Ok(Self::new(crate::db::open_db_in_memory()?))
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn conversation(&self, id: &str) -> Result<Option<Conversation>, RecapError> {
        let conv = self
            .conn
            .query_row(
                "SELECT id, name, created_at FROM conversations WHERE id = ?1",
                params![id],
                |r| {
                    Ok(Conversation {
                        id: r.get(0)?,
                        name: r.get(1)?,
                        created_at: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(conv)
    }

    fn message_at(&self, conversation_id: &str, order_id: i64) -> Result<Message, RecapError> {
        let msg = self.conn.query_row(
            "SELECT id, conversation_id, text, is_from_me, order_id FROM messages
             WHERE conversation_id = ?1 AND order_id = ?2",
            params![conversation_id, order_id],
            message_from_row,
        )?;
        Ok(msg)
    }
}

impl Ledger for SqliteLedger {
    fn ensure_conversation(&self, id: &str, name: &str) -> Result<Conversation, RecapError> {
        self.conn.execute(
            "INSERT INTO conversations (id, name) VALUES (?1, ?2) ON CONFLICT(id) DO NOTHING",
            params![id, name],
        )?;
        self.conversation(id)?
            .ok_or_else(|| RecapError::Ledger(format!("conversation {id} vanished after insert")))
    }

    fn append_message(
        &self,
        conversation_id: &str,
        text: &str,
        is_from_me: bool,
        order_id: u64,
    ) -> Result<Appended, RecapError> {
        let order = to_sql_order(order_id)?;
        let inserted = self.conn.execute(
            "INSERT INTO messages (conversation_id, text, is_from_me, order_id)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(conversation_id, order_id) DO NOTHING",
            params![conversation_id, text, is_from_me, order],
        )?;

        if inserted == 0 {
            return Ok(Appended::Duplicate(self.message_at(conversation_id, order)?));
        }

        Ok(Appended::Inserted(Message {
            id: self.conn.last_insert_rowid(),
            conversation_id: conversation_id.to_string(),
            text: text.to_string(),
            is_from_me,
            order_id,
        }))
    }

    fn messages_for(&self, conversation_id: &str) -> Result<Vec<Message>, RecapError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, conversation_id, text, is_from_me, order_id FROM messages
             WHERE conversation_id = ?1
             ORDER BY order_id ASC, id ASC",
        )?;
        let messages = stmt
            .query_map(params![conversation_id], message_from_row)?
            .collect::<Result<_, _>>()?;
        Ok(messages)
    }

    fn record_skipped(
        &self,
        conversation_id: &str,
        order_id: Option<u64>,
        reason: &str,
    ) -> Result<(), RecapError> {
        let order = order_id.map(to_sql_order).transpose()?;
        self.conn.execute(
            "INSERT OR IGNORE INTO skipped_messages (conversation_id, order_id, reason)
             VALUES (?1, ?2, ?3)",
            params![conversation_id, order, reason],
        )?;
        Ok(())
    }

    fn record_summary(
        &self,
        conversation_id: &str,
        through_order_id: u64,
        message_count: usize,
        response: &str,
    ) -> Result<(), RecapError> {
        self.conn.execute(
            "INSERT INTO summaries (conversation_id, through_order_id, message_count, response)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                conversation_id,
                to_sql_order(through_order_id)?,
                message_count as i64,
                response
            ],
        )?;
        Ok(())
    }

    fn atomically(
        &self,
        f: &mut dyn FnMut(&dyn Ledger) -> Result<(), RecapError>,
    ) -> Result<(), RecapError> {
        // Dropping the transaction without commit rolls it back.
        let tx = self.conn.unchecked_transaction()?;
        f(self)?;
        tx.commit()?;
        Ok(())
    }

    fn stats(&self) -> Result<LedgerStats, RecapError> {
        let count = |table: &str| -> Result<i64, RecapError> {
            Ok(self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?)
        };
        Ok(LedgerStats {
            conversations: count("conversations")?,
            messages: count("messages")?,
            skipped: count("skipped_messages")?,
            summaries: count("summaries")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JID: &str = "5511999999999@s.whatsapp.net";

    fn ledger() -> SqliteLedger {
        SqliteLedger::open_in_memory().unwrap()
    }

    #[test]
    fn ensure_conversation_is_idempotent_and_first_name_wins() {
        let ledger = ledger();
        let first = ledger.ensure_conversation(JID, "Ana").unwrap();
        let second = ledger.ensure_conversation(JID, "Ana Maria").unwrap();

        assert_eq!(first, second);
        assert_eq!(second.name, "Ana");
        assert_eq!(ledger.stats().unwrap().conversations, 1);
    }

    #[test]
    fn messages_come_back_sorted_by_order_id() {
        let ledger = ledger();
        ledger.ensure_conversation(JID, "").unwrap();
        for (order, text) in [(3, "c"), (1, "a"), (2, "b")] {
            ledger.append_message(JID, text, false, order).unwrap();
        }

        let messages = ledger.messages_for(JID).unwrap();
        let orders: Vec<u64> = messages.iter().map(|m| m.order_id).collect();
        let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert_eq!(texts, vec!["a", "b", "c"]);
    }

    #[test]
    fn duplicate_append_returns_stored_row() {
        let ledger = ledger();
        ledger.ensure_conversation(JID, "").unwrap();

        let first = ledger.append_message(JID, "hi", true, 1).unwrap();
        let again = ledger.append_message(JID, "hi (edited)", true, 1).unwrap();

        assert!(first.is_inserted());
        assert!(!again.is_inserted());
        assert_eq!(again.message(), first.message());
        assert_eq!(ledger.messages_for(JID).unwrap().len(), 1);
    }

    #[test]
    fn append_to_unknown_conversation_fails() {
        let ledger = ledger();
        let err = ledger.append_message("nobody@s.whatsapp.net", "hi", true, 1);
        assert!(matches!(err, Err(RecapError::Database(_))));
    }

    #[test]
    fn messages_for_unknown_conversation_is_empty() {
        let ledger = ledger();
        assert!(ledger.messages_for(JID).unwrap().is_empty());
    }

    #[test]
    fn atomically_rolls_back_on_error() {
        let ledger = ledger();
        let result = ledger.atomically(&mut |l| {
            l.ensure_conversation(JID, "Ana")?;
            l.append_message(JID, "hi", true, 1)?;
            Err(RecapError::Ledger("boom".into()))
        });

        assert!(result.is_err());
        assert_eq!(ledger.stats().unwrap(), LedgerStats::default());
    }

    #[test]
    fn atomically_commits_on_success() {
        let ledger = ledger();
        ledger
            .atomically(&mut |l| {
                l.ensure_conversation(JID, "Ana")?;
                l.append_message(JID, "hi", true, 1)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(ledger.messages_for(JID).unwrap().len(), 1);
    }

    #[test]
    fn skipped_entries_are_recorded_once() {
        let ledger = ledger();
        ledger.ensure_conversation(JID, "").unwrap();
        ledger.record_skipped(JID, Some(4), "unsupported content: image").unwrap();
        ledger.record_skipped(JID, Some(4), "unsupported content: image").unwrap();
        assert_eq!(ledger.stats().unwrap().skipped, 1);
    }

    #[test]
    fn skipped_entries_without_order_id_are_recorded_once() {
        let ledger = ledger();
        ledger.ensure_conversation(JID, "").unwrap();
        for _ in 0..3 {
            ledger.record_skipped(JID, None, "missing order id").unwrap();
        }
        ledger.record_skipped(JID, None, "invalid order id: \"7\"").unwrap();
        assert_eq!(ledger.stats().unwrap().skipped, 2);
    }

    #[test]
    fn unrepresentable_order_id_is_a_ledger_error() {
        let ledger = ledger();
        ledger.ensure_conversation(JID, "").unwrap();
        let err = ledger.append_message(JID, "big", true, u64::MAX).unwrap_err();
        assert!(matches!(err, RecapError::Ledger(_)));
        assert!(err.to_string().starts_with("ledger: order id"));
    }

    #[test]
    fn summaries_are_stored() {
        let ledger = ledger();
        ledger.ensure_conversation(JID, "").unwrap();
        ledger.record_summary(JID, 12, 12, "They talked about lunch.").unwrap();

        let response: String = ledger
            .connection()
            .query_row(
                "SELECT response FROM summaries WHERE conversation_id = ?1",
                params![JID],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(response, "They talked about lunch.");
    }
}
