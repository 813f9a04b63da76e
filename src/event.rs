//! Events delivered by the messaging protocol client.
//!
//! Frames are JSON objects tagged by `type`. Only `history_sync` carries data
//! the ledger cares about; the rest are lifecycle noise.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    HistorySync(HistorySync),
    Connected,
    PairSuccess {
        id: String,
    },
    Message {
        chat: String,
    },
    #[serde(other)]
    Other,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::HistorySync(_) => "history_sync",
            Event::Connected => "connected",
            Event::PairSuccess { .. } => "pair_success",
            Event::Message { .. } => "message",
            Event::Other => "other",
        }
    }
}

/// One bulk delivery of prior conversations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySync {
    #[serde(default)]
    pub conversations: Vec<SyncConversation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConversation {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub messages: Vec<SyncMessage>,
}

/// A message entry as the service sends it. Fields stay raw JSON so a badly
/// typed entry is skipped on its own instead of failing the whole frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    #[serde(default)]
    pub order_id: Value,
    #[serde(default)]
    pub from_me: Value,
    #[serde(default)]
    pub content: Value,
}

impl SyncMessage {
    /// Plain text message (`{"conversation": text}`).
    pub fn text(order_id: u64, from_me: bool, text: &str) -> Self {
        Self {
            order_id: Value::from(order_id),
            from_me: Value::Bool(from_me),
            content: serde_json::json!({ "conversation": text }),
        }
    }
}
