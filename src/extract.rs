use crate::event::SyncMessage;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub order_id: u64,
    pub text: String,
    pub is_from_me: bool,
}

/// Why a message entry was skipped. `order_id` is set only when the entry's
/// own order id decoded cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    pub order_id: Option<u64>,
    pub reason: String,
}

/// Order ids are stored as SQLite integers, so they must fit in an i64.
pub fn decode_order_id(raw: &Value) -> Result<u64, String> {
    match raw {
        Value::Null => Err("missing order id".into()),
        Value::Number(n) => match n.as_u64() {
            Some(id) if i64::try_from(id).is_ok() => Ok(id),
            Some(id) => Err(format!("order id {id} out of range")),
            None => Err(format!("invalid order id: {n}")),
        },
        other => Err(format!("invalid order id: {other}")),
    }
}

fn decode_from_me(raw: &Value) -> Result<bool, String> {
    match raw {
        Value::Bool(b) => Ok(*b),
        Value::Null => Err("missing from_me flag".into()),
        other => Err(format!("invalid from_me flag: {other}")),
    }
}

/// Pull the text body out of a message's content.
/// Supports plain (`conversation`) and extended (`extended_text.text`) bodies.
pub fn extract_text(content: &Value) -> Option<&str> {
    if let Some(text) = content.get("conversation").and_then(|v| v.as_str()) {
        return Some(text);
    }
    content
        .get("extended_text")
        .and_then(|v| v.get("text"))
        .and_then(|v| v.as_str())
}

/// Name the content shape for skip reports: the first key of the object.
pub fn content_kind(content: &Value) -> String {
    match content {
        Value::Object(map) => map
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| "empty".into()),
        Value::Null => "missing".into(),
        _ => "malformed".into(),
    }
}

pub fn decode_message(msg: &SyncMessage) -> Result<DecodedMessage, DecodeFailure> {
    let order_id = decode_order_id(&msg.order_id).map_err(|reason| DecodeFailure {
        order_id: None,
        reason,
    })?;
    let fail = |reason: String| DecodeFailure {
        order_id: Some(order_id),
        reason,
    };

    let is_from_me = decode_from_me(&msg.from_me).map_err(fail)?;
    let text = extract_text(&msg.content)
        .ok_or_else(|| fail(format!("unsupported content: {}", content_kind(&msg.content))))?;

    Ok(DecodedMessage {
        order_id,
        text: text.to_string(),
        is_from_me,
    })
}
