use rusqlite_migration::{M, Migrations};
use std::sync::LazyLock;

pub static MIGRATIONS: LazyLock<Migrations<'static>> = LazyLock::new(|| {
    Migrations::new(vec![
        M::up(
            "
CREATE TABLE conversations (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL DEFAULT '',
    created_at  INTEGER NOT NULL DEFAULT (unixepoch('now'))
);

CREATE TABLE messages (
    id              INTEGER PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    text            TEXT NOT NULL,
    is_from_me      INTEGER NOT NULL,
    order_id        INTEGER NOT NULL,
    created_at      INTEGER NOT NULL DEFAULT (unixepoch('now'))
);

CREATE INDEX idx_messages_conversation ON messages(conversation_id, order_id);
",
        ),
        // Re-ingesting a sync used to duplicate rows. Keep the earliest copy.
        M::up(
            "
DELETE FROM messages WHERE id NOT IN (
    SELECT MIN(id) FROM messages GROUP BY conversation_id, order_id
);
DROP INDEX idx_messages_conversation;
CREATE UNIQUE INDEX idx_messages_order ON messages(conversation_id, order_id);
",
        ),
        M::up(
            "
CREATE TABLE skipped_messages (
    id              INTEGER PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id),
    order_id        INTEGER,
    reason          TEXT NOT NULL,
    created_at      INTEGER NOT NULL DEFAULT (unixepoch('now'))
);
CREATE UNIQUE INDEX idx_skipped_order ON skipped_messages(conversation_id, order_id);
",
        ),
        M::up(
            "
CREATE TABLE summaries (
    id               INTEGER PRIMARY KEY,
    conversation_id  TEXT NOT NULL REFERENCES conversations(id),
    through_order_id INTEGER NOT NULL,
    message_count    INTEGER NOT NULL,
    response         TEXT NOT NULL,
    created_at       INTEGER NOT NULL DEFAULT (unixepoch('now'))
);
CREATE INDEX idx_summaries_conversation ON summaries(conversation_id, created_at);
",
        ),
        // NULLs are distinct in a plain unique index, so entries without an
        // order id were recorded again on every re-ingest. Key those by reason.
        M::up(
            "
DELETE FROM skipped_messages WHERE id NOT IN (
    SELECT MIN(id) FROM skipped_messages
    GROUP BY conversation_id, IFNULL(order_id, -1),
             CASE WHEN order_id IS NULL THEN reason ELSE '' END
);
DROP INDEX idx_skipped_order;
CREATE UNIQUE INDEX idx_skipped_entry ON skipped_messages(
    conversation_id,
    IFNULL(order_id, -1),
    (CASE WHEN order_id IS NULL THEN reason ELSE '' END)
);
",
        ),
    ])
});
