//! Protocol client fed by an external messaging bridge.
//!
//! The bridge owns the wire protocol and writes one JSON frame per line:
//! pairing frames (`code`, `pair_error`, `pair_timeout`) while pairing, then
//! events (`pair_success`, `connected`, `history_sync`, `message`, ...).
//! The paired device id is kept in a small SQLite identity store so the next
//! start resumes without pairing.

use crate::event::Event;
use crate::session::{PairingEvent, ProtocolClient};
use crate::RecapError;
use log::{debug, info, warn};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

pub struct IdentityStore {
    conn: Connection,
}

impl IdentityStore {
    pub fn open(path: &Path) -> Result<Self, RecapError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty())
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        crate::db::apply_pragmas(&conn, false)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, RecapError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, RecapError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS device (
                id        INTEGER PRIMARY KEY CHECK (id = 1),
                jid       TEXT NOT NULL,
                paired_at INTEGER NOT NULL DEFAULT (unixepoch('now'))
            );
            ",
        )?;
        Ok(Self { conn })
    }

    pub fn device_id(&self) -> Result<Option<String>, RecapError> {
        let jid = self
            .conn
            .query_row("SELECT jid FROM device WHERE id = 1", [], |r| r.get(0))
            .optional()?;
        Ok(jid)
    }

    pub fn save_device(&self, jid: &str) -> Result<(), RecapError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO device (id, jid) VALUES (1, ?1)",
            params![jid],
        )?;
        Ok(())
    }
}

type SharedIdentity = Arc<Mutex<IdentityStore>>;

fn lock(identity: &SharedIdentity) -> Result<std::sync::MutexGuard<'_, IdentityStore>, RecapError> {
    identity
        .lock()
        .map_err(|_| RecapError::Bridge("identity store lock poisoned".into()))
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PairingFrame {
    Code { code: String },
    PairError { reason: String },
    PairTimeout,
}

impl From<PairingFrame> for PairingEvent {
    fn from(frame: PairingFrame) -> Self {
        match frame {
            PairingFrame::Code { code } => PairingEvent::Code(code),
            PairingFrame::PairError { reason } => PairingEvent::Error(reason),
            PairingFrame::PairTimeout => PairingEvent::Timeout,
        }
    }
}

#[derive(Debug, PartialEq)]
enum Frame {
    Pairing(PairingEvent),
    Event(Event),
}

fn parse_frame(line: &str) -> Result<Frame, serde_json::Error> {
    let value: Value = serde_json::from_str(line)?;
    match value.get("type").and_then(Value::as_str) {
        Some("code" | "pair_error" | "pair_timeout") => {
            let frame: PairingFrame = serde_json::from_value(value)?;
            Ok(Frame::Pairing(frame.into()))
        }
        _ => Ok(Frame::Event(serde_json::from_value(value)?)),
    }
}

/// Read frames until the stream ends or the event receiver is gone.
async fn pump<R>(
    reader: R,
    identity: SharedIdentity,
    mut pairing: Option<UnboundedSender<PairingEvent>>,
    events: UnboundedSender<Event>,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                warn!("bridge read failed: {e}");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let event = match parse_frame(trimmed) {
            Ok(Frame::Pairing(p)) => {
                match &pairing {
                    Some(tx) => {
                        let _ = tx.send(p);
                    }
                    None => debug!("pairing frame outside pairing: {p:?}"),
                }
                continue;
            }
            Ok(Frame::Event(e)) => e,
            Err(e) => {
                warn!("skipping unparseable bridge frame: {e}");
                continue;
            }
        };

        if let Event::PairSuccess { id } = &event {
            match lock(&identity).and_then(|store| store.save_device(id)) {
                Ok(()) => info!("stored device identity {id}"),
                Err(e) => warn!("could not store device identity: {e}"),
            }
            // Dropping the sender closes the pairing channel.
            if let Some(tx) = pairing.take() {
                let _ = tx.send(PairingEvent::Success { id: id.clone() });
            }
        }

        debug!("bridge event: {}", event.kind());
        if events.send(event).is_err() {
            break;
        }
    }
    debug!("bridge stream ended");
}

pub struct BridgeClient<R> {
    identity: SharedIdentity,
    reader: Option<R>,
    pairing: Option<UnboundedSender<PairingEvent>>,
    events: Option<UnboundedReceiver<Event>>,
    task: Option<JoinHandle<()>>,
}

impl BridgeClient<BufReader<Stdin>> {
    pub fn stdin(identity: IdentityStore) -> Self {
        Self::new(identity, BufReader::new(tokio::io::stdin()))
    }
}

impl<R> BridgeClient<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn new(identity: IdentityStore, reader: R) -> Self {
        Self {
            identity: Arc::new(Mutex::new(identity)),
            reader: Some(reader),
            pairing: None,
            events: None,
            task: None,
        }
    }

    pub fn device_id(&self) -> Result<Option<String>, RecapError> {
        lock(&self.identity)?.device_id()
    }
}

impl<R> ProtocolClient for BridgeClient<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    fn has_persisted_identity(&self) -> Result<bool, RecapError> {
        Ok(self.device_id()?.is_some())
    }

    fn pairing_channel(&mut self) -> Result<UnboundedReceiver<PairingEvent>, RecapError> {
        if self.reader.is_none() {
            return Err(RecapError::Pairing(
                "pairing channel requested after connect".into(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.pairing = Some(tx);
        Ok(rx)
    }

    async fn connect(&mut self) -> Result<(), RecapError> {
        let reader = self
            .reader
            .take()
            .ok_or_else(|| RecapError::Bridge("already connected".into()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(rx);
        self.task = Some(tokio::spawn(pump(
            reader,
            self.identity.clone(),
            self.pairing.take(),
            tx,
        )));
        info!("bridge connected");
        Ok(())
    }

    async fn next_event(&mut self) -> Option<Event> {
        match self.events.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    async fn disconnect(&mut self) -> Result<(), RecapError> {
        self.events = None;
        if let Some(task) = self.task.take() {
            task.abort();
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                return Err(RecapError::Bridge(format!("reader task: {e}")));
            }
        }
        Ok(())
    }
}
