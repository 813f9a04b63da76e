//! Session lifecycle: pair or resume, listen for events, disconnect on shutdown.

use crate::bridge::{BridgeClient, IdentityStore};
use crate::config::Settings;
use crate::event::Event;
use crate::fold::{BatchReport, Folder};
use crate::ledger::SqliteLedger;
use crate::trigger::{Trigger, TriggerOutcome};
use crate::RecapError;
use log::{debug, info, warn};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Pairing,
    Connected,
    Listening,
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// A code to show the user.
    Code(String),
    Success { id: String },
    Timeout,
    Error(String),
}

/// What the session needs from the messaging protocol client.
#[allow(async_fn_in_trait)]
pub trait ProtocolClient {
    fn has_persisted_identity(&self) -> Result<bool, RecapError>;

    /// Channel of pairing codes. Must be requested before `connect`; it closes
    /// once pairing succeeds or the client gives up.
    fn pairing_channel(&mut self) -> Result<UnboundedReceiver<PairingEvent>, RecapError>;

    async fn connect(&mut self) -> Result<(), RecapError>;

    /// Next event, or `None` once the connection is gone.
    async fn next_event(&mut self) -> Option<Event>;

    async fn disconnect(&mut self) -> Result<(), RecapError>;
}

/// Receives events one at a time; each is handled to completion.
pub trait EventHandler {
    fn handle(&mut self, event: Event);
}

pub struct Controller<C> {
    client: C,
    state: SessionState,
    transitions: Vec<SessionState>,
    disconnect_timeout: Duration,
}

impl<C: ProtocolClient> Controller<C> {
    pub fn new(client: C, disconnect_timeout: Duration) -> Self {
        Self {
            client,
            state: SessionState::Disconnected,
            transitions: vec![SessionState::Disconnected],
            disconnect_timeout,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn transitions(&self) -> &[SessionState] {
        &self.transitions
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn transition(&mut self, next: SessionState) {
        debug!("session {:?} -> {next:?}", self.state);
        self.state = next;
        self.transitions.push(next);
    }

    /// Drive the session until `shutdown` resolves or the event stream ends.
    pub async fn run<H, S>(&mut self, handler: &mut H, shutdown: S) -> Result<(), RecapError>
    where
        H: EventHandler,
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let interrupted = if self.client.has_persisted_identity()? {
            self.client.connect().await?;
            false
        } else {
            self.pair(&mut shutdown).await?
        };

        if !interrupted {
            self.transition(SessionState::Connected);
            self.listen(handler, &mut shutdown).await;
        }

        self.shut_down().await;
        Ok(())
    }

    /// Returns true if shutdown was requested before pairing finished.
    async fn pair<S>(&mut self, shutdown: &mut Pin<&mut S>) -> Result<bool, RecapError>
    where
        S: Future<Output = ()>,
    {
        self.transition(SessionState::Pairing);
        let mut codes = self.client.pairing_channel()?;
        self.client.connect().await?;

        loop {
            tokio::select! {
                _ = &mut *shutdown => return Ok(true),
                evt = codes.recv() => match evt {
                    Some(PairingEvent::Code(code)) => render_code(&code),
                    Some(PairingEvent::Success { id }) => {
                        info!("paired as {id}");
                        return Ok(false);
                    }
                    Some(PairingEvent::Timeout) => warn!("pairing code expired"),
                    Some(PairingEvent::Error(reason)) => warn!("pairing error: {reason}"),
                    None => break,
                },
            }
        }

        if let Err(e) = self.client.disconnect().await {
            warn!("disconnect after failed pairing: {e}");
        }
        self.transition(SessionState::Disconnected);
        Err(RecapError::Pairing(
            "code channel closed before pairing succeeded".into(),
        ))
    }

    async fn listen<H, S>(&mut self, handler: &mut H, shutdown: &mut Pin<&mut S>)
    where
        H: EventHandler,
        S: Future<Output = ()>,
    {
        self.transition(SessionState::Listening);
        info!("listening for history sync events");

        loop {
            tokio::select! {
                biased;
                _ = &mut *shutdown => {
                    info!("shutdown requested");
                    break;
                }
                evt = self.client.next_event() => match evt {
                    Some(event) => handler.handle(event),
                    None => {
                        warn!("event stream closed");
                        break;
                    }
                },
            }
        }
    }

    async fn shut_down(&mut self) {
        self.transition(SessionState::ShuttingDown);
        match tokio::time::timeout(self.disconnect_timeout, self.client.disconnect()).await {
            Ok(Ok(())) => info!("disconnected"),
            Ok(Err(e)) => warn!("disconnect failed: {e}"),
            Err(_) => warn!("disconnect timed out after {:?}", self.disconnect_timeout),
        }
        self.transition(SessionState::Disconnected);
    }
}

fn render_code(code: &str) {
    info!("new pairing code issued");
    println!("pairing code: {code}");
}

/// Forwards history syncs to the folder; everything else is logged.
pub struct IngestHandler<'a> {
    folder: Folder<'a>,
    batches: usize,
    last_report: Option<BatchReport>,
}

impl<'a> IngestHandler<'a> {
    pub fn new(folder: Folder<'a>) -> Self {
        Self {
            folder,
            batches: 0,
            last_report: None,
        }
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn last_report(&self) -> Option<&BatchReport> {
        self.last_report.as_ref()
    }
}

impl EventHandler for IngestHandler<'_> {
    fn handle(&mut self, event: Event) {
        match event {
            Event::HistorySync(sync) => {
                let report = self.folder.fold(&sync);
                self.batches += 1;
                if report.is_clean() {
                    info!("history sync #{}: {}", self.batches, report.summary_line());
                } else {
                    warn!("history sync #{}: {}", self.batches, report.summary_line());
                }
                print_summaries(&report);
                self.last_report = Some(report);
            }
            Event::Connected => info!("connected"),
            Event::PairSuccess { id } => info!("pair success for {id}"),
            Event::Message { chat } => debug!("ignoring live message in {chat}"),
            Event::Other => debug!("ignoring unrecognized event"),
        }
    }
}

/// Print every summarizer response in the report to stdout.
pub fn print_summaries(report: &BatchReport) {
    for (conversation_id, outcome) in &report.outcomes {
        if let TriggerOutcome::Summarized { response, .. } = outcome {
            println!("== {conversation_id}\n{response}");
        }
    }
}

/// Wait for SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

pub fn handle_listen(settings: &Settings) -> Result<(), RecapError> {
    let identity = IdentityStore::open(&settings.identity_store_path)?;
    let ledger = SqliteLedger::open(&settings.store_path)?;
    let trigger = Trigger::from_settings(settings);
    let folder = Folder::new(&ledger, &settings.tracked_conversation_ids, &trigger);
    let mut handler = IngestHandler::new(folder);

    let tracked: Vec<&str> = settings.tracked_conversation_ids.iter().collect();
    info!("tracking {}", tracked.join(", "));

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(RecapError::Io)?;

    let result = rt.block_on(async {
        let client = BridgeClient::stdin(identity);
        let mut controller = Controller::new(
            client,
            Duration::from_secs(settings.session.disconnect_timeout_secs),
        );
        controller.run(&mut handler, shutdown_signal()).await
    });

    // A pending stdin read would otherwise keep the runtime alive.
    rt.shutdown_timeout(Duration::from_secs(1));
    result
}
