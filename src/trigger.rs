//! Recap requests: when a tracked conversation syncs without content, send
//! the stored transcript to the summarizer.

use crate::cli::ConversationArgs;
use crate::config::{Settings, TriggerPolicy};
use crate::ledger::{Ledger, Message, SqliteLedger};
use crate::summarizer::Summarizer;
use crate::RecapError;
use log::{info, warn};

const SELF_LABEL: &str = "Me: ";
const OTHER_LABEL: &str = "Other: ";

/// Decides whether a folded conversation asks for a recap.
pub trait SummaryGate {
    fn should_summarize(&self, batch_message_count: usize) -> bool;
}

impl SummaryGate for TriggerPolicy {
    fn should_summarize(&self, batch_message_count: usize) -> bool {
        match self {
            TriggerPolicy::EmptyBatch => batch_message_count == 0,
            TriggerPolicy::Never => false,
        }
    }
}

impl<F: Fn(usize) -> bool> SummaryGate for F {
    fn should_summarize(&self, batch_message_count: usize) -> bool {
        self(batch_message_count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    NotTriggered,
    /// Gate fired but nothing is stored for the conversation.
    EmptyTranscript,
    Summarized {
        message_count: usize,
        response: String,
    },
    /// Summarizer call failed; the ledger is untouched.
    Failed {
        error: String,
    },
}

/// Render messages as one `Me: `/`Other: ` line each, in the given order.
pub fn render_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    for m in messages {
        out.push_str(if m.is_from_me { SELF_LABEL } else { OTHER_LABEL });
        out.push_str(&m.text);
        out.push('\n');
    }
    out
}

pub struct Trigger {
    gate: Box<dyn SummaryGate>,
    summarizer: Box<dyn Summarizer>,
    prompt: String,
}

impl Trigger {
    pub fn new(
        gate: Box<dyn SummaryGate>,
        summarizer: Box<dyn Summarizer>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            gate,
            summarizer,
            prompt: prompt.into(),
        }
    }

    /// Trigger wired from resolved settings: configured policy, summarizer and prompt.
    pub fn from_settings(settings: &Settings) -> Self {
        if settings.summarizer_api_key().is_none() {
            warn!("no summarizer API key configured; recaps will be reported as failed");
        }
        Self::new(
            Box::new(settings.trigger.policy),
            crate::summarizer::from_config(&settings.summarizer),
            settings.summarizer.prompt.clone(),
        )
    }

    /// Gate on the batch's own message count, then summarize what is stored.
    /// Only ledger errors are returned as `Err`; summarizer failures are an outcome.
    pub fn maybe_summarize(
        &self,
        ledger: &dyn Ledger,
        conversation_id: &str,
        batch_message_count: usize,
    ) -> Result<TriggerOutcome, RecapError> {
        if !self.gate.should_summarize(batch_message_count) {
            return Ok(TriggerOutcome::NotTriggered);
        }
        self.summarize(ledger, conversation_id)
    }

    /// Summarize the stored transcript regardless of the gate.
    pub fn summarize(
        &self,
        ledger: &dyn Ledger,
        conversation_id: &str,
    ) -> Result<TriggerOutcome, RecapError> {
        let messages = ledger.messages_for(conversation_id)?;
        let Some(last) = messages.last() else {
            info!("recap requested for {conversation_id} but nothing is stored");
            return Ok(TriggerOutcome::EmptyTranscript);
        };
        let through_order_id = last.order_id;

        let request = format!("{}\n{}", self.prompt, render_transcript(&messages));
        info!(
            "summarizing {conversation_id} ({} messages through order {through_order_id})",
            messages.len()
        );

        let response = match self.summarizer.send(&request) {
            Ok(r) => r,
            Err(e) => {
                warn!("summarizer failed for {conversation_id}: {e}");
                let error = match e {
                    RecapError::Summarizer(msg) => msg,
                    other => other.to_string(),
                };
                return Ok(TriggerOutcome::Failed { error });
            }
        };

        ledger.record_summary(conversation_id, through_order_id, messages.len(), &response)?;

        Ok(TriggerOutcome::Summarized {
            message_count: messages.len(),
            response,
        })
    }
}

pub fn handle_transcript(settings: &Settings, args: &ConversationArgs) -> Result<(), RecapError> {
    let ledger = SqliteLedger::open(&settings.store_path)?;
    let messages = ledger.messages_for(&args.id)?;
    if messages.is_empty() {
        eprintln!("recap: no messages stored for {}", args.id);
        return Ok(());
    }
    print!("{}", render_transcript(&messages));
    Ok(())
}

/// Summarize on demand, bypassing the gate.
pub fn handle_summarize(settings: &Settings, args: &ConversationArgs) -> Result<(), RecapError> {
    let ledger = SqliteLedger::open(&settings.store_path)?;
    let trigger = Trigger::from_settings(settings);

    match trigger.summarize(&ledger, &args.id)? {
        TriggerOutcome::Summarized { response, .. } => println!("{response}"),
        TriggerOutcome::EmptyTranscript => {
            eprintln!("recap: no messages stored for {}", args.id);
        }
        TriggerOutcome::Failed { error } => return Err(RecapError::Summarizer(error)),
        TriggerOutcome::NotTriggered => {}
    }
    Ok(())
}
