//! Folds one history-sync batch into the ledger.
//!
//! Each tracked conversation is written in its own transaction: the
//! conversation row, every decodable message, and a skip record for every
//! message that could not be decoded. A storage error rolls back that
//! conversation only and the fold moves on to the next one.

use crate::cli::IngestArgs;
use crate::config::{Settings, TrackedConversations};
use crate::event::{HistorySync, SyncConversation};
use crate::extract::{DecodeFailure, decode_message};
use crate::ledger::{Ledger, SqliteLedger};
use crate::trigger::{Trigger, TriggerOutcome};
use crate::RecapError;
use log::{debug, error, info, warn};
use std::io::Read;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedMessage {
    pub conversation_id: String,
    pub order_id: Option<u64>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationError {
    pub conversation_id: String,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub conversations_folded: usize,
    pub untracked: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub skipped: Vec<SkippedMessage>,
    pub errors: Vec<ConversationError>,
    pub outcomes: Vec<(String, TriggerOutcome)>,
}

impl BatchReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    /// One-line summary for logs.
    pub fn summary_line(&self) -> String {
        let summarized = self
            .outcomes
            .iter()
            .filter(|(_, o)| matches!(o, TriggerOutcome::Summarized { .. }))
            .count();
        format!(
            "{} conversations folded, {} untracked, {} inserted, {} duplicate, {} skipped, {} errors, {} summarized",
            self.conversations_folded,
            self.untracked,
            self.inserted,
            self.duplicates,
            self.skipped.len(),
            self.errors.len(),
            summarized,
        )
    }
}

#[derive(Default)]
struct ConversationTally {
    inserted: usize,
    duplicates: usize,
    skipped: Vec<DecodeFailure>,
}

pub struct Folder<'a> {
    ledger: &'a dyn Ledger,
    tracked: &'a TrackedConversations,
    trigger: &'a Trigger,
}

impl<'a> Folder<'a> {
    pub fn new(
        ledger: &'a dyn Ledger,
        tracked: &'a TrackedConversations,
        trigger: &'a Trigger,
    ) -> Self {
        Self {
            ledger,
            tracked,
            trigger,
        }
    }

    pub fn fold(&self, sync: &HistorySync) -> BatchReport {
        let mut report = BatchReport::default();

        for conversation in &sync.conversations {
            if !self.tracked.contains(&conversation.id) {
                debug!("ignoring untracked conversation {}", conversation.id);
                report.untracked += 1;
                continue;
            }

            let tally = match self.write_conversation(conversation) {
                Ok(t) => t,
                Err(e) => {
                    error!("rolled back {}: {e}", conversation.id);
                    report.errors.push(ConversationError {
                        conversation_id: conversation.id.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            report.conversations_folded += 1;
            report.inserted += tally.inserted;
            report.duplicates += tally.duplicates;
            for failure in tally.skipped {
                report.skipped.push(SkippedMessage {
                    conversation_id: conversation.id.clone(),
                    order_id: failure.order_id,
                    reason: failure.reason,
                });
            }

            let batch_message_count = conversation.messages.len();
            match self
                .trigger
                .maybe_summarize(self.ledger, &conversation.id, batch_message_count)
            {
                Ok(outcome) => report.outcomes.push((conversation.id.clone(), outcome)),
                Err(e) => {
                    error!("recap for {} failed: {e}", conversation.id);
                    report.errors.push(ConversationError {
                        conversation_id: conversation.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }

    fn write_conversation(
        &self,
        conversation: &SyncConversation,
    ) -> Result<ConversationTally, RecapError> {
        let id = conversation.id.as_str();
        let name = conversation.name.as_deref().unwrap_or("");
        let mut tally = ConversationTally::default();

        self.ledger.atomically(&mut |ledger| {
            ledger.ensure_conversation(id, name)?;

            for entry in &conversation.messages {
                match decode_message(entry) {
                    Ok(msg) => {
                        let appended =
                            ledger.append_message(id, &msg.text, msg.is_from_me, msg.order_id)?;
                        if appended.is_inserted() {
                            tally.inserted += 1;
                        } else {
                            debug!("order {} in {id} already stored", appended.message().order_id);
                            tally.duplicates += 1;
                        }
                    }
                    Err(failure) => {
                        warn!(
                            "skipping message {:?} in {id}: {}",
                            failure.order_id, failure.reason
                        );
                        ledger.record_skipped(id, failure.order_id, &failure.reason)?;
                        tally.skipped.push(failure);
                    }
                }
            }
            Ok(())
        })?;

        info!(
            "folded {id}: {} new, {} duplicate, {} skipped",
            tally.inserted,
            tally.duplicates,
            tally.skipped.len()
        );
        Ok(tally)
    }
}

/// Fold a single batch read from a file or stdin, outside any session.
pub fn handle_ingest(settings: &Settings, args: &IngestArgs) -> Result<(), RecapError> {
    let raw = match &args.file {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let sync: HistorySync = serde_json::from_str(&raw)?;

    let ledger = SqliteLedger::open(&settings.store_path)?;
    let trigger = Trigger::from_settings(settings);
    let report = Folder::new(&ledger, &settings.tracked_conversation_ids, &trigger).fold(&sync);
    if !report.is_clean() {
        warn!("{} conversations rolled back", report.errors.len());
    }

    println!("{}", report.summary_line());
    for skipped in &report.skipped {
        println!(
            "skipped {} #{}: {}",
            skipped.conversation_id,
            skipped
                .order_id
                .map_or_else(|| "?".to_string(), |o| o.to_string()),
            skipped.reason
        );
    }
    for failure in &report.errors {
        println!("error {}: {}", failure.conversation_id, failure.error);
    }
    crate::session::print_summaries(&report);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TriggerPolicy;
    use crate::event::SyncMessage;
    use crate::ledger::SqliteLedger;
    use crate::summarizer::Summarizer;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    const ANA: &str = "5511999999999@s.whatsapp.net";
    const BIA: &str = "5511888888888@s.whatsapp.net";
    const STRANGER: &str = "5511777777777@s.whatsapp.net";

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Rc<RefCell<Vec<String>>>,
    }

    impl Summarizer for Recorder {
        fn send(&self, text: &str) -> Result<String, RecapError> {
            self.calls.borrow_mut().push(text.to_string());
            Ok("ok".into())
        }
    }

    fn conversation(id: &str, messages: Vec<SyncMessage>) -> SyncConversation {
        SyncConversation {
            id: id.into(),
            name: Some("Name".into()),
            messages,
        }
    }

    fn trigger(recorder: &Recorder) -> Trigger {
        Trigger::new(
            Box::new(TriggerPolicy::EmptyBatch),
            Box::new(recorder.clone()),
            "Summarize:",
        )
    }

    #[test]
    fn untracked_conversations_are_ignored() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let tracked = TrackedConversations::new([ANA]).unwrap();
        let recorder = Recorder::default();
        let trigger = trigger(&recorder);

        let sync = HistorySync {
            conversations: vec![
                conversation(STRANGER, vec![SyncMessage::text(1, true, "hi")]),
                conversation(STRANGER, vec![]),
            ],
        };
        let report = Folder::new(&ledger, &tracked, &trigger).fold(&sync);

        assert_eq!(report.untracked, 2);
        assert!(report.outcomes.is_empty());
        assert_eq!(ledger.stats().unwrap().conversations, 0);
        assert!(recorder.calls.borrow().is_empty());
    }

    #[test]
    fn refold_is_a_noop() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let tracked = TrackedConversations::new([ANA]).unwrap();
        let recorder = Recorder::default();
        let trigger = trigger(&recorder);
        let folder = Folder::new(&ledger, &tracked, &trigger);

        let sync = HistorySync {
            conversations: vec![conversation(
                ANA,
                vec![SyncMessage::text(1, true, "hi"), SyncMessage::text(2, false, "yo")],
            )],
        };

        let first = folder.fold(&sync);
        let second = folder.fold(&sync);

        assert_eq!(first.inserted, 2);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(ledger.messages_for(ANA).unwrap().len(), 2);
    }

    #[test]
    fn undecodable_messages_are_recorded_and_skipped() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let tracked = TrackedConversations::new([ANA]).unwrap();
        let recorder = Recorder::default();
        let trigger = trigger(&recorder);

        let sync = HistorySync {
            conversations: vec![conversation(
                ANA,
                vec![
                    SyncMessage::text(1, true, "hi"),
                    SyncMessage {
                        order_id: json!(2),
                        from_me: json!(false),
                        content: json!({"image": {"caption": "cat"}}),
                    },
                    SyncMessage::text(3, false, "yo"),
                ],
            )],
        };
        let report = Folder::new(&ledger, &tracked, &trigger).fold(&sync);

        assert_eq!(report.inserted, 2);
        assert_eq!(
            report.skipped,
            vec![SkippedMessage {
                conversation_id: ANA.into(),
                order_id: Some(2),
                reason: "unsupported content: image".into(),
            }]
        );
        assert_eq!(ledger.stats().unwrap().skipped, 1);
        assert_eq!(ledger.messages_for(ANA).unwrap().len(), 2);
    }

    #[test]
    fn empty_resync_summarizes_stored_history() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let tracked = TrackedConversations::new([ANA, BIA]).unwrap();
        let recorder = Recorder::default();
        let trigger = trigger(&recorder);
        let folder = Folder::new(&ledger, &tracked, &trigger);

        folder.fold(&HistorySync {
            conversations: vec![conversation(
                ANA,
                vec![SyncMessage::text(2, false, "yo"), SyncMessage::text(1, true, "hi")],
            )],
        });
        assert!(recorder.calls.borrow().is_empty());

        let report = folder.fold(&HistorySync {
            conversations: vec![conversation(ANA, vec![]), conversation(BIA, vec![])],
        });

        let calls = recorder.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], "Summarize:\nMe: hi\nOther: yo\n");
        assert_eq!(report.conversations_folded, 2);
        assert_eq!(report.outcomes[1], (BIA.to_string(), TriggerOutcome::EmptyTranscript));
    }

    #[test]
    fn badly_typed_entry_is_skipped_without_losing_the_batch() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let tracked = TrackedConversations::new([ANA, BIA]).unwrap();
        let recorder = Recorder::default();
        let trigger = trigger(&recorder);

        let sync: HistorySync = serde_json::from_value(json!({
            "conversations": [
                {"id": ANA, "messages": [
                    {"order_id": 1, "from_me": true, "content": {"conversation": "hi"}}
                ]},
                {"id": BIA, "messages": [
                    {"order_id": "7", "from_me": false, "content": {"conversation": "x"}},
                    {"order_id": 8, "from_me": false, "content": {"conversation": "oi"}}
                ]}
            ]
        }))
        .unwrap();
        let report = Folder::new(&ledger, &tracked, &trigger).fold(&sync);

        assert!(report.is_clean());
        assert_eq!(report.conversations_folded, 2);
        assert_eq!(report.inserted, 2);
        assert_eq!(
            report.skipped,
            vec![SkippedMessage {
                conversation_id: BIA.into(),
                order_id: None,
                reason: r#"invalid order id: "7""#.into(),
            }]
        );
        assert_eq!(ledger.messages_for(ANA).unwrap().len(), 1);
        assert_eq!(ledger.messages_for(BIA).unwrap()[0].text, "oi");
        assert_eq!(ledger.stats().unwrap().skipped, 1);
    }

    #[test]
    fn oversized_order_id_is_skipped_not_rolled_back() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let tracked = TrackedConversations::new([ANA]).unwrap();
        let recorder = Recorder::default();
        let trigger = trigger(&recorder);

        let sync = HistorySync {
            conversations: vec![conversation(
                ANA,
                vec![SyncMessage::text(1, true, "hi"), SyncMessage::text(u64::MAX, true, "big")],
            )],
        };
        let report = Folder::new(&ledger, &tracked, &trigger).fold(&sync);

        assert!(report.is_clean());
        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(
            report.skipped[0].reason,
            format!("order id {} out of range", u64::MAX)
        );
        assert_eq!(ledger.messages_for(ANA).unwrap()[0].text, "hi");
    }

    #[test]
    fn refolding_orderless_entry_records_one_skip() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let tracked = TrackedConversations::new([ANA]).unwrap();
        let recorder = Recorder::default();
        let trigger = trigger(&recorder);
        let folder = Folder::new(&ledger, &tracked, &trigger);

        let sync = HistorySync {
            conversations: vec![conversation(
                ANA,
                vec![
                    SyncMessage::text(1, true, "hi"),
                    SyncMessage {
                        order_id: serde_json::Value::Null,
                        from_me: json!(false),
                        content: json!({"conversation": "lost"}),
                    },
                ],
            )],
        };
        for _ in 0..3 {
            let report = folder.fold(&sync);
            assert_eq!(report.skipped.len(), 1);
        }

        let stats = ledger.stats().unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.messages, 1);
    }

    /// Fails every append to one conversation.
    struct FailingLedger {
        inner: SqliteLedger,
        poisoned: &'static str,
    }

    impl Ledger for FailingLedger {
        fn ensure_conversation(
            &self,
            id: &str,
            name: &str,
        ) -> Result<crate::ledger::Conversation, RecapError> {
            self.inner.ensure_conversation(id, name)
        }

        fn append_message(
            &self,
            conversation_id: &str,
            text: &str,
            is_from_me: bool,
            order_id: u64,
        ) -> Result<crate::ledger::Appended, RecapError> {
            if conversation_id == self.poisoned && order_id > 1 {
                return Err(RecapError::Config("disk full".into()));
            }
            self.inner
                .append_message(conversation_id, text, is_from_me, order_id)
        }

        fn messages_for(
            &self,
            conversation_id: &str,
        ) -> Result<Vec<crate::ledger::Message>, RecapError> {
            self.inner.messages_for(conversation_id)
        }

        fn record_skipped(
            &self,
            conversation_id: &str,
            order_id: Option<u64>,
            reason: &str,
        ) -> Result<(), RecapError> {
            self.inner.record_skipped(conversation_id, order_id, reason)
        }

        fn record_summary(
            &self,
            conversation_id: &str,
            through_order_id: u64,
            message_count: usize,
            response: &str,
        ) -> Result<(), RecapError> {
            self.inner
                .record_summary(conversation_id, through_order_id, message_count, response)
        }

        fn atomically(
            &self,
            f: &mut dyn FnMut(&dyn Ledger) -> Result<(), RecapError>,
        ) -> Result<(), RecapError> {
            self.inner.atomically(&mut |_| f(self))
        }

        fn stats(&self) -> Result<crate::ledger::LedgerStats, RecapError> {
            self.inner.stats()
        }
    }

    #[test]
    fn store_failure_rolls_back_one_conversation_and_continues() {
        let ledger = FailingLedger {
            inner: SqliteLedger::open_in_memory().unwrap(),
            poisoned: ANA,
        };
        let tracked = TrackedConversations::new([ANA, BIA]).unwrap();
        let recorder = Recorder::default();
        let trigger = trigger(&recorder);

        let sync = HistorySync {
            conversations: vec![
                conversation(
                    ANA,
                    vec![SyncMessage::text(1, true, "hi"), SyncMessage::text(2, false, "yo")],
                ),
                conversation(BIA, vec![SyncMessage::text(1, false, "oi")]),
            ],
        };
        let report = Folder::new(&ledger, &tracked, &trigger).fold(&sync);

        assert!(!report.is_clean());
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].conversation_id, ANA);
        assert!(report.errors[0].error.contains("disk full"));
        assert_eq!(report.conversations_folded, 1);
        assert_eq!(report.inserted, 1);

        // Nothing of the failed conversation survives, not even its row.
        assert!(ledger.inner.conversation(ANA).unwrap().is_none());
        assert!(ledger.messages_for(ANA).unwrap().is_empty());
        assert_eq!(ledger.messages_for(BIA).unwrap().len(), 1);
    }

    #[test]
    fn conversation_listed_twice_is_folded_twice() {
        let ledger = SqliteLedger::open_in_memory().unwrap();
        let tracked = TrackedConversations::new([ANA]).unwrap();
        let recorder = Recorder::default();
        let trigger = trigger(&recorder);

        let sync = HistorySync {
            conversations: vec![
                conversation(ANA, vec![SyncMessage::text(1, true, "hi")]),
                conversation(ANA, vec![SyncMessage::text(1, true, "hi")]),
            ],
        };
        let report = Folder::new(&ledger, &tracked, &trigger).fold(&sync);

        assert_eq!(report.conversations_folded, 2);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.duplicates, 1);
    }
}
