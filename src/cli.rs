use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "recap", version, about = "Chat history ledger with on-demand recaps")]
pub struct Cli {
    /// Database path
    #[arg(long, env = "RECAP_DB", global = true)]
    pub db: Option<PathBuf>,

    /// Tracked conversation ids, comma separated (replaces the config list)
    #[arg(long, env = "RECAP_TRACK", value_delimiter = ',', global = true)]
    pub track: Vec<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Pair or resume through the bridge on stdin and ingest history syncs
    Listen,
    /// Fold one history-sync batch (JSON) from a file or stdin
    Ingest(IngestArgs),
    /// Print the stored transcript of a conversation
    Transcript(ConversationArgs),
    /// Summarize a stored conversation now
    Summarize(ConversationArgs),
    /// Show ledger counts
    Status,
}

#[derive(Parser)]
pub struct IngestArgs {
    /// Batch file; reads stdin when omitted
    pub file: Option<PathBuf>,
}

#[derive(Parser)]
pub struct ConversationArgs {
    /// Conversation id, e.g. 5511999999999@s.whatsapp.net
    pub id: String,
}
