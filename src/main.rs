use clap::Parser;
use std::process::ExitCode;

use recap::cli::{Cli, Command};
use recap::config::{Overrides, load_config, resolve_settings};
use recap::RecapError;

fn run() -> Result<(), RecapError> {
    let cli = Cli::parse();
    let config = load_config()?;
    let settings = resolve_settings(
        config,
        Overrides {
            store_path: cli.db,
            tracked: cli.track,
        },
    )?;

    match cli.command {
        Command::Listen => recap::session::handle_listen(&settings),
        Command::Ingest(args) => recap::fold::handle_ingest(&settings, &args),
        Command::Transcript(args) => recap::trigger::handle_transcript(&settings, &args),
        Command::Summarize(args) => recap::trigger::handle_summarize(&settings, &args),
        Command::Status => recap::status::handle_status(&settings.store_path),
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::new().filter_or("RECAP_LOG", "info"))
        .format_timestamp(None)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("recap: {e}");
            ExitCode::from(1)
        }
    }
}
