use crate::RecapError;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static CONVERSATION_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+$").expect("valid regex"));

#[derive(Debug, Deserialize, Default)]
pub struct RecapConfig {
    pub store_path: Option<PathBuf>,
    pub identity_store_path: Option<PathBuf>,
    #[serde(default)]
    pub tracked_conversation_ids: Vec<String>,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummarizerConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_summarizer_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_summarizer_model")]
    pub model: String,
    #[serde(default = "default_summarizer_timeout")]
    pub timeout_secs: u64,
    /// Request placed above the transcript.
    #[serde(default = "default_summarizer_prompt")]
    pub prompt: String,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: default_summarizer_endpoint(),
            model: default_summarizer_model(),
            timeout_secs: default_summarizer_timeout(),
            prompt: default_summarizer_prompt(),
        }
    }
}

fn default_summarizer_endpoint() -> String {
    "https://api.deepseek.com/chat/completions".into()
}

fn default_summarizer_model() -> String {
    "deepseek-chat".into()
}

fn default_summarizer_timeout() -> u64 {
    60
}

fn default_summarizer_prompt() -> String {
    "Please give me a summary of these messages. Please give me the result in Portuguese:".into()
}

/// Which batches count as a recap request.
#[derive(Debug, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    /// A tracked conversation arrived with no messages.
    #[default]
    EmptyBatch,
    Never,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct TriggerConfig {
    #[serde(default)]
    pub policy: TriggerPolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            disconnect_timeout_secs: default_disconnect_timeout(),
        }
    }
}

fn default_disconnect_timeout() -> u64 {
    10
}

/// Conversation ids the pipeline ingests. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedConversations(BTreeSet<String>);

impl TrackedConversations {
    pub fn new<I, S>(ids: I) -> Result<Self, RecapError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = BTreeSet::new();
        for id in ids {
            let id: String = id.into();
            let id = id.trim().to_string();
            if !CONVERSATION_ID.is_match(&id) {
                return Err(RecapError::Config(format!(
                    "tracked conversation id {id:?} is not of the form user@server"
                )));
            }
            set.insert(id);
        }
        if set.is_empty() {
            return Err(RecapError::Config(
                "no tracked conversation ids configured".into(),
            ));
        }
        Ok(Self(set))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Values passed on the command line or via environment.
#[derive(Debug, Default)]
pub struct Overrides {
    pub store_path: Option<PathBuf>,
    pub tracked: Vec<String>,
}

/// Fully resolved startup configuration.
#[derive(Debug)]
pub struct Settings {
    pub store_path: PathBuf,
    pub identity_store_path: PathBuf,
    pub tracked_conversation_ids: TrackedConversations,
    pub summarizer: SummarizerConfig,
    pub trigger: TriggerConfig,
    pub session: SessionConfig,
}

impl Settings {
    pub fn summarizer_api_key(&self) -> Option<&str> {
        self.summarizer.api_key.as_deref().filter(|k| !k.is_empty())
    }
}

/// Load config from RECAP_CONFIG env var, ~/.recap/config.toml, or defaults.
/// RECAP_API_KEY overrides the summarizer key from the file.
pub fn load_config() -> Result<RecapConfig, RecapError> {
    let mut config = match config_path() {
        Some(p) if p.exists() => parse_config_file(&p)?,
        _ => RecapConfig::default(),
    };

    if let Ok(key) = std::env::var("RECAP_API_KEY")
        && !key.is_empty()
    {
        config.summarizer.api_key = Some(key);
    }

    Ok(config)
}

pub fn parse_config_file(path: &Path) -> Result<RecapConfig, RecapError> {
    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content).map_err(|e| RecapError::Config(format!("{}: {e}", path.display())))
}

fn config_path() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("RECAP_CONFIG") {
        return Some(PathBuf::from(p));
    }
    Some(recap_dir()?.join("config.toml"))
}

fn recap_dir() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    Some(Path::new(&home).join(".recap"))
}

fn default_path(file: &str) -> PathBuf {
    recap_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp/.recap"))
        .join(file)
}

/// Merge file config with overrides and validate.
pub fn resolve_settings(config: RecapConfig, overrides: Overrides) -> Result<Settings, RecapError> {
    let tracked = if overrides.tracked.is_empty() {
        TrackedConversations::new(config.tracked_conversation_ids)?
    } else {
        TrackedConversations::new(overrides.tracked)?
    };

    if config.summarizer.timeout_secs == 0 {
        return Err(RecapError::Config("summarizer.timeout_secs must be > 0".into()));
    }
    if config.session.disconnect_timeout_secs == 0 {
        return Err(RecapError::Config(
            "session.disconnect_timeout_secs must be > 0".into(),
        ));
    }

    Ok(Settings {
        store_path: overrides
            .store_path
            .or(config.store_path)
            .unwrap_or_else(|| default_path("recap.db")),
        identity_store_path: config
            .identity_store_path
            .unwrap_or_else(|| default_path("identity.db")),
        tracked_conversation_ids: tracked,
        summarizer: config.summarizer,
        trigger: config.trigger,
        session: config.session,
    })
}
