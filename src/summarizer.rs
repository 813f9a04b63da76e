use crate::config::SummarizerConfig;
use crate::RecapError;
use std::time::Duration;

const SYSTEM_PROMPT: &str = "You are a helpful assistant";

/// External summarization service: one request in, one text out.
pub trait Summarizer {
    fn send(&self, text: &str) -> Result<String, RecapError>;
}

/// OpenAI-compatible chat completions endpoint with bearer auth.
pub struct ChatSummarizer {
    endpoint: String,
    model: String,
    api_key: String,
    agent: ureq::Agent,
}

impl ChatSummarizer {
    pub fn new(config: &SummarizerConfig, api_key: String) -> Self {
        let agent = ureq::Agent::new_with_config(
            ureq::config::Config::builder()
                .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
                .build(),
        );
        Self {
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
            agent,
        }
    }

    fn request_body(&self, text: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": text},
            ],
            "max_tokens": 2048,
            "temperature": 1,
            "top_p": 1,
            "stream": false,
            "response_format": {"type": "text"},
        })
    }
}

impl Summarizer for ChatSummarizer {
    fn send(&self, text: &str) -> Result<String, RecapError> {
        let body = self.request_body(text);

        let resp: serde_json::Value = self
            .agent
            .post(self.endpoint.as_str())
            .header("Accept", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send_json(&body)
            .map_err(|e| RecapError::Summarizer(format!("request: {e}")))?
            .body_mut()
            .read_json()
            .map_err(|e| RecapError::Summarizer(format!("response: {e}")))?;

        response_content(&resp)
    }
}

/// Stand-in used when no API key is configured. Every call fails.
pub struct Unconfigured;

impl Summarizer for Unconfigured {
    fn send(&self, _text: &str) -> Result<String, RecapError> {
        Err(RecapError::Summarizer("no API key configured".into()))
    }
}

/// Build the summarizer described by the config.
pub fn from_config(config: &SummarizerConfig) -> Box<dyn Summarizer> {
    match config.api_key.as_deref() {
        Some(key) if !key.is_empty() => Box::new(ChatSummarizer::new(config, key.to_string())),
        _ => Box::new(Unconfigured),
    }
}

fn response_content(resp: &serde_json::Value) -> Result<String, RecapError> {
    resp.pointer("/choices/0/message/content")
        .and_then(serde_json::Value::as_str)
        .map(|s| s.trim().to_string())
        .ok_or_else(|| RecapError::Summarizer("no content in chat completion response".into()))
}
