//! Text-completion backends.
//!
//! The [`Completion`] trait is the narrow seam between prompt rendering and
//! the network. [`HttpCompletion`] speaks the Ollama, Anthropic and OpenAI
//! HTTP APIs; tests substitute canned responses.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::core::budget::RunBudget;
use crate::io::config::ProviderConfig;
use crate::io::process::POLL_INTERVAL;

const CLAUDE_URL: &str = "https://api.anthropic.com/v1/messages";
const CLAUDE_API_VERSION: &str = "2023-06-01";
const CLAUDE_MAX_TOKENS: u32 = 4096;
const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Bytes of an error response body kept in the error message.
const ERROR_BODY_EXCERPT_BYTES: usize = 500;

/// Abstraction over text-generation backends.
pub trait Completion {
    /// Complete `prompt` within `budget`. Expiry and cancellation surface as
    /// a [`BudgetError`](crate::core::budget::BudgetError).
    fn complete(&self, prompt: &str, budget: &RunBudget) -> Result<String>;
}

/// Completion over HTTP, for the provider chosen in config.
pub struct HttpCompletion {
    client: Client,
    provider: ProviderConfig,
}

impl HttpCompletion {
    pub fn new(provider: ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("scriptgen/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self { client, provider })
    }

    pub fn provider(&self) -> &ProviderConfig {
        &self.provider
    }

    fn request(&self, prompt: &str) -> RequestBuilder {
        match &self.provider {
            ProviderConfig::Ollama { host, model } => self
                .client
                .post(format!("{}/api/generate", host.trim_end_matches('/')))
                .json(&json!({
                    "model": model,
                    "prompt": prompt,
                    "stream": false,
                })),
            ProviderConfig::Claude { api_key, model } => self
                .client
                .post(CLAUDE_URL)
                .header("x-api-key", api_key)
                .header("anthropic-version", CLAUDE_API_VERSION)
                .json(&json!({
                    "model": model,
                    "max_tokens": CLAUDE_MAX_TOKENS,
                    "messages": [{"role": "user", "content": prompt}],
                })),
            ProviderConfig::OpenAi { api_key, model } => self
                .client
                .post(OPENAI_URL)
                .bearer_auth(api_key)
                .json(&json!({
                    "model": model,
                    "messages": [{"role": "user", "content": prompt}],
                })),
        }
    }
}

impl Completion for HttpCompletion {
    #[instrument(skip_all, fields(provider = self.provider.kind().as_str(), model = self.provider.model()))]
    fn complete(&self, prompt: &str, budget: &RunBudget) -> Result<String> {
        let timeout = budget.remaining()?;
        let request = self
            .request(prompt)
            .timeout(timeout)
            .build()
            .context("build completion request")?;
        debug!(
            prompt_len = prompt.len(),
            timeout_ms = timeout.as_millis() as u64,
            "sending completion request"
        );

        // The request runs on its own thread so a cancelled run returns at
        // once. An abandoned request ends with its own timeout.
        let client = self.client.clone();
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("scriptgen-completion".to_string())
            .spawn(move || {
                let reply = client
                    .execute(request)
                    .context("send completion request")
                    .and_then(|response| {
                        let status = response.status();
                        let body = response.text().context("read completion response")?;
                        Ok((status, body))
                    });
                let _ = tx.send(reply);
            })
            .context("spawn completion request")?;

        let (status, body) = wait_for_reply(&rx, budget)?;
        if !status.is_success() {
            warn!(%status, "completion request failed");
            return Err(anyhow!(
                "{} returned {status}: {}",
                self.provider.kind().as_str(),
                excerpt(&body)
            ));
        }

        let text = parse_response(&self.provider, &body)?;
        debug!(response_len = text.len(), "completion received");
        Ok(text)
    }
}

/// Block until the request thread replies, checking `budget` every
/// [`POLL_INTERVAL`].
fn wait_for_reply(
    rx: &Receiver<Result<(StatusCode, String)>>,
    budget: &RunBudget,
) -> Result<(StatusCode, String)> {
    loop {
        let remaining = match budget.remaining() {
            Ok(remaining) => remaining,
            Err(err) => {
                warn!(%err, "abandoning completion request");
                return Err(err.into());
            }
        };
        match rx.recv_timeout(remaining.min(POLL_INTERVAL)) {
            Ok(reply) => return reply,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                bail!("completion request thread exited without a reply")
            }
        }
    }
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

#[derive(Deserialize)]
struct ClaudeResponse {
    content: Vec<ClaudeBlock>,
}

#[derive(Deserialize)]
struct ClaudeBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Pull the generated text out of a provider's success body.
fn parse_response(provider: &ProviderConfig, body: &str) -> Result<String> {
    let text = match provider {
        ProviderConfig::Ollama { .. } => {
            let parsed: OllamaResponse =
                serde_json::from_str(body).context("parse ollama response")?;
            parsed.response
        }
        ProviderConfig::Claude { .. } => {
            let parsed: ClaudeResponse =
                serde_json::from_str(body).context("parse claude response")?;
            parsed
                .content
                .into_iter()
                .filter(|block| block.kind == "text")
                .map(|block| block.text)
                .collect::<Vec<_>>()
                .join("")
        }
        ProviderConfig::OpenAi { .. } => {
            let parsed: OpenAiResponse =
                serde_json::from_str(body).context("parse openai response")?;
            parsed
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .unwrap_or_default()
        }
    };
    if text.trim().is_empty() {
        return Err(anyhow!(
            "{} returned an empty completion",
            provider.kind().as_str()
        ));
    }
    Ok(text)
}

/// Short, single-line view of an error body, preferring a JSON `error`
/// message when there is one.
fn excerpt(body: &str) -> String {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            let error = value.get("error")?;
            error
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| error.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string());
    let mut end = message.len().min(ERROR_BODY_EXCERPT_BYTES);
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::core::budget::BudgetError;
    use crate::io::config::ProviderKind;

    /// Local address that accepts connections and never answers.
    fn silent_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        thread::spawn(move || {
            let mut held = Vec::new();
            for stream in listener.incoming() {
                held.push(stream);
            }
        });
        format!("http://{addr}")
    }

    fn ollama_at(host: String) -> HttpCompletion {
        HttpCompletion::new(ProviderConfig::Ollama {
            host,
            model: "none".to_string(),
        })
        .expect("client")
    }

    #[test]
    fn cancel_interrupts_a_request_in_flight() {
        let completion = ollama_at(silent_server());
        let budget = RunBudget::new(Duration::from_secs(30));
        let cancel = budget.cancel_token().clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            cancel.cancel();
        });

        let started = Instant::now();
        let err = completion.complete("print hi", &budget).unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
        assert_eq!(
            err.downcast_ref::<BudgetError>(),
            Some(&BudgetError::Cancelled)
        );
    }

    #[test]
    fn cancelled_budget_sends_nothing() {
        let completion = ollama_at("http://127.0.0.1:9".to_string());
        let budget = RunBudget::new(Duration::from_secs(30));
        budget.cancel_token().cancel();

        let err = completion.complete("print hi", &budget).unwrap_err();
        assert_eq!(
            err.downcast_ref::<BudgetError>(),
            Some(&BudgetError::Cancelled)
        );
    }

    #[test]
    fn parses_ollama_response() {
        let provider = ProviderConfig::default_for(ProviderKind::Ollama);
        let text = parse_response(&provider, r#"{"model":"llama3.2","response":"<script>echo hi</script>","done":true}"#)
            .expect("parse");
        assert_eq!(text, "<script>echo hi</script>");
    }

    #[test]
    fn parses_claude_text_blocks() {
        let provider = ProviderConfig::default_for(ProviderKind::Claude);
        let body = r#"{"id":"msg_1","content":[{"type":"text","text":"<script>"},{"type":"text","text":"echo hi</script>"}],"stop_reason":"end_turn"}"#;
        assert_eq!(
            parse_response(&provider, body).expect("parse"),
            "<script>echo hi</script>"
        );
    }

    #[test]
    fn parses_openai_first_choice() {
        let provider = ProviderConfig::default_for(ProviderKind::OpenAi);
        let body = r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"echo hi"}}]}"#;
        assert_eq!(parse_response(&provider, body).expect("parse"), "echo hi");
    }

    #[test]
    fn empty_completion_is_an_error() {
        let provider = ProviderConfig::default_for(ProviderKind::OpenAi);
        let err = parse_response(&provider, r#"{"choices":[]}"#).unwrap_err();
        assert!(err.to_string().contains("empty completion"));
    }

    #[test]
    fn malformed_body_is_an_error() {
        let provider = ProviderConfig::default_for(ProviderKind::Ollama);
        let err = parse_response(&provider, "<html>bad gateway</html>").unwrap_err();
        assert!(err.to_string().contains("parse ollama response"));
    }

    #[test]
    fn excerpt_prefers_json_error_message() {
        assert_eq!(
            excerpt(r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#),
            "invalid x-api-key"
        );
        assert_eq!(excerpt(r#"{"error":"model 'nope' not found"}"#), "model 'nope' not found");
        assert_eq!(excerpt("plain\ntext "), "plain text");
        assert_eq!(excerpt(&"x".repeat(2000)).len(), ERROR_BODY_EXCERPT_BYTES);
    }
}
