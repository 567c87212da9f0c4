//! Claude Messages API client routed through a call gateway.
//!
//! Completions are cached under a digest of model and prompt, so repeated
//! prompts within the gateway's TTL cost no tokens.

use call_gateway::{http, CacheKey, Gateway, GatewayError, ProducerError, RetryPolicy};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Anthropic's "overloaded" status.
const OVERLOADED: u16 = 529;

#[derive(Clone)]
pub struct ClaudeClient {
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    client: Client,
    gateway: Arc<Gateway>,
    policy: RetryPolicy,
}

impl ClaudeClient {
    pub fn new(api_key: String, model: impl Into<String>, gateway: Arc<Gateway>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .unwrap_or_else(|_| Client::new());

        let mut policy = gateway.default_policy().clone();
        policy.retryable_statuses.insert(OVERLOADED);

        Self {
            api_key,
            model: model.into(),
            base_url: BASE_URL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            client,
            gateway,
            policy,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Single-turn completion. The first text block of the reply is returned.
    pub async fn complete(&self, prompt: &str) -> Result<String, GatewayError> {
        let key = CacheKey::digest("llm", &format!("{}\n{}", self.model, prompt));
        let url = format!("{}/v1/messages", self.base_url);
        let url = url.as_str();
        let request = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };
        let request = &request;

        self.gateway
            .fetch_with_policy(key.as_str(), self.gateway.default_ttl(), &self.policy, || async move {
                let response: MessagesResponse = http::send_json(
                    self.client
                        .post(url)
                        .header("x-api-key", self.api_key.as_str())
                        .header("anthropic-version", ANTHROPIC_VERSION)
                        .json(request),
                )
                .await?;
                response
                    .first_text()
                    .ok_or_else(|| ProducerError::Payload("response has no text block".to_string()))
            })
            .await
    }

    /// Peer tickers for `ticker`, as suggested by the model.
    pub async fn similar_companies(&self, ticker: &str, count: usize) -> Result<Vec<String>, GatewayError> {
        let ticker = ticker.to_uppercase();
        let prompt = format!(
            "List {count} publicly traded companies that are direct competitors or industry peers of {ticker}.\n\
             Reply with ticker symbols only, as a comma-separated list, with no other text.\n\
             Do not include {ticker} itself."
        );

        let reply = self.complete(&prompt).await?;
        let peers = parse_ticker_list(&reply, &ticker, count);
        tracing::debug!(ticker = %ticker, peers = ?peers, "Similar companies");
        Ok(peers)
    }

    /// The model's idea of `ticker`'s current share price. Only useful when
    /// no market data source answered; the figure may be stale.
    pub async fn current_price(&self, ticker: &str) -> Result<Option<f64>, GatewayError> {
        let ticker = ticker.to_uppercase();
        let prompt = format!(
            "What is the current stock price of {ticker}? \
             Please respond with only the numeric value (e.g., 123.45)."
        );

        let reply = self.complete(&prompt).await?;
        let price = extract_number(&reply).filter(|p| *p > 0.0);
        if price.is_none() {
            tracing::debug!(ticker = %ticker, reply = %reply, "No price in model reply");
        }
        Ok(price)
    }
}

/// Tickers from a comma- or newline-separated reply: trimmed, upper-cased,
/// deduplicated, `exclude` dropped, at most `count`.
pub fn parse_ticker_list(reply: &str, exclude: &str, count: usize) -> Vec<String> {
    let mut tickers: Vec<String> = Vec::new();
    for raw in reply.split([',', '\n']) {
        let ticker = raw
            .trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '.')
            .trim_end_matches('.')
            .to_uppercase();
        if ticker.is_empty() || ticker.len() > 5 || !ticker.chars().all(|c| c.is_ascii_alphanumeric() || c == '.') {
            continue;
        }
        if ticker.eq_ignore_ascii_case(exclude) || tickers.contains(&ticker) {
            continue;
        }
        tickers.push(ticker);
        if tickers.len() >= count {
            break;
        }
    }
    tickers
}

/// First decimal number in `text`, thousands separators allowed.
pub fn extract_number(text: &str) -> Option<f64> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(u8::is_ascii_digit)?;

    let mut number = String::new();
    if start > 0 && bytes[start - 1] == b'-' {
        number.push('-');
    }

    let mut seen_dot = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        let next_is_digit = bytes.get(i + 1).is_some_and(u8::is_ascii_digit);
        match b {
            b'0'..=b'9' => number.push(b as char),
            b',' if next_is_digit => {}
            b'.' if !seen_dot && next_is_digit => {
                seen_dot = true;
                number.push('.');
            }
            _ => break,
        }
    }

    number.parse().ok()
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

impl MessagesResponse {
    fn first_text(self) -> Option<String> {
        self.content
            .into_iter()
            .find(|block| block.block_type == "text")
            .and_then(|block| block.text)
    }
}
