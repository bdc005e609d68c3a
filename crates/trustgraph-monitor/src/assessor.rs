//! Qualitative Assessor.
//!
//! Builds a fixed-format prompt from the agent, its factors and a capped
//! sample of recent transactions, asks an external text-completion service
//! for a short narrative, and attaches a locally computed confidence. The
//! model's output is used verbatim as the narrative and nothing else is
//! parsed out of it. Any failure (timeout, HTTP error, empty reply) yields
//! the fixed fallback narrative with confidence 0.6.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use serde::{Deserialize, Serialize};
use serde_json::json;

use trustgraph_core::{
    Agent, Transaction, TrustError, TrustScoreFactors, BASE_UNITS_PER_TOKEN, FALLBACK_CONFIDENCE,
    FALLBACK_NARRATIVE, MAX_CONFIDENCE,
};

const MAX_COMPLETION_TOKENS: u32 = 500;

// ============================================================================
// Text completion collaborator
// ============================================================================

/// Single-turn prompt → free text.
#[async_trait]
pub trait TextCompletion: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, TrustError>;
}

/// Used when no model credentials are configured. Always fails, so every
/// assessment takes the fallback path.
pub struct DisabledCompletion;

#[async_trait]
impl TextCompletion for DisabledCompletion {
    async fn complete(&self, _prompt: &str) -> Result<String, TrustError> {
        Err(TrustError::DataSource("text completion is not configured".into()))
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model:      &'a str,
    messages:   [ChatMessage<'a>; 1],
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role:    &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `POST {base}/chat/completions` client.
pub struct ChatCompletionClient {
    url:     String,
    api_key: String,
    model:   String,
    http:    reqwest::Client,
}

impl ChatCompletionClient {
    pub fn new(base_url: &str, api_key: String, model: String) -> Result<Self, TrustError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| TrustError::DataSource(format!("LLM client init: {e}")))?;
        Ok(Self {
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
            model,
            http,
        })
    }
}

#[async_trait]
impl TextCompletion for ChatCompletionClient {
    async fn complete(&self, prompt: &str) -> Result<String, TrustError> {
        let req = ChatRequest {
            model:      &self.model,
            messages:   [ChatMessage { role: "user", content: prompt }],
            max_tokens: MAX_COMPLETION_TOKENS,
        };
        let resp: ChatResponse = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| TrustError::DataSource(format!("LLM HTTP error: {e}")))?
            .error_for_status()
            .map_err(|e| TrustError::DataSource(format!("LLM status: {e}")))?
            .json()
            .await
            .map_err(|e| TrustError::DataSource(format!("LLM response parse error: {e}")))?;

        resp.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| TrustError::DataSource("LLM returned no completion".into()))
    }
}

// ============================================================================
// Assessment
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assessment {
    pub narrative:  String,
    /// Risk signal fed to the score blend. Always the deterministic factor.
    pub risk_level: f64,
    pub confidence: f64,
    /// True when the narrative is the fixed fallback.
    pub fallback:   bool,
}

pub struct AssessmentInput<'a> {
    pub agent:       &'a Agent,
    /// The analysis window, newest first.
    pub recent:      &'a [Transaction],
    pub factors:     &'a TrustScoreFactors,
    pub open_alerts: usize,
}

/// More history, more confidence; capped below certainty.
pub fn confidence_for(transaction_count: usize) -> f64 {
    (0.5 + (transaction_count as f64 / 200.0) * 0.45).min(MAX_CONFIDENCE)
}

pub struct QualitativeAssessor {
    completion: Arc<dyn TextCompletion>,
    timeout:    Duration,
    /// Recent transactions summarised in the prompt.
    sample:     usize,
}

impl QualitativeAssessor {
    pub fn new(completion: Arc<dyn TextCompletion>, timeout: Duration, sample: usize) -> Self {
        Self { completion, timeout, sample }
    }

    /// Never fails; degrades to the fallback narrative instead.
    pub async fn assess(&self, input: &AssessmentInput<'_>) -> Assessment {
        let prompt = self.build_prompt(input);
        let risk_level = input.factors.risk_level;

        let reply = match tokio::time::timeout(self.timeout, self.completion.complete(&prompt)).await {
            Ok(r) => r,
            Err(_) => Err(TrustError::DataSource(format!(
                "completion timed out after {}s",
                self.timeout.as_secs_f32()
            ))),
        };

        match reply {
            Ok(narrative) => Assessment {
                narrative,
                risk_level,
                confidence: confidence_for(input.recent.len()),
                fallback: false,
            },
            Err(e) => {
                tracing::warn!(agent = %input.agent.address, "Assessment fell back: {e}");
                Assessment {
                    narrative:  FALLBACK_NARRATIVE.to_string(),
                    risk_level,
                    confidence: FALLBACK_CONFIDENCE,
                    fallback:   true,
                }
            }
        }
    }

    /// Deterministic for identical inputs.
    pub fn build_prompt(&self, input: &AssessmentInput<'_>) -> String {
        let agent = input.agent;
        let f = input.factors;
        let sample: Vec<_> = input
            .recent
            .iter()
            .take(self.sample)
            .map(|tx| {
                json!({
                    "value": format_tokens(tx.value),
                    "status": tx.status.as_str(),
                    "timestamp": iso8601(tx.timestamp),
                })
            })
            .collect();
        let shown = sample.len();
        let sample = serde_json::to_string_pretty(&sample).unwrap_or_else(|_| "[]".into());

        format!(
            "You are an AI agent trust analysis expert. Analyze the following blockchain agent \
behavior and provide a comprehensive trust assessment.

Agent Information:
- Name: {name}
- Type: {category}
- Address: {address}
- Total Transactions: {count}
- Current Trust Score: {score}

Trust Score Factors:
- Transaction Volume: {volume}/100
- Transaction Frequency: {frequency}/100
- Gas Efficiency: {gas}/100
- Success Rate: {success}/100
- Behavioral Consistency: {consistency}/100
- Risk Level: {risk}/100

Recent Transactions (last {shown}):
{sample}

Active Alerts: {alerts}

Provide a detailed analysis covering:
1. Overall trustworthiness assessment
2. Key behavioral patterns observed
3. Potential risks or concerns
4. Recommendations for monitoring

Keep the analysis concise but comprehensive (3-5 sentences).",
            name = agent.name,
            category = agent.category,
            address = agent.address,
            count = input.recent.len(),
            score = agent.trust_score,
            volume = f.transaction_volume,
            frequency = f.transaction_frequency,
            gas = f.gas_efficiency,
            success = f.success_rate,
            consistency = f.behavioral_consistency,
            risk = f.risk_level,
            alerts = input.open_alerts,
        )
    }
}

/// Exact decimal rendering of base units as whole tokens, trailing zeros
/// trimmed (`1500000000000000000` → `1.5`).
pub fn format_tokens(base_units: u128) -> String {
    let unit = BASE_UNITS_PER_TOKEN as u128;
    let whole = base_units / unit;
    let frac = base_units % unit;
    if frac == 0 {
        return format!("{whole}.0");
    }
    let frac = format!("{frac:018}");
    format!("{whole}.{}", frac.trim_end_matches('0'))
}

fn iso8601(unix_secs: u64) -> String {
    i64::try_from(unix_secs)
        .ok()
        .and_then(|s| DateTime::from_timestamp(s, 0))
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| unix_secs.to_string())
}
