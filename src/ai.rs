use crate::config::ResearchConfig;
use crate::error::PipelineError;
use crate::limits::{CircuitBreaker, RateLimiter};
use crate::model::TokenUsage;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::sync::Arc;
use std::time::Duration;

/// One completed AI call: the raw model text plus metered usage.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// The single abstract call the pipeline makes against an AI provider.
/// Concrete backends are interchangeable; tests substitute scripted ones.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<Completion, PipelineError>;
}

/// Chat-completions response shape shared by OpenAI-compatible providers.
#[derive(Deserialize, Debug)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize, Debug)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize, Debug)]
struct ChatMessage {
    content: String,
}

#[derive(Deserialize, Debug, Default)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Backend speaking the OpenAI-compatible chat completions protocol.
pub struct OpenAiBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    input_usd_per_mtok: f64,
    output_usd_per_mtok: f64,
}

impl OpenAiBackend {
    /// Read endpoint, key and model from the environment (`.env` honored).
    /// `COMPANYINTEL_AI_API_KEY` is required; endpoint and model default to
    /// the OpenAI API and `gpt-4o-mini`.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        let api_key = env::var("COMPANYINTEL_AI_API_KEY")
            .map_err(|_| "COMPANYINTEL_AI_API_KEY not found in environment or .env file".to_string())?;
        let endpoint = env::var("COMPANYINTEL_AI_ENDPOINT")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let model =
            env::var("COMPANYINTEL_AI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            model,
            input_usd_per_mtok: 0.15,
            output_usd_per_mtok: 0.60,
        })
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    #[tracing::instrument(skip(self, prompt), fields(model = %self.model, prompt_len = prompt.len()))]
    async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<Completion, PipelineError> {
        let request_body = json!({
            "model": self.model,
            "messages": [
                { "role": "user", "content": prompt }
            ],
            "max_tokens": max_tokens,
            "temperature": 0.1,
        });

        let full_url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));
        tracing::debug!("Calling AI API: {}", full_url);

        let response = self
            .client
            .post(&full_url)
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .map_err(|e| PipelineError::TransientNetwork(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, "AI API returned error: {}", body);
            return Err(PipelineError::TransientNetwork(format!(
                "AI API status {}: {}",
                status, body
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::ModelResponseInvalid(e.to_string()))?;

        let text = parsed
            .choices
            .first()
            .map(|choice| choice.message.content.clone())
            .ok_or_else(|| PipelineError::ModelResponseInvalid("empty choices".to_string()))?;

        let usage = parsed.usage.unwrap_or_default();
        Ok(Completion {
            text,
            usage: TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                cost_usd: usage.prompt_tokens as f64 * self.input_usd_per_mtok / 1_000_000.0
                    + usage.completion_tokens as f64 * self.output_usd_per_mtok / 1_000_000.0,
            },
        })
    }
}

/// AI client every pipeline call goes through: rate limiter first, then
/// circuit breaker, then the backend, with a bounded retry loop around the
/// whole sequence.
pub struct GuardedAiClient {
    backend: Arc<dyn CompletionBackend>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    max_attempts: u32,
    acquire_timeout: Duration,
}

impl GuardedAiClient {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        config: &ResearchConfig,
    ) -> Self {
        Self {
            backend,
            limiter,
            breaker,
            max_attempts: config.ai_max_attempts,
            // A token has to show up within a couple of refill intervals or
            // the call is better spent elsewhere.
            acquire_timeout: Duration::from_secs_f64(
                (120.0 / config.rate_refill_per_minute).clamp(2.0, 30.0),
            ),
        }
    }

    /// Issue one guarded completion. Retries `RateLimitExceeded`,
    /// `CircuitOpen` and transport errors with exponential backoff; gives
    /// up after `max_attempts` and returns the last error.
    #[tracing::instrument(skip(self, prompt), fields(prompt_len = prompt.len()))]
    pub async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<Completion, PipelineError> {
        let mut last_error = PipelineError::TransientNetwork("no attempts made".to_string());

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let delay = Duration::from_millis(500 * 2u64.pow(attempt - 1));
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying AI call");
                tokio::time::sleep(delay).await;
            }

            if let Err(e) = self.limiter.acquire(self.acquire_timeout).await {
                tracing::warn!(attempt, "rate limiter rejected AI call: {}", e);
                last_error = e;
                continue;
            }

            let permit = match self.breaker.check() {
                Ok(permit) => permit,
                Err(e) => {
                    tracing::warn!(attempt, "circuit breaker rejected AI call: {}", e);
                    last_error = e;
                    continue;
                }
            };

            match self.backend.complete(prompt, max_tokens).await {
                Ok(completion) => {
                    permit.record_success();
                    return Ok(completion);
                }
                Err(e) => {
                    // A malformed-but-delivered response is a provider
                    // answer, not an outage; it should not trip the breaker.
                    match &e {
                        PipelineError::ModelResponseInvalid(_) => {
                            permit.record_success();
                            return Err(e);
                        }
                        _ => {
                            permit.record_failure();
                            tracing::warn!(attempt, "AI call failed: {}", e);
                            last_error = e;
                        }
                    }
                }
            }
        }

        Err(last_error)
    }
}

/// Pull a JSON value of type `T` out of model output.
///
/// Models wrap JSON in prose and code fences more often than not, so this
/// strips fences and falls back to the widest `{…}`/`[…]` slice before
/// giving up.
pub fn extract_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, PipelineError> {
    let trimmed = text.trim();

    let unfenced = if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        rest.trim_start_matches(['\r', '\n'])
            .strip_suffix("```")
            .unwrap_or(rest)
            .trim()
    } else {
        trimmed
    };

    if let Ok(value) = serde_json::from_str::<T>(unfenced) {
        return Ok(value);
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (unfenced.find(open), unfenced.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str::<T>(&unfenced[start..=end]) {
                    return Ok(value);
                }
            }
        }
    }

    Err(PipelineError::ModelResponseInvalid(format!(
        "no parseable JSON in {} chars of model output",
        text.len()
    )))
}

#[cfg(test)]
pub mod testing {
    //! Scripted backend for tests: returns queued responses in order, then
    //! repeats the final entry.

    use super::*;
    use std::sync::Mutex;

    pub enum ScriptedReply {
        Text(String),
        Fail(String),
    }

    pub struct ScriptedBackend {
        replies: Mutex<Vec<ScriptedReply>>,
        pub calls: std::sync::atomic::AtomicU64,
    }

    impl ScriptedBackend {
        pub fn new(replies: Vec<ScriptedReply>) -> Self {
            let mut replies = replies;
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                calls: std::sync::atomic::AtomicU64::new(0),
            }
        }

        pub fn always(text: &str) -> Self {
            Self::new(vec![ScriptedReply::Text(text.to_string())])
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(
            &self,
            _prompt: &str,
            _max_tokens: u32,
        ) -> Result<Completion, PipelineError> {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let mut replies = self.replies.lock().unwrap();
            let reply = if replies.len() > 1 {
                replies.pop().unwrap()
            } else {
                match replies.last() {
                    Some(ScriptedReply::Text(t)) => ScriptedReply::Text(t.clone()),
                    Some(ScriptedReply::Fail(m)) => ScriptedReply::Fail(m.clone()),
                    None => ScriptedReply::Fail("script exhausted".to_string()),
                }
            };
            match reply {
                ScriptedReply::Text(text) => Ok(Completion {
                    text,
                    usage: TokenUsage {
                        input_tokens: 100,
                        output_tokens: 20,
                        cost_usd: 0.0001,
                    },
                }),
                ScriptedReply::Fail(msg) => Err(PipelineError::TransientNetwork(msg)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ScriptedBackend, ScriptedReply};
    use super::*;
    use crate::limits::CircuitPhase;

    #[test]
    fn extract_json_handles_fences_and_prose() {
        let fenced = "```json\n[\"a\", \"b\"]\n```";
        let parsed: Vec<String> = extract_json(fenced).unwrap();
        assert_eq!(parsed, vec!["a", "b"]);

        let chatty = "Sure! Here is the result: {\"x\": 1} Hope that helps.";
        let parsed: serde_json::Value = extract_json(chatty).unwrap();
        assert_eq!(parsed["x"], 1);

        let err = extract_json::<serde_json::Value>("no json here");
        assert!(matches!(err, Err(PipelineError::ModelResponseInvalid(_))));
    }

    fn guarded(backend: ScriptedBackend, config: &ResearchConfig) -> GuardedAiClient {
        GuardedAiClient::new(
            Arc::new(backend),
            Arc::new(RateLimiter::new(config.rate_capacity, config.rate_refill_per_minute)),
            Arc::new(CircuitBreaker::new(
                config.breaker_failure_threshold,
                config.breaker_cooldown(),
                config.breaker_cooldown_cap(),
            )),
            config,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_then_succeeds() {
        let backend = ScriptedBackend::new(vec![
            ScriptedReply::Fail("reset".to_string()),
            ScriptedReply::Text("ok".to_string()),
        ]);
        let config = ResearchConfig::default();
        let client = guarded(backend, &config);

        let completion = client.complete("hello", 100).await.expect("second attempt");
        assert_eq!(completion.text, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn opens_breaker_after_sustained_failures() {
        let backend = ScriptedBackend::new(vec![ScriptedReply::Fail("down".to_string())]);
        let mut config = ResearchConfig::default();
        config.breaker_failure_threshold = 2;
        config.ai_max_attempts = 3;
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker_failure_threshold,
            config.breaker_cooldown(),
            config.breaker_cooldown_cap(),
        ));
        let client = GuardedAiClient::new(
            Arc::new(backend),
            Arc::new(RateLimiter::new(100, 6000.0)),
            Arc::clone(&breaker),
            &config,
        );

        assert!(client.complete("hello", 100).await.is_err());
        assert_eq!(breaker.phase(), CircuitPhase::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_response_does_not_count_as_outage() {
        struct BadJsonBackend;

        #[async_trait]
        impl CompletionBackend for BadJsonBackend {
            async fn complete(
                &self,
                _prompt: &str,
                _max_tokens: u32,
            ) -> Result<Completion, PipelineError> {
                Err(PipelineError::ModelResponseInvalid("not json".to_string()))
            }
        }

        let config = ResearchConfig::default();
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker_failure_threshold,
            config.breaker_cooldown(),
            config.breaker_cooldown_cap(),
        ));
        let client = GuardedAiClient::new(
            Arc::new(BadJsonBackend),
            Arc::new(RateLimiter::new(100, 6000.0)),
            Arc::clone(&breaker),
            &config,
        );

        let err = client.complete("hello", 100).await.expect_err("invalid");
        assert!(matches!(err, PipelineError::ModelResponseInvalid(_)));
        assert_eq!(breaker.phase(), CircuitPhase::Closed);
    }
}
