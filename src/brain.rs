use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ModelSettings;
use crate::types::Usage;

/// One request to the reasoning service.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub stop: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Worth retrying: overload, rate limit, network trouble.
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// Request/response contract of the model behind the agent.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError>;

    /// Model identifier, recorded in session logs.
    fn model(&self) -> &str {
        "unknown"
    }
}

/// Call the service, retrying transient errors up to `attempts` times.
///
/// `on_retry` sees every transient error before the next attempt.
pub async fn complete_with_retries<F>(
    service: &dyn ReasoningService,
    request: &CompletionRequest,
    attempts: u32,
    mut on_retry: F,
) -> Result<Completion, ProviderError>
where
    F: FnMut(u32, &ProviderError),
{
    let mut last = ProviderError::Transient("no attempt made".to_string());
    for attempt in 1..=attempts.max(1) {
        match service.complete(request).await {
            Ok(completion) => return Ok(completion),
            Err(err) if err.is_transient() => {
                warn!(target: "brain", attempt, error = %err, "reasoning service call failed");
                on_retry(attempt, &err);
                last = err;
            }
            Err(err) => return Err(err),
        }
    }
    Err(last)
}

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAiClient {
    client: Client,
    settings: ModelSettings,
}

impl OpenAiClient {
    pub fn new(settings: ModelSettings) -> Self {
        Self {
            client: Client::new(),
            settings,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.settings.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ReasoningService for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let mut body = json!({
            "model": self.settings.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens,
        });
        if let Some(stop) = &request.stop {
            body["stop"] = json!([stop]);
        }

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.settings.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let status = response.status();
        let json_resp: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("unreadable response body: {e}")))?;

        if !status.is_success() {
            let err_msg = json_resp["error"]["message"]
                .as_str()
                .unwrap_or("Unknown API error");
            return Err(classify(status, err_msg));
        }

        let content = json_resp["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ProviderError::Fatal(format!("No content in LLM response: {json_resp}")))?;
        debug!(target: "brain", %content, "model replied");

        Ok(Completion {
            text: content.trim().to_string(),
            usage: parse_usage(&json_resp["usage"]),
        })
    }

    fn model(&self) -> &str {
        &self.settings.model
    }
}

fn classify(status: StatusCode, message: &str) -> ProviderError {
    let text = format!("API error ({status}): {message}");
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || message.contains("server error")
    {
        ProviderError::Transient(text)
    } else {
        ProviderError::Fatal(text)
    }
}

fn parse_usage(usage: &Value) -> Usage {
    let field = |name: &str| usage[name].as_u64().unwrap_or(0);
    Usage {
        prompt_tokens: field("prompt_tokens"),
        completion_tokens: field("completion_tokens"),
        total_tokens: field("total_tokens"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedService;

    fn request() -> CompletionRequest {
        CompletionRequest {
            system: "s".into(),
            prompt: "p".into(),
            stop: None,
        }
    }

    #[test]
    fn server_errors_and_rate_limits_are_transient() {
        assert!(classify(StatusCode::BAD_GATEWAY, "upstream").is_transient());
        assert!(classify(StatusCode::TOO_MANY_REQUESTS, "slow down").is_transient());
        assert!(classify(StatusCode::BAD_REQUEST, "The server error was logged").is_transient());
        assert!(!classify(StatusCode::UNAUTHORIZED, "bad key").is_transient());
    }

    #[test]
    fn usage_defaults_missing_counters_to_zero() {
        let usage = parse_usage(&json!({"prompt_tokens": 12, "total_tokens": 20}));
        assert_eq!(
            usage,
            Usage {
                prompt_tokens: 12,
                completion_tokens: 0,
                total_tokens: 20
            }
        );
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let service = ScriptedService::new(vec![
            Err(ProviderError::Transient("busy".into())),
            Ok("<Action>finish()</Action>".into()),
        ]);
        let mut retries = 0;
        let completion = complete_with_retries(&service, &request(), 3, |_, _| retries += 1)
            .await
            .unwrap();
        assert_eq!(completion.text, "<Action>finish()</Action>");
        assert_eq!(retries, 1);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let service = ScriptedService::new(vec![
            Err(ProviderError::Fatal("bad key".into())),
            Ok("unused".into()),
        ]);
        let err = complete_with_retries(&service, &request(), 3, |_, _| {})
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::Fatal("bad key".into()));
        assert_eq!(service.calls(), 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let service = ScriptedService::new(vec![
            Err(ProviderError::Transient("a".into())),
            Err(ProviderError::Transient("b".into())),
            Err(ProviderError::Transient("c".into())),
            Ok("late".into()),
        ]);
        let err = complete_with_retries(&service, &request(), 3, |_, _| {})
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::Transient("c".into()));
        assert_eq!(service.calls(), 3);
    }
}
