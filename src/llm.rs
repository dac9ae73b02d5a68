use log::debug;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";

/// Model identifiers tried in order; first available wins.
pub const PRIMARY_MODELS: &[&str] = &[
    "llama-3.3-70b-versatile",
    "llama-3.1-8b-instant",
    "gemma2-9b-it",
];
/// Shorter list for the post-primary retry rounds.
pub const RETRY_MODELS: &[&str] = &["llama-3.1-8b-instant"];

#[derive(Debug, Error)]
pub enum LlmError {
    /// Provider backoff. The pool marks the key and the caller rotates.
    #[error("rate limited by the LLM provider")]
    RateLimited,
    /// Key rejected. Persistent for the credential.
    #[error("LLM authentication rejected")]
    Auth,
    /// Model retired or mistyped; skip it for the rest of the attempt.
    #[error("model not available: {0}")]
    ModelNotFound(String),
    #[error("LLM call timed out")]
    Timeout,
    #[error("LLM returned an empty completion")]
    Empty,
    /// 5xx and transport noise. Transient; never reported to the pool.
    #[error("LLM upstream error: {0}")]
    Upstream(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage { role: "system", content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage { role: "user", content: content.into() }
    }
}

pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
}

impl ChatClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        ChatClient {
            http: reqwest::Client::new(),
            base_url,
        }
    }

    /// One chat-completion call on one credential with a hard per-call
    /// timeout. Error kinds tell the generator whether to rotate the key,
    /// skip the model, or just try again.
    pub async fn complete(
        &self,
        api_key: &str,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let res = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .timeout(timeout)
            .json(&json!({
                "model": model,
                "messages": messages,
                "temperature": temperature,
                "max_tokens": max_tokens,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Upstream(e.to_string())
                }
            })?;

        let status = res.status();
        if !status.is_success() {
            let body: serde_json::Value = res.json().await.unwrap_or_default();
            let code = body["error"]["code"].as_str().unwrap_or("");
            return Err(match status.as_u16() {
                429 => LlmError::RateLimited,
                401 | 403 => LlmError::Auth,
                404 => LlmError::ModelNotFound(model.to_string()),
                _ if code == "model_not_found" || code == "model_decommissioned" => {
                    LlmError::ModelNotFound(model.to_string())
                }
                _ => LlmError::Upstream(format!("{} {}", status, body)),
            });
        }

        let body: serde_json::Value = res
            .json()
            .await
            .map_err(|e| LlmError::Upstream(e.to_string()))?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::trim)
            .unwrap_or("");
        if content.is_empty() {
            return Err(LlmError::Empty);
        }
        debug!("completion from {}: {} chars", model, content.len());
        Ok(content.to_string())
    }
}

impl Default for ChatClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn client_for(server: &MockServer) -> ChatClient {
        ChatClient::with_base_url(server.uri())
    }

    fn messages() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("You are a support assistant."),
            ChatMessage::user("hello"),
        ]
    }

    #[tokio::test]
    async fn test_complete_extracts_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer gsk-test"))
            .and(body_partial_json(json!({"model": "llama-3.1-8b-instant"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "  answer text  "}}]
            })))
            .mount(&server)
            .await;

        let client = client_for(&server).await;
        let out = client
            .complete("gsk-test", "llama-3.1-8b-instant", &messages(), 0.7, 256, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(out, "answer text");
    }

    #[tokio::test]
    async fn test_status_mapping() {
        for (status, check) in [
            (429, LlmError::RateLimited),
            (401, LlmError::Auth),
            (404, LlmError::ModelNotFound(String::new())),
            (500, LlmError::Upstream(String::new())),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/chat/completions"))
                .respond_with(ResponseTemplate::new(status).set_body_json(json!({})))
                .mount(&server)
                .await;
            let client = client_for(&server).await;
            let err = client
                .complete("k", "m", &messages(), 0.7, 256, TIMEOUT)
                .await
                .unwrap_err();
            assert_eq!(
                std::mem::discriminant(&err),
                std::mem::discriminant(&check),
                "status {} mapped to {:?}",
                status,
                err
            );
        }
    }

    #[tokio::test]
    async fn test_model_not_found_from_error_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"code": "model_decommissioned"}
            })))
            .mount(&server)
            .await;
        let client = client_for(&server).await;
        let err = client
            .complete("k", "old-model", &messages(), 0.7, 256, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::ModelNotFound(m) if m == "old-model"));
    }

    #[tokio::test]
    async fn test_empty_completion_is_a_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "   "}}]
            })))
            .mount(&server)
            .await;
        let client = client_for(&server).await;
        let err = client
            .complete("k", "m", &messages(), 0.7, 256, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Empty));
    }
}
