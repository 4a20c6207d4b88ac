//! LLM Worker
//!
//! Produces compression summaries by calling an OpenAI-compatible
//! `/v1/chat/completions` endpoint, either a local llama-server or a hosted API.
use crate::config::ContextConfig;
use crate::context_engine::Summarizer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

pub struct LLMWorker {
    backend_url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
    http_client: reqwest::Client,
}

impl LLMWorker {
    pub fn new(config: &ContextConfig) -> Self {
        info!("LLM worker initialized with backend: {}", config.llm_base_url);
        // backstop only; the engine applies the real deadline
        let backstop = config.summary_timeout().saturating_mul(2);
        let http_client = match reqwest::Client::builder().timeout(backstop).build() {
            Ok(client) => client,
            Err(e) => {
                warn!(
                    "Failed to build HTTP client with {:?} timeout ({}), using defaults without one",
                    backstop, e
                );
                reqwest::Client::new()
            }
        };
        Self {
            backend_url: config.llm_base_url.trim_end_matches('/').to_string(),
            model: config.model_name.clone(),
            api_key: config.llm_api_key.clone(),
            max_tokens: config.summary_max_tokens,
            temperature: config.summary_temperature,
            http_client,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.backend_url)
    }

    /// Single-shot, non-streaming completion of one user message.
    pub async fn generate_response(&self, prompt: &str) -> anyhow::Result<String> {
        debug!("LLM worker generating response ({} chars of prompt)", prompt.len());
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: false,
        };

        let mut builder = self.http_client.post(self.completions_url()).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("LLM backend request failed: {}", e))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("LLM backend returned {}: {}", status, body));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse LLM response: {}", e))?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("LLM backend returned no content"))?;
        Ok(content)
    }
}

#[async_trait]
impl Summarizer for LLMWorker {
    async fn generate_summary(&self, prompt: &str) -> anyhow::Result<String> {
        self.generate_response(prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn worker_for(url: &str) -> LLMWorker {
        let config = ContextConfig {
            llm_base_url: url.to_string(),
            llm_api_key: Some("test-key".to_string()),
            model_name: "test-model".to_string(),
            ..ContextConfig::default()
        };
        LLMWorker::new(&config)
    }

    #[test]
    fn test_huge_timeout_does_not_overflow_backstop() {
        let config = ContextConfig {
            summary_timeout_seconds: u64::MAX,
            ..ContextConfig::default()
        };
        let worker = LLMWorker::new(&config);
        assert_eq!(worker.completions_url(), "http://127.0.0.1:8081/v1/chat/completions");
    }

    #[tokio::test]
    async fn test_summary_is_taken_from_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "model": "test-model",
                "stream": false
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"<conversation_summary/>"}}]}"#)
            .create_async()
            .await;

        let worker = worker_for(&server.url());
        let summary = worker.generate_summary("summarize").await.unwrap();
        assert_eq!(summary, "<conversation_summary/>");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_backend_error_status_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .with_body("overloaded")
            .create_async()
            .await;

        let worker = worker_for(&server.url());
        let err = worker.generate_summary("summarize").await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_empty_choices_are_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        let worker = worker_for(&server.url());
        assert!(worker.generate_summary("summarize").await.is_err());
    }
}
