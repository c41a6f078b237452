use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::conversation::Turn;
use crate::error::ProviderError;

/// Stateless chat completion capability.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Completes the ordered conversation, system turn first.
    async fn complete(&self, model: &str, messages: &[Turn]) -> Result<String, ProviderError>;
}

/// OpenAI-compatible `/chat/completions` client (OpenAI, Ollama, LM Studio, vLLM...).
#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: String,
    client: reqwest::Client,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: String, client: reqwest::Client) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key,
            client,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[async_trait]
impl CompletionProvider for LlmClient {
    async fn complete(&self, model: &str, messages: &[Turn]) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let mut req = self.client.post(&url).json(&request);

        // Local models run without a key
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            return Err(classify_status(status, body));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;

        parse_completion(completion)
    }
}

fn classify_status(status: u16, body: String) -> ProviderError {
    match status {
        401 | 403 => ProviderError::Auth { status, body },
        402 | 429 => ProviderError::Quota { status, body },
        _ => ProviderError::Status { status, body },
    }
}

fn parse_completion(completion: ChatCompletionResponse) -> Result<String, ProviderError> {
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or(ProviderError::EmptyResponse)?;

    choice
        .message
        .content
        .ok_or_else(|| ProviderError::MalformedResponse("choice has no content".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_turns_in_openai_shape() {
        let turns = vec![Turn::system("be kind"), Turn::user("hi")];
        let request = ChatCompletionRequest {
            model: "gpt-4o-mini",
            messages: &turns,
            temperature: None,
            max_tokens: Some(256),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["model"], "gpt-4o-mini");
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["content"], "hi");
        assert_eq!(value["max_tokens"], 256);
        assert!(value.get("temperature").is_none());
    }

    #[test]
    fn completion_takes_first_choice() {
        let completion: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"hello"}},{"message":{"content":"other"}}]}"#,
        )
        .unwrap();
        assert_eq!(parse_completion(completion).unwrap(), "hello");
    }

    #[test]
    fn empty_choices_is_an_error() {
        let completion: ChatCompletionResponse =
            serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(
            parse_completion(completion),
            Err(ProviderError::EmptyResponse)
        ));
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        assert!(matches!(
            classify_status(401, String::new()),
            ProviderError::Auth { .. }
        ));
        assert!(matches!(
            classify_status(429, String::new()),
            ProviderError::Quota { .. }
        ));
        assert!(matches!(
            classify_status(500, String::new()),
            ProviderError::Status { status: 500, .. }
        ));
    }
}
