use async_trait::async_trait;
use serde_json::Value;

pub mod classifier;

pub type LlmError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// One completion round trip. `config` carries per-call overrides
    /// (model, temperature); transport failures surface as errors.
    async fn generate(&self, prompt: &str, config: &Value) -> Result<String, LlmError>;
}

pub struct OpenAIClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAIClient {
    pub fn new(api_key: String, base_url: Option<String>, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model,
        }
    }
}

#[async_trait]
impl LLMProvider for OpenAIClient {
    async fn generate(&self, prompt: &str, config: &Value) -> Result<String, LlmError> {
        let model = config["model"].as_str().unwrap_or(&self.model);
        let temperature = config["temperature"].as_f64().unwrap_or(0.2);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&serde_json::json!({
                "model": model,
                "messages": [{"role": "user", "content": prompt}],
                "temperature": temperature
            }))
            .send()
            .await?
            .error_for_status()?;

        let result: Value = response.json().await?;
        let content = result["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();

        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generate_extracts_message_content() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"choices":[{"message":{"role":"assistant","content":"hello"}}]}"#,
            )
            .create_async()
            .await;

        let client = OpenAIClient::new(
            "test-key".to_string(),
            Some(server.url()),
            "test-model".to_string(),
        );
        let out = client
            .generate("hi", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn generate_propagates_http_errors() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body("rate limited")
            .create_async()
            .await;

        let client = OpenAIClient::new(
            "test-key".to_string(),
            Some(server.url()),
            "test-model".to_string(),
        );
        assert!(client.generate("hi", &serde_json::json!({})).await.is_err());
    }
}
