use serde::{Deserialize, Serialize};

use super::OracleError;

const OPENAI_DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiError {
    error: OpenAiErrorDetail,
}

#[derive(Deserialize)]
struct OpenAiErrorDetail {
    message: String,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Send a chat completion request to an OpenAI-compatible API.
/// `base_url` override covers Groq, OpenRouter, Azure and friends.
#[allow(clippy::too_many_arguments)]
pub async fn send_chat_completion(
    http: &reqwest::Client,
    api_key: &str,
    base_url: Option<&str>,
    model: &str,
    max_tokens: u32,
    temperature: Option<f64>,
    system: &str,
    user: &str,
) -> Result<String, OracleError> {
    let start = std::time::Instant::now();

    let base = base_url.unwrap_or(OPENAI_DEFAULT_BASE_URL);
    let url = format!("{}/chat/completions", base.trim_end_matches('/'));

    let request = ChatCompletionRequest {
        model,
        max_tokens,
        messages: vec![
            ChatMessage {
                role: "system",
                content: system,
            },
            ChatMessage {
                role: "user",
                content: user,
            },
        ],
        temperature,
    };

    let response = http
        .post(&url)
        .bearer_auth(api_key)
        .json(&request)
        .send()
        .await
        .map_err(|e| OracleError::Http(e.to_string()))?;

    let status = response.status();
    let latency = start.elapsed().as_secs_f64();
    metrics::histogram!("oracle.api.latency", "provider" => "openai", "model" => model.to_string())
        .record(latency);

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        let body = response.text().await.unwrap_or_default();
        return Err(OracleError::Auth(format!("{}: {}", status, body)));
    }

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());
        return Err(OracleError::RateLimited { retry_after });
    }

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let msg = match serde_json::from_str::<OpenAiError>(&body) {
            Ok(e) => e.error.message,
            Err(_) => body,
        };
        return Err(OracleError::Api(format!("{}: {}", status, msg)));
    }

    let body: ChatCompletionResponse = response
        .json()
        .await
        .map_err(|e| OracleError::Parse(format!("Failed to parse completion response: {}", e)))?;

    body.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|text| !text.is_empty())
        .ok_or_else(|| OracleError::Parse("completion response had no content".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion_response() {
        let json = r#"{
            "choices": [{"message": {"role": "assistant", "content": "{\"needs_context\": \"no\"}"}}]
        }"#;

        let resp: ChatCompletionResponse = serde_json::from_str(json).unwrap();
        let content = resp.choices[0].message.content.as_deref().unwrap();
        assert!(content.contains("needs_context"));
    }
}
