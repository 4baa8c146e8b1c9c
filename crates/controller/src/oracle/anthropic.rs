use serde::{Deserialize, Serialize};

use super::OracleError;

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<AnthropicMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Serialize)]
struct AnthropicMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Deserialize)]
struct AnthropicErrorDetail {
    message: String,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Send a single-turn messages request to the Anthropic API.
pub async fn send_messages(
    http: &reqwest::Client,
    api_key: &str,
    model: &str,
    max_tokens: u32,
    temperature: Option<f64>,
    system: &str,
    user: &str,
) -> Result<String, OracleError> {
    let start = std::time::Instant::now();

    let request = AnthropicRequest {
        model,
        max_tokens,
        system,
        messages: vec![AnthropicMessage {
            role: "user",
            content: user,
        }],
        temperature,
    };

    let response = http
        .post(ANTHROPIC_MESSAGES_URL)
        .header("x-api-key", api_key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .header("content-type", "application/json")
        .json(&request)
        .send()
        .await
        .map_err(|e| OracleError::Http(e.to_string()))?;

    let status = response.status();
    let latency = start.elapsed().as_secs_f64();
    metrics::histogram!("oracle.api.latency", "provider" => "anthropic", "model" => model.to_string())
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
        let msg = match serde_json::from_str::<AnthropicError>(&body) {
            Ok(e) => e.error.message,
            Err(_) => body,
        };
        return Err(OracleError::Api(format!("{}: {}", status, msg)));
    }

    let body: AnthropicResponse = response
        .json()
        .await
        .map_err(|e| OracleError::Parse(format!("Failed to parse Anthropic response: {}", e)))?;

    let text: String = body
        .content
        .into_iter()
        .filter_map(|block| match block {
            AnthropicContentBlock::Text { text } => Some(text),
            AnthropicContentBlock::Other => None,
        })
        .collect::<Vec<_>>()
        .join("");

    if text.is_empty() {
        return Err(OracleError::Parse("Anthropic response had no text".into()));
    }

    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_response() {
        let json = r#"{
            "content": [{"type": "text", "text": "{\"steps\": [\"coding\"]}"}]
        }"#;

        let resp: AnthropicResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.content.len(), 1);
        match &resp.content[0] {
            AnthropicContentBlock::Text { text } => {
                assert!(text.contains("coding"));
            }
            _ => panic!("Expected text block"),
        }
    }
}
