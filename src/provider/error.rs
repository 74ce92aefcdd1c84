use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::LLMError;
use crate::retry::retry_after_from_headers;

/// Classifies a non-2xx response into the crate's error taxonomy.
///
/// The body message is pulled from `{"error": {"message": ..}}` (OpenAI, Anthropic),
/// `{"error": "..."}` (Hugging Face) or used raw when it is not JSON.
pub(crate) fn parse_http_error(
    provider: &'static str,
    status: u16,
    headers: &HashMap<String, String>,
    body: &str,
) -> LLMError {
    let message = error_message(body).unwrap_or_else(|| {
        if body.trim().is_empty() {
            format!("status {status}")
        } else {
            body.trim().to_string()
        }
    });

    match status {
        401 | 403 => LLMError::Unauthorized { message },
        429 => LLMError::RateLimited {
            message,
            retry_after: retry_after_from_headers(headers),
        },
        408 | 504 => LLMError::Timeout { message },
        _ => LLMError::ServiceError {
            provider,
            status,
            message,
        },
    }
}

fn error_message(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<Value>,
        message: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    match parsed.error {
        Some(Value::String(text)) => Some(text),
        Some(Value::Object(inner)) => {
            let mut message = inner
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            let code = inner
                .get("code")
                .and_then(Value::as_str)
                .or_else(|| inner.get("type").and_then(Value::as_str));
            if let Some(code) = code {
                message = format!("{message} ({code})");
            }
            Some(message)
        }
        _ => parsed.message,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn parse_auth_and_rate_limit_errors() {
        let body = r#"{
  "error": {
    "type": "authentication_error",
    "message": "Invalid API key provided",
    "code": "invalid_api_key"
  }
}"#;
        let err = parse_http_error("openai", 401, &HashMap::new(), body);
        match err {
            LLMError::Unauthorized { message } => {
                assert!(message.contains("Invalid API key provided"));
                assert!(message.contains("invalid_api_key"));
            }
            other => panic!("expected Unauthorized, got {other:?}"),
        }

        let headers = HashMap::from([("retry-after".to_string(), "2".to_string())]);
        let body = r#"{"error": {"type": "rate_limit_error", "message": "Too many requests"}}"#;
        let err = parse_http_error("anthropic", 429, &headers, body);
        match err {
            LLMError::RateLimited {
                message,
                retry_after,
            } => {
                assert!(message.contains("Too many requests"));
                assert!(message.contains("rate_limit_error"));
                assert_eq!(retry_after, Some(Duration::from_secs(2)));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn parse_string_error_and_raw_bodies() {
        let body = r#"{"error": "Model gpt2 is currently loading", "estimated_time": 20.0}"#;
        let err = parse_http_error("generic", 503, &HashMap::new(), body);
        match err {
            LLMError::ServiceError {
                provider,
                status,
                message,
            } => {
                assert_eq!(provider, "generic");
                assert_eq!(status, 503);
                assert_eq!(message, "Model gpt2 is currently loading");
            }
            other => panic!("expected ServiceError, got {other:?}"),
        }

        let err = parse_http_error("openai", 500, &HashMap::new(), "upstream exploded");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("upstream exploded"));
    }

    #[test]
    fn gateway_timeouts_map_to_timeout() {
        let err = parse_http_error("openai", 504, &HashMap::new(), "");
        match err {
            LLMError::Timeout { message } => assert_eq!(message, "status 504"),
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn client_errors_are_not_retryable() {
        let body = r#"{"error": {"message": "bad model", "code": "model_not_found"}}"#;
        let err = parse_http_error("openai", 404, &HashMap::new(), body);
        assert!(matches!(err, LLMError::ServiceError { status: 404, .. }));
        assert!(!err.is_retryable());
    }
}
