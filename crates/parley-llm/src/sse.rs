use serde::Deserialize;

use parley_core::errors::GatewayError;
use parley_core::stream::CompletionChunk;

/// One decoded `data:` payload from a chat-completions stream.
#[derive(Clone, Debug)]
pub enum SseFrame {
    Chunk(CompletionChunk),
    Done,
    Error(GatewayError),
}

/// Decode a single `data:` payload. Payloads with no choices (keep-alives,
/// usage-only frames) yield `None`.
pub fn parse_data(data: &str) -> Option<SseFrame> {
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseFrame::Done);
    }

    let payload: ChunkPayload = match serde_json::from_str(data) {
        Ok(p) => p,
        Err(e) => return Some(SseFrame::Error(GatewayError::MalformedChunk(e.to_string()))),
    };

    if let Some(err) = payload.error {
        return Some(SseFrame::Error(classify_error(&err)));
    }

    let choice = payload.choices.into_iter().next()?;
    Some(SseFrame::Chunk(CompletionChunk {
        delta: choice.delta.and_then(|d| d.content).unwrap_or_default(),
        finish_reason: choice.finish_reason,
    }))
}

fn classify_error(err: &ErrorPayload) -> GatewayError {
    match err.code.as_deref().or(err.error_type.as_deref()) {
        Some("rate_limit_exceeded") | Some("insufficient_quota") => {
            GatewayError::RateLimited { retry_after: None }
        }
        Some("invalid_api_key") | Some("authentication_error") => {
            GatewayError::AuthenticationFailed(err.message.clone())
        }
        Some("server_error") => GatewayError::ServerError {
            status: 500,
            body: err.message.clone(),
        },
        _ => GatewayError::InvalidRequest(err.message.clone()),
    }
}

/// Split raw SSE text into `data:` payloads, one per event. Multi-line data
/// is joined with `\n`; comment lines are skipped.
pub fn parse_sse_lines(raw: &str) -> Vec<String> {
    let mut payloads = Vec::new();
    let mut current: Option<String> = None;

    for line in raw.lines() {
        if line.is_empty() {
            if let Some(data) = current.take() {
                payloads.push(data);
            }
        } else if line.starts_with(':') {
            continue;
        } else if let Some(data) = line.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            match &mut current {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(data);
                }
                None => current = Some(data.to_string()),
            }
        }
    }

    // Trailing event without blank line
    if let Some(data) = current {
        payloads.push(data);
    }

    payloads
}

#[derive(Deserialize)]
struct ChunkPayload {
    #[serde(default)]
    choices: Vec<ChoicePayload>,
    error: Option<ErrorPayload>,
}

#[derive(Deserialize)]
struct ChoicePayload {
    delta: Option<DeltaPayload>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct DeltaPayload {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(frame: Option<SseFrame>) -> CompletionChunk {
        match frame {
            Some(SseFrame::Chunk(c)) => c,
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn parse_role_preamble_as_empty_delta() {
        let c = chunk(parse_data(
            r#"{"id":"c1","choices":[{"index":0,"delta":{"role":"assistant"},"finish_reason":null}]}"#,
        ));
        assert_eq!(c.delta, "");
        assert!(c.finish_reason.is_none());
    }

    #[test]
    fn parse_content_and_finish() {
        let c = chunk(parse_data(
            r#"{"choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}]}"#,
        ));
        assert_eq!(c.delta, "Hello");

        let c = chunk(parse_data(
            r#"{"choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#,
        ));
        assert_eq!(c.delta, "");
        assert_eq!(c.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn parse_done_marker() {
        assert!(matches!(parse_data("[DONE]"), Some(SseFrame::Done)));
    }

    #[test]
    fn frames_without_choices_are_skipped() {
        assert!(parse_data(r#"{"choices":[],"usage":{"prompt_tokens":3}}"#).is_none());
        assert!(parse_data("   ").is_none());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            parse_data("{not json"),
            Some(SseFrame::Error(GatewayError::MalformedChunk(_)))
        ));
    }

    #[test]
    fn error_payload_is_classified() {
        let frame = parse_data(
            r#"{"error":{"message":"slow down","type":"requests","code":"rate_limit_exceeded"}}"#,
        );
        assert!(matches!(
            frame,
            Some(SseFrame::Error(GatewayError::RateLimited { .. }))
        ));

        let frame = parse_data(r#"{"error":{"message":"bad key","type":"invalid_request_error","code":"invalid_api_key"}}"#);
        assert!(matches!(
            frame,
            Some(SseFrame::Error(GatewayError::AuthenticationFailed(_)))
        ));
    }

    #[test]
    fn parse_sse_lines_basic() {
        let raw = ": keep-alive\n\ndata: {\"a\":1}\n\ndata: [DONE]\n\n";
        let payloads = parse_sse_lines(raw);
        assert_eq!(payloads, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn parse_sse_lines_joins_multiline_and_trailing() {
        let raw = "data: first\ndata: second\n\ndata: tail";
        let payloads = parse_sse_lines(raw);
        assert_eq!(payloads, vec!["first\nsecond".to_string(), "tail".to_string()]);
    }
}
