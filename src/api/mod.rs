pub mod context;

use crate::server::AppState;
use bytes::Bytes;
use context::{full_body, BoxBody, RequestContext};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const MAX_BODY_BYTES: usize = 1 << 20;

/// Routes the two endpoints this service exposes. Any other path/method
/// gets a 404 — there is no router crate here, two routes don't need one.
pub async fn handle_request(
    req: Request<Incoming>,
    state: AppState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&hyper::Method::GET, "/healthz") => Ok(healthz(&state)),
        (&hyper::Method::POST, "/v1/chat/completions") => Ok(chat_completions(req, state).await),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}

fn healthz(state: &AppState) -> Response<BoxBody> {
    let body = json!({
        "status": "ok",
        "service": state.settings.service_name,
        "window_seconds": state.settings.window_seconds,
        "api_keys": state.keys.key_count(),
    });
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(full_body(body.to_string()))
        .unwrap()
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    role: String,
    content: Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    #[serde(default)]
    model: Option<String>,
    messages: Vec<ChatMessage>,
    max_tokens: Option<i64>,
    #[serde(default)]
    #[allow(dead_code)]
    temperature: Option<f64>,
}

async fn chat_completions(req: Request<Incoming>, state: AppState) -> Response<BoxBody> {
    let ctx = RequestContext::new("chat_completions");

    let api_key = match authenticate(&req, &state) {
        Ok(limits) => limits,
        Err(resp) => return finish_error(&ctx, resp),
    };

    let body_bytes = match read_body(req).await {
        Ok(b) => b,
        Err(msg) => {
            return ctx.error_response(StatusCode::BAD_REQUEST, error_body(&msg, "invalid_request"));
        }
    };

    let parsed: ChatCompletionRequest = match serde_json::from_slice(&body_bytes) {
        Ok(p) => p,
        Err(e) => {
            return ctx.error_response(
                StatusCode::BAD_REQUEST,
                error_body(&format!("invalid json: {e}"), "invalid_request"),
            );
        }
    };

    if parsed.messages.is_empty() {
        return ctx.error_response(
            StatusCode::BAD_REQUEST,
            error_body("messages must not be empty", "invalid_request"),
        );
    }

    let prompt_tokens = estimate_prompt_tokens(&parsed.messages);
    let completion_tokens = estimate_completion_tokens(parsed.max_tokens);

    let outcome = if state.settings.bypass {
        crate::ratelimit::RateLimitOutcome {
            allowed: true,
            rpm_usage: 0,
            input_usage: 0,
            output_usage: 0,
            limit_flag: crate::ratelimit::LimitFlag::Admitted,
        }
    } else {
        match crate::ratelimit::check_and_consume(
            &state.store,
            &api_key,
            state.settings.window_seconds,
            prompt_tokens,
            completion_tokens,
        )
        .await
        {
            Ok(o) => o,
            Err(e) => {
                tracing::error!("api: store error on check_and_consume: {}", e);
                state.counters.record_failed();
                return ctx.error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    error_body("rate limiter store unavailable", "internal"),
                );
            }
        }
    };

    if !outcome.allowed {
        state.counters.record_throttled();
        metrics::counter!(
            "rate_limiter_rejected_total",
            "dimension" => outcome.limit_flag.to_string(),
        )
        .increment(1);

        ctx.finalize(StatusCode::TOO_MANY_REQUESTS.as_u16());
        return Response::builder()
            .status(StatusCode::TOO_MANY_REQUESTS)
            .header("content-type", "application/json")
            .header("retry-after", state.settings.window_seconds.to_string())
            .body(full_body(
                json!({
                    "error": {
                        "message": format!("rate limit exceeded on {}", outcome.limit_flag),
                        "type": "rate_limit",
                        "code": outcome.limit_flag.code(),
                    }
                })
                .to_string(),
            ))
            .unwrap();
    }

    state.counters.record_success();
    metrics::counter!("rate_limiter_allowed_total").increment(1);

    let completion = build_completion_response(
        &parsed,
        &api_key,
        prompt_tokens,
        completion_tokens,
        &outcome,
        &state,
    );

    ctx.finalize(StatusCode::OK.as_u16());
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(full_body(completion.to_string()))
        .unwrap()
}

fn finish_error(ctx: &RequestContext, resp: Response<BoxBody>) -> Response<BoxBody> {
    ctx.finalize(resp.status().as_u16());
    resp
}

fn authenticate(
    req: &Request<Incoming>,
    state: &AppState,
) -> Result<crate::keys::ApiKeyLimits, Response<BoxBody>> {
    let header = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let Some(header) = header else {
        return Err(unauthorized("missing authorization header"));
    };

    let Some((scheme, token)) = header.split_once(' ') else {
        return Err(unauthorized("malformed authorization header"));
    };

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(unauthorized("authorization must be bearer token"));
    }
    let key = token.trim();

    state
        .keys
        .lookup(key)
        .ok_or_else(|| unauthorized("unknown api key"))
}

fn unauthorized(msg: &str) -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header("content-type", "application/json")
        .body(full_body(error_body(msg, "auth")))
        .unwrap()
}

fn error_body(message: &str, kind: &str) -> String {
    json!({"error": {"message": message, "type": kind}}).to_string()
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, String> {
    let body = req.into_body();
    let collected = body
        .collect()
        .await
        .map_err(|e| format!("failed to read request body: {e}"))?;
    let bytes = collected.to_bytes();
    if bytes.len() > MAX_BODY_BYTES {
        return Err("request body too large".to_string());
    }
    Ok(bytes)
}

/// Char-count heuristic: `max(1, total_chars / 4)`. Walks `content` whether
/// it is a bare string or a list of strings / objects carrying a `text`
/// field; any other shape contributes zero characters. This mirrors the
/// hot-path estimator of the system this service replaces; the
/// word-count-based alternative is not implemented since it is unused there.
fn estimate_prompt_tokens(messages: &[ChatMessage]) -> i64 {
    let total_chars: usize = messages.iter().map(|m| content_char_count(&m.content)).sum();
    (total_chars / 4).max(1) as i64
}

fn content_char_count(content: &Value) -> usize {
    match content {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.chars().count(),
                Value::Object(obj) => obj
                    .get("text")
                    .and_then(|t| t.as_str())
                    .map(|s| s.chars().count())
                    .unwrap_or(0),
                _ => 0,
            })
            .sum(),
        _ => 0,
    }
}

/// Non-positive (or absent) `max_tokens` resets to the 128 default before
/// clamping to the [1, 512] range — a zero or negative request is not the
/// same as "give me the minimum", it means the client didn't send a usable
/// value.
fn estimate_completion_tokens(max_tokens: Option<i64>) -> i64 {
    let requested = match max_tokens {
        Some(n) if n > 0 => n,
        _ => 128,
    };
    requested.clamp(1, 512)
}

fn last_user_message(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| match &m.content {
            Value::String(s) => s.clone(),
            other => content_char_count(other).to_string(),
        })
        .unwrap_or_default()
}

#[derive(Serialize)]
struct RateLimitDimension {
    used: i64,
    limit: i64,
}

fn build_completion_response(
    req: &ChatCompletionRequest,
    limits: &crate::keys::ApiKeyLimits,
    prompt_tokens: i64,
    completion_tokens: i64,
    outcome: &crate::ratelimit::RateLimitOutcome,
    state: &AppState,
) -> Value {
    let echoed: String = last_user_message(&req.messages).chars().take(120).collect();
    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());

    json!({
        "id": id,
        "object": "chat.completion",
        "created": unix_now(),
        "model": req.model.clone().unwrap_or_else(|| "mock-llm".to_string()),
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": format!("(mock) you said: {echoed}"),
            },
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
        "rate_limit_state": {
            "rpm": RateLimitDimension { used: outcome.rpm_usage, limit: limits.rpm },
            "input_tpm": RateLimitDimension { used: outcome.input_usage, limit: limits.input_tpm },
            "output_tpm": RateLimitDimension { used: outcome.output_usage, limit: limits.output_tpm },
        },
        "node": state.settings.service_name,
        "limit_flag": outcome.limit_flag.code(),
    })
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_tokens_for_plain_string_content() {
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: Value::String("a".repeat(40)),
        }];
        assert_eq!(estimate_prompt_tokens(&messages), 10);
    }

    #[test]
    fn estimates_at_least_one_token_for_empty_content() {
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: Value::String(String::new()),
        }];
        assert_eq!(estimate_prompt_tokens(&messages), 1);
    }

    #[test]
    fn walks_list_of_strings_and_text_objects() {
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: json!(["abcd", {"text": "efgh"}, {"other": "ignored"}, 42]),
        }];
        assert_eq!(content_char_count(&messages[0].content), 8);
    }

    #[test]
    fn completion_tokens_clamped_between_one_and_512() {
        assert_eq!(estimate_completion_tokens(None), 128);
        assert_eq!(estimate_completion_tokens(Some(9999)), 512);
        assert_eq!(estimate_completion_tokens(Some(200)), 200);
    }

    #[test]
    fn non_positive_max_tokens_resets_to_default_before_clamping() {
        assert_eq!(estimate_completion_tokens(Some(0)), 128);
        assert_eq!(estimate_completion_tokens(Some(-5)), 128);
    }

    #[test]
    fn echoes_last_user_message_truncated() {
        let messages = vec![
            ChatMessage { role: "system".to_string(), content: Value::String("sys".into()) },
            ChatMessage { role: "user".to_string(), content: Value::String("first".into()) },
            ChatMessage { role: "assistant".to_string(), content: Value::String("reply".into()) },
            ChatMessage { role: "user".to_string(), content: Value::String("x".repeat(200)) },
        ];
        let echoed = last_user_message(&messages);
        assert_eq!(echoed.chars().count(), 200);
    }
}
