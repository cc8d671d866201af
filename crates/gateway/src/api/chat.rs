//! `POST /api/chat`: the OpenAI-compatible chat endpoint, unary and
//! streaming.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::runtime::{handle_chat, ChatOutcome};
use crate::state::AppState;
use ghost_router::synthesize_chunks;

pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let request_id = headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from);
    let stream_requested = body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or(&state.config.model)
        .to_string();

    match handle_chat(state, body, request_id, true).await {
        ChatOutcome::Stream { rx, created: _, req_id } => sse_response(rx, req_id),
        ChatOutcome::Complete {
            content,
            created,
            req_id,
        } => {
            if stream_requested {
                // The loop finished without upstream streaming (tool
                // fallback, scheduler synthesis); replay the final text as
                // a standard chunk sequence.
                let chunks = synthesize_chunks(&model, &content, created, &req_id);
                let stream = futures_util::stream::iter(
                    chunks
                        .into_iter()
                        .map(Ok::<_, std::convert::Infallible>),
                );
                return stream_headers(Body::from_stream(stream), &req_id);
            }

            let envelope = json!({
                "choices": [{
                    "message": {"role": "assistant", "content": content}
                }],
                "created": created,
                "id": req_id,
            });
            let mut resp = Json(envelope).into_response();
            if let Ok(value) = req_id_header(&req_id) {
                resp.headers_mut().insert("x-request-id", value);
            }
            resp
        }
    }
}

fn sse_response(mut rx: tokio::sync::mpsc::Receiver<Vec<u8>>, req_id: String) -> Response {
    let stream = async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            yield Ok::<_, std::convert::Infallible>(chunk);
        }
    };
    stream_headers(Body::from_stream(stream), &req_id)
}

fn stream_headers(body: Body, req_id: &str) -> Response {
    let mut resp = Response::new(body);
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, "text/event-stream".parse().unwrap());
    headers.insert(header::CACHE_CONTROL, "no-cache".parse().unwrap());
    headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
    if let Ok(value) = req_id_header(req_id) {
        headers.insert("x-request-id", value);
    }
    resp
}

fn req_id_header(
    req_id: &str,
) -> std::result::Result<header::HeaderValue, header::InvalidHeaderValue> {
    req_id.parse()
}
