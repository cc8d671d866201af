//! Synthesized SSE chunk sequences.
//!
//! When the final answer was produced without upstream streaming (tool
//! fallback synthesis, scheduler runs) but the client asked for a stream,
//! the content is replayed as a standard three-chunk sequence terminated
//! by `[DONE]`.

use serde_json::json;

/// Build the `data:`-framed chunk sequence for a fully-formed response:
/// role delta, content delta, stop delta, `[DONE]`.
pub fn synthesize_chunks(model: &str, content: &str, created: i64, req_id: &str) -> Vec<Vec<u8>> {
    let chunk_id = format!("chatcmpl-{req_id}");
    let frame = |choices: serde_json::Value| -> Vec<u8> {
        let chunk = json!({
            "id": chunk_id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": choices,
        });
        format!("data: {chunk}\n\n").into_bytes()
    };

    vec![
        frame(json!([{"index": 0, "delta": {"role": "assistant"}, "finish_reason": null}])),
        frame(json!([{"index": 0, "delta": {"content": content}, "finish_reason": null}])),
        frame(json!([{"index": 0, "delta": {}, "finish_reason": "stop"}])),
        b"data: [DONE]\n\n".to_vec(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_sequence_shape() {
        let chunks = synthesize_chunks("m1", "hello", 1700000000, "ab12cd34");
        assert_eq!(chunks.len(), 4);

        let first: serde_json::Value =
            serde_json::from_slice(&chunks[0][b"data: ".len()..]).unwrap();
        assert_eq!(first["object"], "chat.completion.chunk");
        assert_eq!(first["id"], "chatcmpl-ab12cd34");
        assert_eq!(first["choices"][0]["delta"]["role"], "assistant");

        let second: serde_json::Value =
            serde_json::from_slice(&chunks[1][b"data: ".len()..]).unwrap();
        assert_eq!(second["choices"][0]["delta"]["content"], "hello");

        let third: serde_json::Value =
            serde_json::from_slice(&chunks[2][b"data: ".len()..]).unwrap();
        assert_eq!(third["choices"][0]["finish_reason"], "stop");

        assert_eq!(chunks[3], b"data: [DONE]\n\n".to_vec());
    }

    #[test]
    fn every_frame_is_sse_delimited() {
        for chunk in synthesize_chunks("m", "x", 0, "r") {
            let s = String::from_utf8(chunk).unwrap();
            assert!(s.starts_with("data: "));
            assert!(s.ends_with("\n\n"));
        }
    }
}
