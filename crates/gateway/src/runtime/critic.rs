//! Pre-execution critic: one deterministic JSON-mode call reviewing
//! complex code before it runs. Fails open: critic availability must
//! never cost reliability.

use ghost_context::extract_json;
use ghost_domain::chat::{ChatPayload, Message, ResponseFormat};
use ghost_router::{PoolKind, Upstream};
use ghost_tools::sanitize::extract_code_from_markdown;

use crate::prompts::CRITIC_SYSTEM_PROMPT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CriticVerdict {
    Approved,
    /// The code was patched; carries the revision and the critique.
    Revised { code: String, critique: String },
    Blocked { critique: String },
}

pub async fn run_critic(
    upstream: &dyn Upstream,
    model: &str,
    code: &str,
    task_context: &str,
) -> CriticVerdict {
    let prompt = format!("### USER TASK:\n{task_context}\n\n### PROPOSED CODE:\n{code}");
    let mut payload = ChatPayload::new(
        model.to_string(),
        vec![Message::system(CRITIC_SYSTEM_PROMPT), Message::user(prompt)],
    );
    payload.temperature = Some(0.0);
    payload.response_format = Some(ResponseFormat::json_object());

    // Prefer the coding pool; the router falls back through worker/main
    // when it is empty.
    let class = if upstream.has_pool(PoolKind::Coding) {
        PoolKind::Coding
    } else {
        PoolKind::Worker
    };

    let body = match upstream.chat(payload, class, None).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "critic call failed, approving (fail-open)");
            return CriticVerdict::Approved;
        }
    };

    let Some(result) = extract_json(Message::from_completion(&body).text()) else {
        tracing::warn!("critic returned malformed JSON, approving (fail-open)");
        return CriticVerdict::Approved;
    };

    let status = result.get("status").and_then(|v| v.as_str()).unwrap_or("");
    let critique = result
        .get("critique")
        .and_then(|v| v.as_str())
        .unwrap_or("Unspecified issue")
        .to_string();

    if status == "APPROVED" {
        return CriticVerdict::Approved;
    }

    match result.get("revised_code").and_then(|v| v.as_str()) {
        Some(revision) if !revision.trim().is_empty() => {
            let mut code = extract_code_from_markdown(revision);
            // Residual inline-code ticks survive fence extraction.
            if code.starts_with('`') && code.ends_with('`') {
                code = code.trim_matches('`').to_string();
            }
            CriticVerdict::Revised { code, critique }
        }
        _ => CriticVerdict::Blocked { critique },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ghost_domain::Result;
    use ghost_router::ByteStream;
    use serde_json::Value;

    /// Upstream that returns a canned completion, or errors.
    struct Scripted {
        response: Option<Value>,
    }

    #[async_trait]
    impl Upstream for Scripted {
        async fn chat(
            &self,
            _payload: ChatPayload,
            _class: PoolKind,
            _hint: Option<&str>,
        ) -> Result<Value> {
            match &self.response {
                Some(v) => Ok(v.clone()),
                None => Err(ghost_domain::Error::UpstreamUnavailable),
            }
        }
        async fn chat_stream(
            &self,
            _payload: ChatPayload,
            _class: PoolKind,
            _hint: Option<&str>,
        ) -> Result<ByteStream> {
            Err(ghost_domain::Error::UpstreamUnavailable)
        }
        async fn embeddings(&self, _texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
            Ok(Vec::new())
        }
        fn has_pool(&self, _class: PoolKind) -> bool {
            false
        }
    }

    fn completion(content: &str) -> Value {
        serde_json::json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
    }

    #[tokio::test]
    async fn approved_passes_through() {
        let upstream = Scripted {
            response: Some(completion(r#"{"status": "APPROVED", "critique": "fine"}"#)),
        };
        let verdict = run_critic(&upstream, "m", "print(1)", "count").await;
        assert_eq!(verdict, CriticVerdict::Approved);
    }

    #[tokio::test]
    async fn revised_unwraps_fences_and_ticks() {
        let upstream = Scripted {
            response: Some(completion(
                "{\"status\": \"REVISED\", \"revised_code\": \"```python\\nprint(2)\\n```\", \"critique\": \"off by one\"}",
            )),
        };
        match run_critic(&upstream, "m", "print(1)", "count").await {
            CriticVerdict::Revised { code, critique } => {
                assert_eq!(code, "print(2)");
                assert_eq!(critique, "off by one");
            }
            other => panic!("expected revision, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn blocked_without_revision() {
        let upstream = Scripted {
            response: Some(completion(r#"{"status": "BLOCKED", "critique": "rm -rf detected"}"#)),
        };
        match run_critic(&upstream, "m", "import os", "cleanup").await {
            CriticVerdict::Blocked { critique } => assert!(critique.contains("rm -rf")),
            other => panic!("expected block, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn critic_error_fails_open() {
        // If the critic call raises, the original code executes.
        let upstream = Scripted { response: None };
        let verdict = run_critic(&upstream, "m", "print(1)", "count").await;
        assert_eq!(verdict, CriticVerdict::Approved);
    }

    #[tokio::test]
    async fn malformed_json_fails_open() {
        let upstream = Scripted {
            response: Some(completion("I think this code is fine!")),
        };
        let verdict = run_critic(&upstream, "m", "print(1)", "count").await;
        assert_eq!(verdict, CriticVerdict::Approved);
    }
}
