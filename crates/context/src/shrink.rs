//! Per-tool-result shrinking: offload oversized outputs to a worker-pool
//! summarizer, falling back to middle-ellipsis truncation.

use async_trait::async_trait;
use ghost_domain::Result;

/// Above this many characters a tool result is summarization-eligible.
const SUMMARIZE_THRESHOLD: usize = 4000;
/// At most this much of the raw output is fed to the summarizer.
const SUMMARY_INPUT_CAP: usize = 15_000;
/// Above this the final envelope truncates with a middle ellipsis.
const HARD_CAP: usize = 30_000;
/// Head and tail kept by the middle-ellipsis envelope.
const ENVELOPE_KEEP: usize = 12_000;

/// One-shot summarization seam. The gateway implements this over the
/// worker pool; tests inject scripted fakes.
#[async_trait]
pub trait Summarize: Send + Sync {
    /// Summarize `output` in light of the user's question.
    async fn summarize(&self, question: &str, output: &str) -> Result<String>;
}

/// Largest index `<= at` that lands on a char boundary of `s`.
pub(crate) fn floor_char_boundary(s: &str, at: usize) -> usize {
    if at >= s.len() {
        return s.len();
    }
    let mut idx = at;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Middle-ellipsis truncation keeping `keep` chars from each end.
pub fn truncate_middle(text: &str, max: usize, keep: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let head_end = floor_char_boundary(text, keep);
    let tail_start = floor_char_boundary(text, text.len().saturating_sub(keep));
    format!(
        "{}\n...[TRUNCATED]...\n{}",
        &text[..head_end],
        &text[tail_start..]
    )
}

/// Shrink one tool result for insertion into the working message list.
///
/// Results over 4000 chars (for tools that are not already condensed) are
/// offloaded to the worker summarizer and replaced with an
/// `[EDGE CONDENSED]` digest; if that call fails the raw text passes
/// through. Either way the final envelope truncates at 30000 chars.
pub async fn shrink_tool_output(
    text: String,
    already_condensed: bool,
    user_question: &str,
    summarizer: Option<&dyn Summarize>,
) -> String {
    let mut out = text;

    if out.len() > SUMMARIZE_THRESHOLD && !already_condensed {
        if let Some(summarizer) = summarizer {
            let input_end = floor_char_boundary(&out, SUMMARY_INPUT_CAP);
            tracing::info!(chars = out.len(), "offloading tool output to worker summarizer");
            match summarizer.summarize(user_question, &out[..input_end]).await {
                Ok(summary) if !summary.trim().is_empty() => {
                    out = format!("[EDGE CONDENSED]: {}", summary.trim());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "tool output summarization failed, truncating");
                }
            }
        }
    }

    truncate_middle(&out, HARD_CAP, ENVELOPE_KEEP)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSummary(&'static str);

    #[async_trait]
    impl Summarize for FixedSummary {
        async fn summarize(&self, _question: &str, _output: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingSummary;

    #[async_trait]
    impl Summarize for FailingSummary {
        async fn summarize(&self, _question: &str, _output: &str) -> Result<String> {
            Err(ghost_domain::Error::Http("worker offline".into()))
        }
    }

    #[tokio::test]
    async fn small_outputs_pass_through() {
        let out = shrink_tool_output("short".into(), false, "q", Some(&FixedSummary("s"))).await;
        assert_eq!(out, "short");
    }

    #[tokio::test]
    async fn large_outputs_are_condensed() {
        let big = "line\n".repeat(2000);
        let out = shrink_tool_output(big, false, "q", Some(&FixedSummary("the gist"))).await;
        assert_eq!(out, "[EDGE CONDENSED]: the gist");
    }

    #[tokio::test]
    async fn condensed_tools_skip_the_summarizer() {
        let big = "x".repeat(5000);
        let out = shrink_tool_output(big.clone(), true, "q", Some(&FixedSummary("nope"))).await;
        assert_eq!(out, big);
    }

    #[tokio::test]
    async fn summarizer_failure_falls_back_to_envelope() {
        let big = "y".repeat(40_000);
        let out = shrink_tool_output(big, false, "q", Some(&FailingSummary)).await;
        assert!(out.contains("...[TRUNCATED]..."));
        assert!(out.len() < 25_000);
        assert!(out.starts_with(&"y".repeat(100)));
        assert!(out.ends_with(&"y".repeat(100)));
    }

    #[test]
    fn truncate_middle_respects_char_boundaries() {
        let text = "é".repeat(20_000); // 2 bytes per char
        let out = truncate_middle(&text, 30_000, 12_000);
        assert!(out.contains("...[TRUNCATED]..."));
        // Must not panic and must remain valid UTF-8 (guaranteed by &str),
        // with both halves non-empty.
        assert!(out.starts_with('é'));
        assert!(out.ends_with('é'));
    }
}
