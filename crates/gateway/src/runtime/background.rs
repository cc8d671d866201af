//! Fire-and-forget background jobs: the bounded work queue, smart-memory
//! extraction with belief revision, and the post-mortem lesson capture.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use ghost_context::extract_json;
use ghost_domain::chat::{ChatPayload, Message, ResponseFormat};
use ghost_router::{PoolKind, Upstream};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::prompts::{BELIEF_REVISION_PROMPT, POST_MORTEM_PROMPT, SMART_MEMORY_PROMPT};
use crate::state::AppState;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Bounded queue with drop-oldest overflow. Enqueueing never blocks the
/// request loop; a single worker task drains it.
pub struct BackgroundQueue {
    queue: Mutex<VecDeque<Job>>,
    notify: Notify,
    capacity: usize,
}

impl BackgroundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn enqueue<F>(&self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
            tracing::warn!("background queue full, dropped oldest job");
        }
        queue.push_back(Box::pin(job));
        drop(queue);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Drain loop; spawned once at startup.
    pub async fn run(self: Arc<Self>) {
        loop {
            let job = self.queue.lock().pop_front();
            match job {
                Some(job) => job.await,
                None => self.notify.notified().await,
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Smart memory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Similarity distance below which an old fact is a revision candidate.
const REVISION_DISTANCE: f32 = 0.6;

const SUMMARY_TRIGGERS: &[&str] = &[
    "summarize",
    "summary",
    "recall",
    "tell me about",
    "what is",
    "recap",
    "forget",
    "list documents",
];

fn is_personal(fact: &str) -> bool {
    ["user", "me", "my ", " i ", "identity", "preference", "like"]
        .iter()
        .any(|w| fact.contains(w))
}

fn is_technical(fact: &str) -> bool {
    [
        "file", "path", "code", "error", "script", "project", "repo", "build", "library",
        "version",
    ]
    .iter()
    .any(|w| fact.contains(w))
}

/// Extract at most one durable fact from the recent transcript, resolve
/// contradictions against existing memory, store it, and update the
/// profile for identity-grade facts. Fully serialized by the memory
/// semaphore.
pub async fn run_smart_memory(state: AppState, transcript: String, model: String) {
    let _permit = match state.memory_semaphore.clone().acquire_owned().await {
        Ok(p) => p,
        Err(_) => return,
    };
    let selectivity = state.config.smart_memory;
    let transcript = transcript.replace('\r', "");
    let lc = transcript.to_lowercase();

    // Summary-style requests replay old memories; capturing them again
    // would echo the store into itself.
    let is_requesting_summary = SUMMARY_TRIGGERS.iter().any(|w| lc.contains(w));
    if is_requesting_summary && transcript.len() > 1500 {
        return;
    }

    let prompt = format!("{SMART_MEMORY_PROMPT}\n\n### EPISODE LOG:\n{transcript}");
    let mut payload = ChatPayload::new(model.clone(), vec![Message::user(prompt)]);
    payload.temperature = Some(0.1);
    payload.response_format = Some(ResponseFormat::json_object());

    let body = match state.upstream.chat(payload, PoolKind::Worker, None).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "smart memory extraction failed");
            return;
        }
    };
    let Some(result) = extract_json(Message::from_completion(&body).text()) else {
        return;
    };

    let score = result.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32;
    let fact = result
        .get("fact")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    let profile_update = result.get("profile_update").filter(|v| v.is_object()).cloned();

    let fact_lc = fact.to_lowercase();
    if score < selectivity || fact.len() < 5 || fact.len() > 200 || fact_lc.contains("none") {
        return;
    }
    // High-scoring facts that are neither personal nor technical are
    // generic world knowledge; the upstream model already knows them.
    if score >= 0.9 && !(is_personal(&fact_lc) || is_technical(&fact_lc)) {
        tracing::info!(fact = %fact, "discarded generic knowledge");
        return;
    }
    let memory_type = if score >= 0.9 && profile_update.is_some() {
        "identity"
    } else {
        "auto"
    };

    // Belief revision: erase stored facts the new one contradicts.
    match state.memory.search_scored(&fact, 3, None).await {
        Ok(candidates) => {
            let old_facts: Vec<_> = candidates
                .iter()
                .filter(|c| c.score < REVISION_DISTANCE)
                .collect();
            if !old_facts.is_empty() {
                let listing: Vec<String> = old_facts
                    .iter()
                    .map(|c| format!("ID: {} | TEXT: {}", c.id, c.text))
                    .collect();
                let eval_prompt = format!(
                    "NEW FACT:\n{fact}\n\nOLD FACTS:\n{}\n\nAnalyze if the NEW FACT contradicts, \
                     updates, or supersedes any OLD FACTS. Return ONLY a JSON object with a list \
                     of 'ids' to delete. If they safely coexist (e.g. they refer to different \
                     topics/projects), return an empty list.",
                    listing.join("\n")
                );
                let mut eval = ChatPayload::new(
                    model.clone(),
                    vec![
                        Message::system(BELIEF_REVISION_PROMPT),
                        Message::user(eval_prompt),
                    ],
                );
                eval.temperature = Some(0.0);
                eval.response_format = Some(ResponseFormat::json_object());

                if let Ok(body) = state.upstream.chat(eval, PoolKind::Worker, None).await {
                    if let Some(verdict) = extract_json(Message::from_completion(&body).text()) {
                        let ids: Vec<String> = verdict
                            .get("ids")
                            .and_then(|v| v.as_array())
                            .map(|arr| {
                                arr.iter()
                                    .filter_map(|v| v.as_str())
                                    .map(|s| s.replace("ID: ", "").replace("ID:", "").trim().to_string())
                                    .collect()
                            })
                            .unwrap_or_default();
                        if !ids.is_empty() {
                            match state.memory.delete(&ids).await {
                                Ok(n) => {
                                    tracing::info!(erased = n, "belief revision removed outdated memories")
                                }
                                Err(e) => tracing::warn!(error = %e, "belief revision delete failed"),
                            }
                        }
                    }
                }
            }
        }
        Err(e) => tracing::warn!(error = %e, "revision candidate search failed"),
    }

    let meta = serde_json::json!({
        "timestamp": Utc::now().to_rfc3339(),
        "type": memory_type,
    });
    if let Err(e) = state.memory.add(&fact, meta).await {
        tracing::warn!(error = %e, "smart memory store failed");
        return;
    }
    tracing::info!(score, fact = %fact, "auto memory stored");

    if memory_type == "identity" {
        if let Some(update) = profile_update {
            let category = update
                .get("category")
                .and_then(|v| v.as_str())
                .unwrap_or("notes")
                .to_string();
            let key = update
                .get("key")
                .and_then(|v| v.as_str())
                .unwrap_or("info")
                .to_string();
            let value = update
                .get("value")
                .and_then(|v| v.as_str())
                .unwrap_or(&fact)
                .to_string();
            let profile = state.profile.clone();
            let result =
                tokio::task::spawn_blocking(move || profile.update(&category, &key, &value)).await;
            if let Ok(Err(e)) = result {
                tracing::warn!(error = %e, "identity profile update failed");
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Post-mortem
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Capture a lesson from a multi-turn or failure-laden request: one
/// worker call, parsed into the playbook and mirrored to vector memory.
pub async fn run_post_mortem(
    state: AppState,
    last_user: String,
    tools_run: Vec<Message>,
    final_content: String,
    model: String,
) {
    let mut history = format!("User: {last_user}\n");
    for tool_msg in tools_run.iter().rev().take(5).collect::<Vec<_>>().into_iter().rev() {
        let name = tool_msg.name.as_deref().unwrap_or("unknown");
        let content: String = tool_msg.text().chars().take(200).collect();
        history.push_str(&format!("Tool {name}: {content}\n"));
    }
    let final_preview: String = final_content.chars().take(500).collect();
    let prompt = format!("{POST_MORTEM_PROMPT}\n\nHISTORY:\n{history}\nFINAL AI: {final_preview}");

    let mut payload = ChatPayload::new(
        model,
        vec![
            Message::system("You are a Meta-Cognitive Analyst."),
            Message::user(prompt),
        ],
    );
    payload.temperature = Some(0.1);
    payload.response_format = Some(ResponseFormat::json_object());

    let body = match state.upstream.chat(payload, PoolKind::Worker, None).await {
        Ok(b) => b,
        Err(e) => {
            tracing::warn!(error = %e, "post-mortem call failed");
            return;
        }
    };
    let content = Message::from_completion(&body).text().to_string();
    if content.is_empty() || content.to_lowercase().contains("null") {
        return;
    }
    let Some(lesson) = extract_json(&content) else {
        return;
    };
    let (Some(task), Some(mistake), Some(solution)) = (
        lesson.get("task").and_then(|v| v.as_str()),
        lesson.get("mistake").and_then(|v| v.as_str()),
        lesson.get("solution").and_then(|v| v.as_str()),
    ) else {
        return;
    };

    let playbook = state.playbook.clone();
    let (task, mistake, solution) = (task.to_string(), mistake.to_string(), solution.to_string());
    let recorded = tokio::task::spawn_blocking(move || {
        playbook.learn_lesson(&task, &mistake, &solution)
    })
    .await;

    if let Ok(Ok(recorded)) = recorded {
        let meta = serde_json::json!({"type": "skill", "timestamp": recorded.timestamp});
        if let Err(e) = state.memory.add(&recorded.as_memory_text(), meta).await {
            tracing::warn!(error = %e, "post-mortem lesson not indexed");
        }
        tracing::info!("new lesson captured automatically");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn queue_runs_jobs_in_order() {
        let queue = Arc::new(BackgroundQueue::new(8));
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            queue.enqueue(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(queue.len(), 3);

        let runner = tokio::spawn(queue.clone().run());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(queue.is_empty());
        runner.abort();
    }

    #[tokio::test]
    async fn queue_drops_oldest_on_overflow() {
        let queue = Arc::new(BackgroundQueue::new(2));
        let hits = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4 {
            let hits = hits.clone();
            queue.enqueue(async move {
                hits.lock().push(i);
            });
        }
        assert_eq!(queue.len(), 2);

        let runner = tokio::spawn(queue.clone().run());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // The two oldest jobs were dropped.
        assert_eq!(*hits.lock(), vec![2, 3]);
        runner.abort();
    }

    #[test]
    fn personal_and_technical_classifiers() {
        assert!(is_personal("the user prefers dark roast"));
        assert!(is_technical("the build script lives in tools/"));
        assert!(!is_personal("paris is the capital of france"));
        assert!(!is_technical("paris is the capital of france"));
    }
}
