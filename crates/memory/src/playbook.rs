//! The skills playbook: lessons learned from post-mortems and explicit
//! `learn_skill` calls, kept as a capped JSON list and mirrored into the
//! vector store for semantic recall.

use std::path::{Path, PathBuf};

use chrono::Utc;
use ghost_domain::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::io::write_json_atomic;

/// Lessons kept in the JSON backup.
const PLAYBOOK_CAP: usize = 50;
/// Lessons rendered into the fallback context block.
const CONTEXT_LESSONS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    pub timestamp: String,
    pub task: String,
    pub mistake: String,
    pub solution: String,
}

impl Lesson {
    /// The flat text form indexed into vector memory.
    pub fn as_memory_text(&self) -> String {
        format!(
            "SITUATION: {}\nMISTAKE: {}\nSOLUTION: {}",
            self.task, self.mistake, self.solution
        )
    }
}

pub struct SkillPlaybook {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SkillPlaybook {
    pub fn open(memory_dir: &Path) -> Result<Self> {
        let path = memory_dir.join("skills_playbook.json");
        let book = Self {
            path,
            lock: Mutex::new(()),
        };
        if !book.path.exists() {
            write_json_atomic(&book.path, &Vec::<Lesson>::new())?;
        }
        Ok(book)
    }

    fn read_unlocked(&self) -> Vec<Lesson> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    /// Prepend a lesson, capping the stored list. Returns the recorded
    /// lesson so the caller can index it into vector memory.
    pub fn learn_lesson(&self, task: &str, mistake: &str, solution: &str) -> Result<Lesson> {
        let _guard = self.lock.lock();
        let lesson = Lesson {
            timestamp: Utc::now().to_rfc3339(),
            task: task.to_string(),
            mistake: mistake.to_string(),
            solution: solution.to_string(),
        };

        let mut playbook = self.read_unlocked();
        playbook.insert(0, lesson.clone());
        playbook.truncate(PLAYBOOK_CAP);
        write_json_atomic(&self.path, &playbook)?;

        tracing::info!(task = %lesson.task, "lesson recorded in playbook");
        Ok(lesson)
    }

    pub fn recent(&self, n: usize) -> Vec<Lesson> {
        let _guard = self.lock.lock();
        let mut lessons = self.read_unlocked();
        lessons.truncate(n);
        lessons
    }

    /// Render the recent-lessons fallback block (used when semantic recall
    /// found nothing or no vector store is available).
    pub fn recent_context(&self) -> String {
        let lessons = self.recent(CONTEXT_LESSONS);
        if lessons.is_empty() {
            return String::new();
        }
        let mut out =
            String::from("## RECENT LESSONS LEARNED (Follow these to avoid repeats):\n");
        for (i, lesson) in lessons.iter().enumerate() {
            out.push_str(&format!(
                "{}. SITUATION: {}\n   PREVIOUS MISTAKE: {}\n   THE FIX: {}\n",
                i + 1,
                lesson.task,
                lesson.mistake,
                lesson.solution
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lessons_prepend_and_cap() {
        let dir = tempfile::tempdir().unwrap();
        let book = SkillPlaybook::open(dir.path()).unwrap();

        for i in 0..60 {
            book.learn_lesson(&format!("task {i}"), "m", "s").unwrap();
        }
        let recent = book.recent(100);
        assert_eq!(recent.len(), 50);
        assert_eq!(recent[0].task, "task 59");
    }

    #[test]
    fn context_renders_top_five() {
        let dir = tempfile::tempdir().unwrap();
        let book = SkillPlaybook::open(dir.path()).unwrap();
        assert!(book.recent_context().is_empty());

        for i in 0..7 {
            book.learn_lesson(&format!("t{i}"), &format!("m{i}"), &format!("s{i}"))
                .unwrap();
        }
        let ctx = book.recent_context();
        assert!(ctx.contains("t6"));
        assert!(ctx.contains("THE FIX: s6"));
        assert!(!ctx.contains("t0"));
    }

    #[test]
    fn memory_text_shape() {
        let lesson = Lesson {
            timestamp: "2025-01-01T00:00:00Z".into(),
            task: "parse csv".into(),
            mistake: "guessed delimiter".into(),
            solution: "sniff the header first".into(),
        };
        let text = lesson.as_memory_text();
        assert!(text.starts_with("SITUATION: parse csv"));
        assert!(text.contains("SOLUTION: sniff the header first"));
    }
}
