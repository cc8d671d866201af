//! Persistent job scheduler: named recurring prompts that re-enter the
//! reasoning loop. Jobs are rows in a local SQLite database and survive
//! restarts.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ghost_domain::{Error, Result};
use parking_lot::Mutex;
use rusqlite::Connection;

use super::cron::{cron_is_valid, cron_next};
use ghost_tools::TaskScheduler;

/// Fallback interval when the trigger is unparseable.
const DEFAULT_INTERVAL_SECS: u64 = 60;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Triggers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Cron(String),
    Interval(u64),
}

impl Trigger {
    /// Parse a trigger string: a 5-field cron expression or
    /// `interval:<seconds>`. Anything unparseable becomes a 60 s interval.
    pub fn parse(raw: &str) -> Trigger {
        let raw = raw.trim();
        if let Some(rest) = raw.strip_prefix("interval:") {
            let secs = rest.trim().parse::<u64>().unwrap_or(DEFAULT_INTERVAL_SECS);
            return Trigger::Interval(secs.max(1));
        }
        if cron_is_valid(raw) {
            return Trigger::Cron(raw.to_string());
        }
        tracing::warn!(trigger = raw, "unparseable trigger, defaulting to 60s interval");
        Trigger::Interval(DEFAULT_INTERVAL_SECS)
    }

    pub fn as_str(&self) -> String {
        match self {
            Trigger::Cron(expr) => expr.clone(),
            Trigger::Interval(secs) => format!("interval:{secs}"),
        }
    }

    /// Next fire time after `now`.
    pub fn next_after(&self, now: &DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Trigger::Interval(secs) => *now + Duration::seconds(*secs as i64),
            Trigger::Cron(expr) => {
                cron_next(expr, now).unwrap_or(*now + Duration::seconds(DEFAULT_INTERVAL_SECS as i64))
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Job model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub trigger: Trigger,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    pub next_run_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// SQLite-backed job store. The connection is serialized behind a mutex;
/// every operation is a short transaction.
pub struct Scheduler {
    conn: Mutex<Connection>,
}

impl Scheduler {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Fatal(format!("scheduler store unusable: {e}")))?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Fatal(format!("scheduler store unusable: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS jobs (
                 id          TEXT PRIMARY KEY,
                 name        TEXT NOT NULL,
                 trigger     TEXT NOT NULL,
                 prompt      TEXT NOT NULL,
                 created_at  TEXT NOT NULL,
                 next_run_at TEXT NOT NULL
             );",
        )
        .map_err(|e| Error::Fatal(format!("scheduler store unusable: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn create_job(&self, name: &str, trigger_raw: &str, prompt: &str) -> Result<Job> {
        let trigger = Trigger::parse(trigger_raw);
        let now = Utc::now();
        let job = Job {
            id: format!("task_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            name: name.to_string(),
            trigger: trigger.clone(),
            prompt: prompt.to_string(),
            created_at: now,
            next_run_at: trigger.next_after(&now),
        };

        self.conn
            .lock()
            .execute(
                "INSERT INTO jobs (id, name, trigger, prompt, created_at, next_run_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    job.id,
                    job.name,
                    job.trigger.as_str(),
                    job.prompt,
                    job.created_at.to_rfc3339(),
                    job.next_run_at.to_rfc3339(),
                ],
            )
            .map_err(|e| Error::Other(format!("job insert failed: {e}")))?;

        tracing::info!(id = %job.id, name = %job.name, "job scheduled");
        Ok(job)
    }

    pub fn jobs(&self) -> Result<Vec<Job>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, name, trigger, prompt, created_at, next_run_at FROM jobs ORDER BY created_at")
            .map_err(|e| Error::Other(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(|e| Error::Other(e.to_string()))?;

        let mut jobs = Vec::new();
        for row in rows {
            let (id, name, trigger, prompt, created_at, next_run_at) =
                row.map_err(|e| Error::Other(e.to_string()))?;
            jobs.push(Job {
                id,
                name,
                trigger: Trigger::parse(&trigger),
                prompt,
                created_at: parse_ts(&created_at),
                next_run_at: parse_ts(&next_run_at),
            });
        }
        Ok(jobs)
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .lock()
            .execute("DELETE FROM jobs WHERE id = ?1", [id])
            .map_err(|e| Error::Other(e.to_string()))?;
        Ok(n > 0)
    }

    pub fn remove_all(&self) -> Result<usize> {
        let n = self
            .conn
            .lock()
            .execute("DELETE FROM jobs", [])
            .map_err(|e| Error::Other(e.to_string()))?;
        Ok(n)
    }

    pub fn job_count(&self) -> usize {
        self.conn
            .lock()
            .query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get::<_, i64>(0))
            .unwrap_or(0) as usize
    }

    /// Jobs whose next fire time has passed, each immediately advanced to
    /// its following occurrence so a crash mid-run cannot double-fire.
    pub fn take_due(&self, now: &DateTime<Utc>) -> Result<Vec<Job>> {
        let due: Vec<Job> = self
            .jobs()?
            .into_iter()
            .filter(|job| job.next_run_at <= *now)
            .collect();

        let conn = self.conn.lock();
        for job in &due {
            let next = job.trigger.next_after(now);
            conn.execute(
                "UPDATE jobs SET next_run_at = ?1 WHERE id = ?2",
                rusqlite::params![next.to_rfc3339(), job.id],
            )
            .map_err(|e| Error::Other(e.to_string()))?;
        }
        Ok(due)
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool-facing adapter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SchedulerHandle(pub Arc<Scheduler>);

#[async_trait]
impl TaskScheduler for SchedulerHandle {
    async fn create(&self, name: &str, trigger: &str, prompt: &str) -> Result<String> {
        Ok(self.0.create_job(name, trigger, prompt)?.id)
    }

    async fn list(&self) -> Result<String> {
        let jobs = self.0.jobs()?;
        if jobs.is_empty() {
            return Ok("No active tasks.".into());
        }
        Ok(jobs
            .iter()
            .map(|job| {
                format!(
                    "{} | {} | {} | next run {} | prompt: {}",
                    job.id,
                    job.name,
                    job.trigger.as_str(),
                    job.next_run_at.format("%Y-%m-%d %H:%M UTC"),
                    job.prompt
                )
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn stop(&self, id: &str) -> Result<bool> {
        self.0.remove(id)
    }

    async fn stop_all(&self) -> Result<usize> {
        self.0.remove_all()
    }
}

impl ghost_tools::system::SchedulerProbe for SchedulerHandle {
    fn job_count(&self) -> usize {
        self.0.job_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_parsing() {
        assert_eq!(Trigger::parse("interval:90"), Trigger::Interval(90));
        assert_eq!(Trigger::parse("interval:abc"), Trigger::Interval(60));
        assert_eq!(
            Trigger::parse("*/5 * * * *"),
            Trigger::Cron("*/5 * * * *".into())
        );
        assert_eq!(Trigger::parse("whenever"), Trigger::Interval(60));
    }

    #[test]
    fn create_list_remove_round_trip() {
        let sched = Scheduler::open_in_memory().unwrap();
        let job = sched.create_job("digest", "interval:300", "summarize inbox").unwrap();
        assert!(job.id.starts_with("task_"));
        assert_eq!(job.id.len(), "task_".len() + 8);

        assert_eq!(sched.job_count(), 1);
        let listed = sched.jobs().unwrap();
        assert_eq!(listed[0].name, "digest");
        assert_eq!(listed[0].trigger, Trigger::Interval(300));

        assert!(sched.remove(&job.id).unwrap());
        assert!(!sched.remove(&job.id).unwrap());
        assert_eq!(sched.job_count(), 0);
    }

    #[test]
    fn due_jobs_advance_their_next_run() {
        let sched = Scheduler::open_in_memory().unwrap();
        sched.create_job("fast", "interval:1", "tick").unwrap();

        let future = Utc::now() + Duration::seconds(5);
        let due = sched.take_due(&future).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].name, "fast");

        // Re-taking at the same instant must not fire again.
        let due = sched.take_due(&future).unwrap();
        assert!(due.is_empty());
    }

    #[test]
    fn stop_all_clears_everything() {
        let sched = Scheduler::open_in_memory().unwrap();
        sched.create_job("a", "interval:60", "x").unwrap();
        sched.create_job("b", "0 9 * * *", "y").unwrap();
        assert_eq!(sched.remove_all().unwrap(), 2);
    }
}
