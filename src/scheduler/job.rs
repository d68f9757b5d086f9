use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::Decomposition;

pub type JobId = Uuid;
pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Lifecycle of a single task.
///
/// Tasks only move forward: `pending -> assigned -> running -> done|failed`.
/// A failure below the attempt limit lands back in `pending`, so a stored
/// `failed` is always terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Assigned => write!(f, "assigned"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "running" => Ok(TaskStatus::Running),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Assigned or running: the task is held under a lease.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }
}

fn default_frame() -> i64 {
    1
}

fn default_priority() -> u8 {
    5
}

/// A job submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_name: String,
    /// Engine kind, e.g. `render` or `composite`. Opaque to the coordinator.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default = "default_frame")]
    pub start_frame: i64,
    /// Inclusive. Missing or below `start_frame` means a single-frame job.
    #[serde(default)]
    pub end_frame: Option<i64>,
    /// Informational; scheduling is strictly FIFO.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Engine-specific settings copied into every task.
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Capabilities a node must advertise to receive this job's tasks.
    #[serde(default)]
    pub requires: BTreeSet<String>,
    /// Retries after the first run. Older clients send it as `max_retries`.
    #[serde(default, alias = "max_retries")]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub frames_per_task: Option<u32>,
}

impl JobSpec {
    pub fn new(job_name: impl Into<String>, start_frame: i64, end_frame: i64) -> Self {
        Self {
            job_name: job_name.into(),
            kind: "render".to_string(),
            start_frame,
            end_frame: Some(end_frame),
            priority: default_priority(),
            payload: Map::new(),
            requires: BTreeSet::new(),
            max_attempts: None,
            frames_per_task: None,
        }
    }

    pub fn with_requires<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_frames_per_task(mut self, frames: u32) -> Self {
        self.frames_per_task = Some(frames);
        self
    }

    /// Inclusive frame range after collapsing an inverted or missing end.
    pub fn frame_range(&self) -> (i64, i64) {
        let end = self
            .end_frame
            .unwrap_or(self.start_frame)
            .max(self.start_frame);
        (self.start_frame, end)
    }

    fn rule(&self, default_rule: Decomposition) -> Decomposition {
        self.frames_per_task
            .map(Decomposition::from_frames_per_task)
            .unwrap_or(default_rule)
    }

    /// Number of tasks `decompose` would produce, computed without building them.
    pub fn task_count(&self, default_rule: Decomposition) -> u64 {
        let step = i128::from(self.rule(default_rule).frames_per_task().max(1));
        let (start, end) = self.frame_range();
        let frames = i128::from(end) - i128::from(start) + 1;
        u64::try_from((frames + step - 1) / step).unwrap_or(u64::MAX)
    }

    /// Split the frame range into task payloads. The job's own
    /// `frames_per_task` wins over `default_rule`.
    pub fn decompose(&self, default_rule: Decomposition) -> Vec<TaskPayload> {
        let step = i64::from(self.rule(default_rule).frames_per_task().max(1));
        let (start, end) = self.frame_range();

        let mut payloads = Vec::new();
        let mut frame = start;
        loop {
            let last_frame = frame.saturating_add(step - 1).min(end);
            payloads.push(TaskPayload {
                frame,
                last_frame,
                kind: self.kind.clone(),
                engine_payload: self.payload.clone(),
            });
            if last_frame >= end {
                break;
            }
            frame = last_frame + 1;
        }
        payloads
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub frame: i64,
    /// Equal to `frame` unless the job was chunked.
    pub last_frame: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub engine_payload: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    pub max_attempts: u32,
    pub task_ids: Vec<TaskId>,
    pub created_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub payload: TaskPayload,
    /// Copied from the job so eligibility checks never touch the job table.
    pub requires: BTreeSet<String>,
    pub status: TaskStatus,
    pub assigned_node: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        job_id: JobId,
        payload: TaskPayload,
        requires: BTreeSet<String>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            job_id,
            payload,
            requires,
            status: TaskStatus::Pending,
            assigned_node: None,
            lease_expires_at: None,
            attempt_count: 0,
            max_attempts,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.is_in_flight() && self.lease_expires_at.is_some_and(|expiry| expiry <= now)
    }

    pub fn holds_lease(&self, node_id: &str, now: DateTime<Utc>) -> bool {
        self.status.is_in_flight()
            && self.assigned_node.as_deref() == Some(node_id)
            && !self.lease_expired(now)
    }

    /// Whether a node advertising `capabilities` may run this task.
    pub fn runnable_on(&self, capabilities: &BTreeSet<String>) -> bool {
        self.requires.is_subset(capabilities)
    }

    /// Self-describing JSON record, as handed to pollers.
    pub fn to_record(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Per-status task counts for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub assigned: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TaskStats {
    pub fn record(&mut self, status: TaskStatus) {
        self.total += 1;
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Assigned => self.assigned += 1,
            TaskStatus::Running => self.running += 1,
            TaskStatus::Done => self.done += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }

    /// Job status derived from its tasks.
    pub fn job_status(&self, cancelled: bool) -> JobStatus {
        if cancelled {
            JobStatus::Cancelled
        } else if self.failed > 0 {
            JobStatus::Failed
        } else if self.total > 0 && self.done == self.total {
            JobStatus::Completed
        } else if self.pending < self.total {
            JobStatus::Running
        } else {
            JobStatus::Pending
        }
    }
}

/// A job with its status and task counts computed at read time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job: Job,
    pub status: JobStatus,
    pub stats: TaskStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_frame_decomposition() {
        let spec = JobSpec::new("shot_010", 1, 3);
        let payloads = spec.decompose(Decomposition::PerFrame);
        let frames: Vec<(i64, i64)> = payloads.iter().map(|p| (p.frame, p.last_frame)).collect();
        assert_eq!(frames, vec![(1, 1), (2, 2), (3, 3)]);
        assert!(payloads.iter().all(|p| p.kind == "render"));
    }

    #[test]
    fn chunked_decomposition_keeps_remainder() {
        let spec = JobSpec::new("shot_020", 1, 10).with_frames_per_task(4);
        let frames: Vec<(i64, i64)> = spec
            .decompose(Decomposition::PerFrame)
            .iter()
            .map(|p| (p.frame, p.last_frame))
            .collect();
        assert_eq!(frames, vec![(1, 4), (5, 8), (9, 10)]);
    }

    #[test]
    fn default_rule_applies_without_override() {
        let spec = JobSpec::new("shot_030", 10, 15);
        assert_eq!(spec.decompose(Decomposition::Chunked(3)).len(), 2);
    }

    #[test]
    fn range_ending_at_i64_max_terminates() {
        let spec = JobSpec::new("edge", i64::MAX - 1, i64::MAX);
        let frames: Vec<(i64, i64)> = spec
            .decompose(Decomposition::PerFrame)
            .iter()
            .map(|p| (p.frame, p.last_frame))
            .collect();
        assert_eq!(frames, vec![(i64::MAX - 1, i64::MAX - 1), (i64::MAX, i64::MAX)]);
        assert_eq!(spec.task_count(Decomposition::PerFrame), 2);

        let chunked = JobSpec::new("edge", i64::MAX - 5, i64::MAX).with_frames_per_task(4);
        let frames: Vec<(i64, i64)> = chunked
            .decompose(Decomposition::PerFrame)
            .iter()
            .map(|p| (p.frame, p.last_frame))
            .collect();
        assert_eq!(
            frames,
            vec![(i64::MAX - 5, i64::MAX - 2), (i64::MAX - 1, i64::MAX)]
        );
    }

    #[test]
    fn task_count_matches_decomposition() {
        let spec = JobSpec::new("shot", 1, 10).with_frames_per_task(4);
        assert_eq!(spec.task_count(Decomposition::PerFrame), 3);
        assert_eq!(JobSpec::new("shot", 1, 3).task_count(Decomposition::Chunked(2)), 2);
        assert_eq!(
            JobSpec::new("all", i64::MIN, i64::MAX).task_count(Decomposition::PerFrame),
            u64::MAX
        );
    }

    #[test]
    fn max_retries_is_accepted_for_max_attempts() {
        let spec: JobSpec = serde_json::from_value(
            serde_json::json!({"job_name": "legacy", "max_retries": 5}),
        )
        .unwrap();
        assert_eq!(spec.max_attempts, Some(5));
    }

    #[test]
    fn inverted_range_collapses_to_single_frame() {
        let mut spec = JobSpec::new("still", 7, 2);
        assert_eq!(spec.frame_range(), (7, 7));
        spec.end_frame = None;
        assert_eq!(spec.decompose(Decomposition::PerFrame).len(), 1);
    }

    #[test]
    fn job_spec_deserializes_with_defaults() {
        let spec: JobSpec =
            serde_json::from_value(serde_json::json!({"job_name": "myshot_001"})).unwrap();
        assert_eq!(spec.start_frame, 1);
        assert_eq!(spec.end_frame, None);
        assert_eq!(spec.priority, 5);
        assert!(spec.requires.is_empty());
        assert_eq!(spec.kind, "");
    }

    #[test]
    fn derived_job_status() {
        let mut stats = TaskStats::default();
        for _ in 0..3 {
            stats.record(TaskStatus::Pending);
        }
        assert_eq!(stats.job_status(false), JobStatus::Pending);

        let mut stats = TaskStats::default();
        stats.record(TaskStatus::Done);
        stats.record(TaskStatus::Pending);
        assert_eq!(stats.job_status(false), JobStatus::Running);

        let mut stats = TaskStats::default();
        stats.record(TaskStatus::Done);
        stats.record(TaskStatus::Done);
        assert_eq!(stats.job_status(false), JobStatus::Completed);

        stats.record(TaskStatus::Failed);
        assert_eq!(stats.job_status(false), JobStatus::Failed);
        assert_eq!(stats.job_status(true), JobStatus::Cancelled);
    }

    #[test]
    fn status_parsing() {
        assert_eq!("DONE".parse::<TaskStatus>(), Ok(TaskStatus::Done));
        assert!("finished".parse::<TaskStatus>().is_err());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Running.is_in_flight());
        assert!(!TaskStatus::Pending.is_in_flight());
    }
}
