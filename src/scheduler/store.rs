use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::{FarmError, Result};
use crate::scheduler::job::{
    Job, JobId, JobSpec, JobStatus, JobView, Task, TaskId, TaskStats, TaskStatus,
};

/// A status report from the node working a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub node_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StatusReport {
    pub fn new(node_id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            node_id: node_id.into(),
            status,
            result: None,
            error: None,
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submitted {
    pub job_id: JobId,
    pub task_count: usize,
}

/// Holds jobs and their tasks.
///
/// Tasks live in a sharded map and every transition happens under that task's
/// entry lock, so unrelated tasks never serialize against each other. The
/// creation-order index is the only shared structure and is written only on
/// submit and purge.
///
/// Lock order: job entry before task entry. No task entry lock is ever held
/// while taking a job entry lock.
#[derive(Debug)]
pub struct JobStore {
    jobs: DashMap<JobId, Job>,
    tasks: DashMap<TaskId, Task>,
    order: RwLock<Vec<TaskId>>,
    job_count: AtomicUsize,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
}

impl JobStore {
    pub fn new(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: DashMap::new(),
            tasks: DashMap::new(),
            order: RwLock::new(Vec::new()),
            job_count: AtomicUsize::new(0),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn lease_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.config.lease_duration())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Decompose `spec` into tasks and queue them behind everything already
    /// submitted.
    pub fn submit(&self, spec: JobSpec) -> Result<Submitted> {
        if spec.job_name.trim().is_empty() {
            return Err(FarmError::Validation("job_name must not be empty".into()));
        }
        if spec.max_attempts == Some(0) {
            return Err(FarmError::Validation("max_attempts must be at least 1".into()));
        }
        let task_count = spec.task_count(self.config.decomposition);
        if task_count > self.config.max_tasks_per_job {
            return Err(FarmError::Validation(format!(
                "job would create {task_count} tasks, limit is {}",
                self.config.max_tasks_per_job
            )));
        }
        let max_jobs = self.config.max_jobs;
        if self
            .job_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max_jobs).then_some(n + 1)
            })
            .is_err()
        {
            tracing::warn!(max_jobs, "Job queue at capacity, submission rejected");
            return Err(FarmError::QueueFull(max_jobs));
        }

        let now = self.clock.now();
        let job_id = Uuid::new_v4();
        let max_attempts = spec.max_attempts.unwrap_or(self.config.max_attempts);
        let tasks: Vec<Task> = spec
            .decompose(self.config.decomposition)
            .into_iter()
            .map(|payload| Task::new(job_id, payload, spec.requires.clone(), max_attempts, now))
            .collect();
        let task_ids: Vec<TaskId> = tasks.iter().map(|t| t.task_id).collect();
        let task_count = tasks.len();

        let job_name = spec.job_name.clone();
        // Job first so every task's back-reference resolves.
        self.jobs.insert(
            job_id,
            Job {
                id: job_id,
                spec,
                max_attempts,
                task_ids: task_ids.clone(),
                created_at: now,
                cancelled_at: None,
            },
        );
        for task in tasks {
            self.tasks.insert(task.task_id, task);
        }
        self.order
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(task_ids);

        tracing::info!(job_id = %job_id, job_name = %job_name, task_count, "Job submitted");
        Ok(Submitted { job_id, task_count })
    }

    pub fn get_job(&self, job_id: &JobId) -> Result<JobView> {
        let job = self
            .jobs
            .get(job_id)
            .map(|j| j.value().clone())
            .ok_or(FarmError::JobNotFound(*job_id))?;
        Ok(self.view(job))
    }

    /// All jobs, oldest first, with derived status.
    pub fn list_jobs(&self) -> Vec<JobView> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|j| j.value().clone()).collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs.into_iter().map(|job| self.view(job)).collect()
    }

    fn view(&self, job: Job) -> JobView {
        let stats = self.stats_for(&job.task_ids);
        let status = stats.job_status(job.is_cancelled());
        JobView { job, status, stats }
    }

    fn stats_for(&self, task_ids: &[TaskId]) -> TaskStats {
        let mut stats = TaskStats::default();
        for id in task_ids {
            if let Some(task) = self.tasks.get(id) {
                stats.record(task.status);
            }
        }
        stats
    }

    pub fn job_status(&self, job_id: &JobId) -> Result<JobStatus> {
        self.get_job(job_id).map(|view| view.status)
    }

    pub fn get_task(&self, task_id: &TaskId) -> Result<Task> {
        self.tasks
            .get(task_id)
            .map(|t| t.value().clone())
            .ok_or(FarmError::TaskNotFound(*task_id))
    }

    pub fn tasks_for_job(&self, job_id: &JobId) -> Result<Vec<Task>> {
        let task_ids = self
            .jobs
            .get(job_id)
            .map(|j| j.task_ids.clone())
            .ok_or(FarmError::JobNotFound(*job_id))?;
        Ok(task_ids
            .iter()
            .filter_map(|id| self.tasks.get(id).map(|t| t.value().clone()))
            .collect())
    }

    /// Task ids in creation order.
    pub fn task_order(&self) -> Vec<TaskId> {
        self.order
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Pending tasks in creation order, at most `limit` of them.
    pub fn list_pending(&self, limit: Option<usize>) -> Vec<Task> {
        let limit = limit.unwrap_or(usize::MAX);
        let order = self.order.read().unwrap_or_else(PoisonError::into_inner);
        order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.status == TaskStatus::Pending)
            .take(limit)
            .map(|t| t.value().clone())
            .collect()
    }

    /// Tasks currently held under a lease.
    pub fn in_flight(&self) -> Vec<Task> {
        let order = self.order.read().unwrap_or_else(PoisonError::into_inner);
        order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .filter(|t| t.status.is_in_flight())
            .map(|t| t.value().clone())
            .collect()
    }

    /// Claim one task for `node_id` if it is still pending and runnable on
    /// `capabilities`. Check and claim happen under the task's entry lock, so
    /// concurrent claimers of the same task see exactly one winner.
    pub fn try_claim(
        &self,
        task_id: &TaskId,
        node_id: &str,
        capabilities: &BTreeSet<String>,
    ) -> Option<Task> {
        let claimable = |task: &Task| {
            task.status == TaskStatus::Pending && task.runnable_on(capabilities)
        };
        // Shared lock first: most scanned tasks are not claimable.
        if !claimable(self.tasks.get(task_id)?.value()) {
            return None;
        }

        let now = self.clock.now();
        let mut task = self.tasks.get_mut(task_id)?;
        if !claimable(&*task) {
            return None;
        }
        task.status = TaskStatus::Assigned;
        task.assigned_node = Some(node_id.to_string());
        task.lease_expires_at = Some(self.lease_deadline(now));
        task.updated_at = now;
        tracing::info!(
            task_id = %task.task_id,
            job_id = %task.job_id,
            node_id,
            frame = task.payload.frame,
            "Task assigned"
        );
        Some(task.clone())
    }

    /// Claim the oldest pending task `node_id` can run. The order index is
    /// walked under its read guard; no job lock is taken.
    pub fn claim_next(&self, node_id: &str, capabilities: &BTreeSet<String>) -> Option<Task> {
        let order = self.order.read().unwrap_or_else(PoisonError::into_inner);
        order
            .iter()
            .find_map(|task_id| self.try_claim(task_id, node_id, capabilities))
    }

    /// Apply a node's status report.
    ///
    /// Reports from anyone but the current lease holder are rejected as stale.
    /// Repeating the current status is a no-op success. A `failed` report
    /// re-queues the task unless its attempts are used up.
    pub fn report_status(&self, task_id: &TaskId, report: StatusReport) -> Result<Task> {
        let now = self.clock.now();
        let mut task = self
            .tasks
            .get_mut(task_id)
            .ok_or(FarmError::TaskNotFound(*task_id))?;

        if task.assigned_node.as_deref() != Some(report.node_id.as_str()) {
            tracing::warn!(
                task_id = %task_id,
                node_id = %report.node_id,
                holder = ?task.assigned_node,
                "Stale status report rejected"
            );
            return Err(FarmError::StaleOwner {
                task_id: *task_id,
                node_id: report.node_id,
            });
        }

        let from = task.status;
        match (from, report.status) {
            (TaskStatus::Done, TaskStatus::Done) | (TaskStatus::Failed, TaskStatus::Failed) => {
                tracing::debug!(task_id = %task_id, status = %from, "Duplicate report ignored");
            }
            (TaskStatus::Assigned | TaskStatus::Running, TaskStatus::Running) => {
                task.status = TaskStatus::Running;
                task.lease_expires_at = Some(self.lease_deadline(now));
                task.updated_at = now;
                if from == TaskStatus::Assigned {
                    tracing::info!(task_id = %task_id, node_id = %report.node_id, "Task running");
                }
            }
            (TaskStatus::Assigned | TaskStatus::Running, TaskStatus::Done) => {
                task.status = TaskStatus::Done;
                task.lease_expires_at = None;
                task.result = report.result;
                task.error = None;
                task.updated_at = now;
                task.finished_at = Some(now);
                tracing::info!(task_id = %task_id, node_id = %report.node_id, "Task done");
            }
            (TaskStatus::Assigned | TaskStatus::Running, TaskStatus::Failed) => {
                task.result = report.result;
                task.error = report.error;
                fail_attempt(&mut task, now);
            }
            (from, to) => {
                return Err(FarmError::invalid_transition(task_id, from, to));
            }
        }
        Ok(task.clone())
    }

    /// Re-queue every in-flight task whose lease has run out. Expiry counts
    /// as a failed attempt. Returns the ids that were reclaimed.
    pub fn reclaim_expired(&self) -> Vec<TaskId> {
        let now = self.clock.now();
        let expired: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.lease_expired(now))
            .map(|t| t.task_id)
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for id in expired {
            let Some(mut task) = self.tasks.get_mut(&id) else {
                continue;
            };
            // A report may have landed since the scan.
            if !task.lease_expired(now) {
                continue;
            }
            tracing::warn!(
                task_id = %id,
                node_id = ?task.assigned_node,
                attempt = task.attempt_count,
                "Lease expired"
            );
            task.error = Some("lease expired".to_string());
            fail_attempt(&mut task, now);
            reclaimed.push(id);
        }
        reclaimed
    }

    /// Operator re-queue of a finished task. Resets the attempt budget.
    ///
    /// The job entry stays read-locked across the task update so a concurrent
    /// purge cannot delete the job in between.
    pub fn requeue(&self, task_id: &TaskId) -> Result<Task> {
        let now = self.clock.now();
        let job_id = self.get_task(task_id)?.job_id;
        let job = self
            .jobs
            .get(&job_id)
            .ok_or(FarmError::TaskNotFound(*task_id))?;
        if job.is_cancelled() {
            return Err(FarmError::invalid_transition(
                task_id,
                TaskStatus::Cancelled,
                TaskStatus::Pending,
            ));
        }

        let mut task = self
            .tasks
            .get_mut(task_id)
            .ok_or(FarmError::TaskNotFound(*task_id))?;
        match task.status {
            TaskStatus::Done | TaskStatus::Failed => {
                task.status = TaskStatus::Pending;
                task.assigned_node = None;
                task.lease_expires_at = None;
                task.attempt_count = 0;
                task.result = None;
                task.error = None;
                task.finished_at = None;
                task.updated_at = now;
                tracing::info!(task_id = %task_id, "Task re-queued");
                Ok(task.clone())
            }
            from => Err(FarmError::invalid_transition(
                task_id,
                from,
                TaskStatus::Pending,
            )),
        }
    }

    /// Cancel a job: every non-terminal task becomes `cancelled` and loses its
    /// lease, so late reports from its former holder are stale. Returns how
    /// many tasks were cancelled.
    pub fn cancel(&self, job_id: &JobId) -> Result<usize> {
        let now = self.clock.now();
        let view = self.get_job(job_id)?;
        match view.status {
            JobStatus::Cancelled => return Ok(0),
            JobStatus::Completed | JobStatus::Failed => {
                return Err(FarmError::invalid_transition(
                    job_id,
                    view.status,
                    JobStatus::Cancelled,
                ));
            }
            JobStatus::Pending | JobStatus::Running => {}
        }

        if let Some(mut job) = self.jobs.get_mut(job_id) {
            job.cancelled_at.get_or_insert(now);
        }

        let mut cancelled = 0;
        for id in &view.job.task_ids {
            let Some(mut task) = self.tasks.get_mut(id) else {
                continue;
            };
            if task.status.is_terminal() {
                continue;
            }
            task.status = TaskStatus::Cancelled;
            task.assigned_node = None;
            task.lease_expires_at = None;
            task.updated_at = now;
            task.finished_at = Some(now);
            cancelled += 1;
        }
        tracing::info!(job_id = %job_id, cancelled, "Job cancelled");
        Ok(cancelled)
    }

    /// Delete a finished job and all of its tasks.
    ///
    /// The finished check is repeated under the job's entry lock, which
    /// `requeue` also holds while it reopens a task.
    pub fn purge(&self, job_id: &JobId) -> Result<usize> {
        let view = self.get_job(job_id)?;
        if !view.status.is_finished() {
            return Err(FarmError::invalid_transition(
                job_id,
                view.status,
                "purged",
            ));
        }
        let removed = self.jobs.remove_if(job_id, |_, job| {
            self.stats_for(&job.task_ids)
                .job_status(job.is_cancelled())
                .is_finished()
        });
        let Some((_, job)) = removed else {
            return match self.job_status(job_id) {
                Ok(status) => Err(FarmError::invalid_transition(job_id, status, "purged")),
                Err(e) => Err(e),
            };
        };
        self.job_count.fetch_sub(1, Ordering::AcqRel);

        let task_ids: BTreeSet<TaskId> = job.task_ids.iter().copied().collect();
        for id in &task_ids {
            self.tasks.remove(id);
        }
        self.order
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|id| !task_ids.contains(id));

        tracing::info!(job_id = %job_id, tasks = task_ids.len(), "Job purged");
        Ok(task_ids.len())
    }

    /// Purge every completed, failed or cancelled job. Returns the number of jobs removed.
    pub fn purge_finished(&self) -> usize {
        let finished: Vec<JobId> = self
            .list_jobs()
            .into_iter()
            .filter(|v| v.status.is_finished())
            .map(|v| v.job.id)
            .collect();
        finished
            .iter()
            .filter(|id| self.purge(id).is_ok())
            .count()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Count a failed attempt: back to `pending` while attempts remain, terminal
/// `failed` once `attempt_count` has reached the limit.
fn fail_attempt(task: &mut Task, now: DateTime<Utc>) {
    let node_id = task.assigned_node.take();
    task.lease_expires_at = None;
    task.updated_at = now;
    if task.attempt_count >= task.max_attempts {
        task.status = TaskStatus::Failed;
        task.finished_at = Some(now);
        // Keep the last holder for audit.
        task.assigned_node = node_id;
        tracing::error!(
            task_id = %task.task_id,
            job_id = %task.job_id,
            attempts = task.attempt_count,
            "Task failed permanently"
        );
    } else {
        task.attempt_count += 1;
        task.status = TaskStatus::Pending;
        tracing::info!(
            task_id = %task.task_id,
            attempt = task.attempt_count,
            max_attempts = task.max_attempts,
            "Task re-queued after failure"
        );
    }
}
