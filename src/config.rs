use std::net::SocketAddr;

use chrono::Duration;

pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_LEASE_DURATION_MS: u64 = 300_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_MAX_JOBS: usize = 10_000;
pub const DEFAULT_MAX_TASKS_PER_JOB: u64 = 100_000;

/// How a submitted job's frame range is split into tasks.
///
/// Jobs may override this per submission with `frames_per_task`; otherwise the
/// coordinator-wide default applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Decomposition {
    /// One task per frame.
    #[default]
    PerFrame,
    /// Consecutive frames grouped into tasks of at most `n` frames.
    Chunked(u32),
}

impl Decomposition {
    /// Build from a frames-per-task count. Zero and one both mean per-frame.
    pub fn from_frames_per_task(n: u32) -> Self {
        if n <= 1 {
            Decomposition::PerFrame
        } else {
            Decomposition::Chunked(n)
        }
    }

    pub fn frames_per_task(&self) -> u32 {
        match self {
            Decomposition::PerFrame => 1,
            Decomposition::Chunked(n) => *n,
        }
    }
}

/// Tunables for the store and assigner.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// A node whose last heartbeat is older than this is marked offline.
    pub heartbeat_timeout_ms: u64,
    /// How long an acquired task stays claimed without a report.
    pub lease_duration_ms: u64,
    /// Failures (explicit or by lease expiry) tolerated before a task fails terminally.
    pub max_attempts: u32,
    pub max_jobs: usize,
    /// Submissions that would decompose into more tasks are rejected.
    pub max_tasks_per_job: u64,
    pub decomposition: Decomposition,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            lease_duration_ms: DEFAULT_LEASE_DURATION_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_jobs: DEFAULT_MAX_JOBS,
            max_tasks_per_job: DEFAULT_MAX_TASKS_PER_JOB,
            decomposition: Decomposition::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        millis(self.heartbeat_timeout_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        millis(self.lease_duration_ms)
    }
}

/// Saturates instead of wrapping for values past `i64::MAX`.
fn millis(ms: u64) -> Duration {
    i64::try_from(ms)
        .ok()
        .and_then(Duration::try_milliseconds)
        .unwrap_or(Duration::MAX)
}

#[derive(Debug, Clone)]
pub struct FarmConfig {
    pub listen_addr: SocketAddr,
    /// Period of the background sweep (offline nodes, expired leases).
    pub sweep_interval_ms: u64,
    pub scheduler: SchedulerConfig,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl FarmConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_lease_duration_ms(mut self, ms: u64) -> Self {
        self.scheduler.lease_duration_ms = ms;
        self
    }

    pub fn with_heartbeat_timeout_ms(mut self, ms: u64) -> Self {
        self.scheduler.heartbeat_timeout_ms = ms;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.scheduler.max_attempts = attempts;
        self
    }
}
