//! Render job scheduling.
//!
//! - [`registry`]: worker liveness from heartbeats
//! - [`job`]: jobs, tasks and their statuses
//! - [`store`]: the task state machine (reports, retries, cancel, purge)
//! - [`assigner`]: FIFO task leasing to eligible nodes

pub mod assigner;
pub mod job;
pub mod registry;
pub mod store;

pub use assigner::{Assigner, Assignment};
pub use job::{Job, JobId, JobSpec, JobStatus, JobView, Task, TaskId, TaskStatus};
pub use registry::{Heartbeat, HeartbeatAck, Node, NodeRegistry, NodeStatus};
pub use store::{JobStore, StatusReport, Submitted};
