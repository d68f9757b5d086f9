//! Assignment: FIFO order, capability matching, node eligibility and lease
//! recovery.


use std::collections::HashSet;

use render_farm::scheduler::{JobSpec, StatusReport, TaskStatus};
use test_harness::{caps, TestFarm, HEARTBEAT_TIMEOUT_MS, LEASE_DURATION_MS};

#[test]
fn test_acquire_is_fifo_across_jobs() {
    let farm = TestFarm::new();
    let first = farm.store.submit(JobSpec::new("first", 1, 2)).unwrap().job_id;
    let second = farm.store.submit(JobSpec::new("second", 1, 1)).unwrap().job_id;

    let order: Vec<_> = (0..3)
        .map(|_| {
            let t = farm.acquire("node-a", &[]).unwrap();
            (t.job_id, t.payload.frame)
        })
        .collect();
    assert_eq!(order, vec![(first, 1), (first, 2), (second, 1)]);
    assert!(farm.acquire("node-a", &[]).is_none());
}

#[test]
fn test_acquired_task_carries_lease() {
    let farm = TestFarm::new();
    farm.store.submit(JobSpec::new("shot", 1, 1)).unwrap();
    let task = farm.acquire("node-a", &[]).unwrap();

    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(task.assigned_node.as_deref(), Some("node-a"));
    let expiry = task.lease_expires_at.unwrap();
    assert_eq!(
        (expiry - task.created_at).num_milliseconds(),
        LEASE_DURATION_MS as i64
    );

    let assignments = farm.assigner.assignments();
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].task_id, task.task_id);
    assert_eq!(assignments[0].node_id, "node-a");
    assert_eq!(assignments[0].lease_expiry, expiry);
}

#[test]
fn test_capability_mismatch_skips_to_next_task() {
    let farm = TestFarm::new();
    let gpu_job = farm
        .store
        .submit(JobSpec::new("gpu", 1, 1).with_requires(["gpu"]))
        .unwrap()
        .job_id;
    let cpu_job = farm.store.submit(JobSpec::new("cpu", 1, 1)).unwrap().job_id;

    let cpu_task = farm.acquire("cpu-node", &["blender"]).unwrap();
    assert_eq!(cpu_task.job_id, cpu_job);
    assert!(farm.acquire("cpu-node", &["blender"]).is_none());

    let gpu_task = farm.acquire("gpu-node", &["blender", "gpu"]).unwrap();
    assert_eq!(gpu_task.job_id, gpu_job);
}

#[test]
fn test_unknown_or_offline_node_gets_nothing() {
    let farm = TestFarm::new();
    farm.store.submit(JobSpec::new("shot", 1, 2)).unwrap();

    assert!(farm.assigner.acquire("stranger", &caps(&[])).is_none());

    farm.heartbeat("node-a", &[]);
    farm.nodes.mark_offline("node-a").unwrap();
    assert!(farm.assigner.acquire("node-a", &caps(&[])).is_none());

    farm.heartbeat("node-b", &[]);
    farm.advance_ms(HEARTBEAT_TIMEOUT_MS + 1);
    assert!(farm.assigner.acquire("node-b", &caps(&[])).is_none());

    assert_eq!(farm.store.list_pending(None).len(), 2);
}

#[test]
fn test_busy_node_can_still_acquire() {
    let farm = TestFarm::new();
    farm.store.submit(JobSpec::new("shot", 1, 1)).unwrap();
    farm.nodes.heartbeat(
        render_farm::scheduler::Heartbeat::new("node-a").with_load(1.0),
    );
    assert!(farm.assigner.acquire("node-a", &caps(&[])).is_some());
}

#[test]
fn test_expired_lease_requeues_once() {
    let farm = TestFarm::new();
    farm.store.submit(JobSpec::new("shot", 1, 1)).unwrap();
    let task = farm.acquire("node-a", &[]).unwrap();

    farm.advance_ms(LEASE_DURATION_MS);
    let reclaimed = farm.assigner.reclaim_expired();
    assert_eq!(reclaimed, vec![task.task_id]);
    assert!(farm.assigner.reclaim_expired().is_empty());

    let after = farm.store.get_task(&task.task_id).unwrap();
    assert_eq!(after.status, TaskStatus::Pending);
    assert_eq!(after.attempt_count, 1);
    assert!(after.assigned_node.is_none());
    assert!(after.lease_expires_at.is_none());
    assert_eq!(after.error.as_deref(), Some("lease expired"));
    assert!(farm.assigner.assignments().is_empty());

    // The old holder's late report is stale; a fresh node picks the task up.
    let err = farm
        .store
        .report_status(&task.task_id, StatusReport::new("node-a", TaskStatus::Done))
        .unwrap_err();
    assert_eq!(err.code(), "stale_owner");

    let retry = farm.acquire("node-b", &[]).unwrap();
    assert_eq!(retry.task_id, task.task_id);
    assert_eq!(retry.attempt_count, 1);
}

#[test]
fn test_acquire_recovers_expired_leases_first() {
    let farm = TestFarm::new();
    farm.store.submit(JobSpec::new("shot", 1, 1)).unwrap();
    let task = farm.acquire("node-a", &[]).unwrap();
    assert!(farm.acquire("node-b", &[]).is_none());

    farm.advance_ms(LEASE_DURATION_MS + 1);
    let retry = farm.acquire("node-b", &[]).unwrap();
    assert_eq!(retry.task_id, task.task_id);
    assert_eq!(retry.assigned_node.as_deref(), Some("node-b"));
}

#[test]
fn test_list_pending_reclaims_before_listing() {
    let farm = TestFarm::new();
    farm.store.submit(JobSpec::new("shot", 1, 1)).unwrap();
    farm.acquire("node-a", &[]).unwrap();
    assert!(farm.assigner.list_pending(None).is_empty());

    farm.advance_ms(LEASE_DURATION_MS + 1);
    assert_eq!(farm.assigner.list_pending(None).len(), 1);
}

#[test]
fn test_expiry_at_attempt_limit_fails_the_task() {
    let farm = TestFarm::new();
    let job_id = farm.store.submit(JobSpec::new("shot", 1, 1)).unwrap().job_id;

    for _ in 0..3 {
        farm.acquire("node-a", &[]).unwrap();
        farm.advance_ms(LEASE_DURATION_MS + 1);
        farm.assigner.reclaim_expired();
    }

    let task = &farm.store.tasks_for_job(&job_id).unwrap()[0];
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempt_count, 2);
    assert!(farm.acquire("node-a", &[]).is_none());
    assert_eq!(
        farm.store.job_status(&job_id).unwrap(),
        render_farm::scheduler::JobStatus::Failed
    );
}

#[test]
fn test_concurrent_acquire_never_double_leases() {
    let farm = TestFarm::new();
    farm.store.submit(JobSpec::new("big", 1, 64)).unwrap();
    let nodes: Vec<String> = (0..8).map(|i| format!("node-{i}")).collect();
    for node in &nodes {
        farm.heartbeat(node, &[]);
    }

    let claimed: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = nodes
            .iter()
            .map(|node| {
                let assigner = farm.assigner.clone();
                s.spawn(move || {
                    let mut mine = Vec::new();
                    while let Some(task) = assigner.acquire(node, &caps(&[])) {
                        mine.push(task.task_id);
                    }
                    mine
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });

    let unique: HashSet<_> = claimed.iter().collect();
    assert_eq!(claimed.len(), 64);
    assert_eq!(unique.len(), 64);
    assert_eq!(farm.assigner.assignments().len(), 64);
}

#[test]
fn test_expiry_and_completion_race_has_one_winner() {
    for _ in 0..200 {
        let farm = TestFarm::new();
        farm.store.submit(JobSpec::new("shot", 1, 1)).unwrap();
        let task = farm.acquire("node-a", &[]).unwrap();
        farm.clock.set(task.lease_expires_at.unwrap());

        let barrier = std::sync::Barrier::new(2);
        let (reclaimed, reported) = std::thread::scope(|s| {
            let reclaim = s.spawn(|| {
                barrier.wait();
                farm.store.reclaim_expired()
            });
            let report = s.spawn(|| {
                barrier.wait();
                farm.store
                    .report_status(&task.task_id, StatusReport::new("node-a", TaskStatus::Done))
            });
            (reclaim.join().unwrap(), report.join().unwrap())
        });

        let after = farm.store.get_task(&task.task_id).unwrap();
        match reported {
            Ok(done) => {
                assert_eq!(done.status, TaskStatus::Done);
                assert!(reclaimed.is_empty());
                assert_eq!(after.status, TaskStatus::Done);
                assert_eq!(after.attempt_count, 0);
            }
            Err(err) => {
                assert_eq!(err.code(), "stale_owner");
                assert_eq!(reclaimed, vec![task.task_id]);
                assert_eq!(after.status, TaskStatus::Pending);
                assert_eq!(after.attempt_count, 1);
                assert!(after.assigned_node.is_none());
            }
        }
    }
}
