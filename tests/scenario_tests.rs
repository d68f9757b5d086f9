//! End-to-end coordinator scenarios: a job rendered to completion, and
//! recovery from a node that disappears mid-frame.


use render_farm::scheduler::{JobSpec, JobStatus, StatusReport, TaskStatus};
use test_harness::{TestFarm, LEASE_DURATION_MS};

#[test]
fn test_three_frame_job_runs_to_completion() {
    let farm = TestFarm::new();
    let job_id = farm.store.submit(JobSpec::new("shot_010", 1, 3)).unwrap().job_id;

    let tasks = farm.store.tasks_for_job(&job_id).unwrap();
    assert_eq!(tasks.len(), 3);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Pending));
    assert_eq!(farm.store.job_status(&job_id).unwrap(), JobStatus::Pending);

    let first = farm.acquire("node-a", &[]).unwrap();
    assert_eq!(first.task_id, tasks[0].task_id);
    assert_eq!(first.status, TaskStatus::Assigned);

    let done = farm
        .store
        .report_status(&first.task_id, StatusReport::new("node-a", TaskStatus::Done))
        .unwrap();
    assert_eq!(done.status, TaskStatus::Done);
    assert_eq!(farm.store.job_status(&job_id).unwrap(), JobStatus::Running);

    while let Some(task) = farm.acquire("node-a", &[]) {
        farm.store
            .report_status(&task.task_id, StatusReport::new("node-a", TaskStatus::Running))
            .unwrap();
        farm.store
            .report_status(&task.task_id, StatusReport::new("node-a", TaskStatus::Done))
            .unwrap();
    }

    let view = farm.store.get_job(&job_id).unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    assert_eq!(view.stats.done, 3);
}

#[test]
fn test_crashed_node_task_is_recovered_by_another_node() {
    let farm = TestFarm::new();
    let job_id = farm.store.submit(JobSpec::new("shot_020", 1, 3)).unwrap().job_id;
    let tasks = farm.store.tasks_for_job(&job_id).unwrap();

    let task1 = farm.acquire("node-a", &[]).unwrap();
    farm.store
        .report_status(&task1.task_id, StatusReport::new("node-a", TaskStatus::Done))
        .unwrap();

    // Node B takes frame 2 and goes silent.
    let task2 = farm.acquire("node-b", &[]).unwrap();
    assert_eq!(task2.task_id, tasks[1].task_id);
    farm.store
        .report_status(&task2.task_id, StatusReport::new("node-b", TaskStatus::Running))
        .unwrap();

    farm.advance_ms(LEASE_DURATION_MS + 1);
    let pending = farm.assigner.list_pending(None);
    let reverted = pending
        .iter()
        .find(|t| t.task_id == task2.task_id)
        .unwrap();
    assert_eq!(reverted.status, TaskStatus::Pending);
    assert_eq!(reverted.attempt_count, 1);
    assert!(reverted.assigned_node.is_none());

    let retry = farm.acquire("node-c", &[]).unwrap();
    assert_eq!(retry.task_id, task2.task_id);
    assert_eq!(retry.attempt_count, 1);
    farm.store
        .report_status(&retry.task_id, StatusReport::new("node-c", TaskStatus::Done))
        .unwrap();

    // Node B coming back late cannot overwrite node C's result.
    let late = farm
        .store
        .report_status(&task2.task_id, StatusReport::new("node-b", TaskStatus::Failed))
        .unwrap_err();
    assert_eq!(late.code(), "stale_owner");

    let task3 = farm.acquire("node-c", &[]).unwrap();
    farm.store
        .report_status(&task3.task_id, StatusReport::new("node-c", TaskStatus::Done))
        .unwrap();

    let view = farm.store.get_job(&job_id).unwrap();
    assert_eq!(view.status, JobStatus::Completed);
    let finished = farm.store.get_task(&task2.task_id).unwrap();
    assert_eq!(finished.assigned_node.as_deref(), Some("node-c"));
    assert_eq!(finished.attempt_count, 1);
}
