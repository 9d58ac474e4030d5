use std::time::Duration;

use crate::dispatch::test_helpers::{create_test_sender, pair, submission, wait_for_terminal};
use crate::error::Error;
use crate::types::{TaskId, TaskState};

#[tokio::test]
async fn task_queries_require_ownership() {
    let (sender, _transport) = create_test_sender();
    pair(&sender, "owner-1", "acct-1").await;
    let status = sender
        .submit(submission("owner-1", "acct-1", &["hello"]))
        .await
        .expect("submission must be accepted");

    let err = sender
        .task_status("owner-2".into(), status.task_id)
        .await
        .expect_err("a foreign owner must not read the task");
    assert!(matches!(err, Error::Forbidden { .. }), "got {err:?}");

    let err = sender
        .stop_task("owner-2".into(), status.task_id)
        .await
        .expect_err("a foreign owner must not stop the task");
    assert!(matches!(err, Error::Forbidden { .. }), "got {err:?}");

    // The owner still sees it
    sender
        .task_status("owner-1".into(), status.task_id)
        .await
        .expect("the owner must read their own task");
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let (sender, _transport) = create_test_sender();

    let err = sender
        .task_status("owner-1".into(), TaskId::new(999))
        .await
        .expect_err("an unknown id must be NotFound");
    assert!(matches!(err, Error::NotFound(_)), "got {err:?}");

    let err = sender
        .stop_task("owner-1".into(), TaskId::new(999))
        .await
        .expect_err("stopping an unknown id must be NotFound");
    assert!(matches!(err, Error::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn list_tasks_is_owner_scoped_and_ordered() {
    let (sender, _transport) = create_test_sender();
    pair(&sender, "owner-1", "acct-1").await;
    pair(&sender, "owner-2", "acct-2").await;

    let first = sender
        .submit(submission("owner-1", "acct-1", &["a"]))
        .await
        .expect("submission must be accepted");
    sender
        .submit(submission("owner-2", "acct-2", &["b"]))
        .await
        .expect("submission must be accepted");
    let third = sender
        .submit(submission("owner-1", "acct-1", &["c"]))
        .await
        .expect("submission must be accepted");

    let tasks = sender.list_tasks("owner-1".into()).await;
    let ids: Vec<TaskId> = tasks.iter().map(|status| status.task_id).collect();
    assert_eq!(
        ids,
        vec![first.task_id, third.task_id],
        "listing must cover exactly the owner's tasks in id order"
    );
}

#[tokio::test]
async fn stopping_a_finished_task_changes_nothing() {
    let (sender, transport) = create_test_sender();
    pair(&sender, "owner-1", "acct-1").await;
    let status = sender
        .submit(submission("owner-1", "acct-1", &["one", "two"]))
        .await
        .expect("submission must be accepted");
    let finished =
        wait_for_terminal(&sender, "owner-1", status.task_id, Duration::from_secs(5)).await;
    assert_eq!(finished.state, TaskState::Completed);

    // A late stop is a no-op, twice over
    for _ in 0..2 {
        let after_stop = sender
            .stop_task("owner-1".into(), status.task_id)
            .await
            .expect("stopping a finished task must not error");
        assert_eq!(after_stop.state, TaskState::Completed, "the result is kept");
        assert_eq!(after_stop.sent_count, 2);
    }
    assert_eq!(transport.deliveries().len(), 2);
}
