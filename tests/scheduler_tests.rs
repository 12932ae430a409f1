//! Scheduler tests: autostart order, concurrency limits, high priority
//! preemption and the job lifecycle rules enforced by the scheduler.

mod test_harness;

use std::time::Duration;

use render_controller::error::ControllerError;
use render_controller::scheduler::{EnqueueParams, JobStatus, Priority};
use test_harness::{
    assert_eventually, project_file, rendered_frames, status_of, test_config, test_scheduler,
    Behavior, MockExecutor, TestController,
};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_autostart_runs_jobs_in_fifo_order_one_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &["n1"]);
    config.autostart = true;
    config.max_concurrent_jobs = 1;
    let mock = MockExecutor::with_default(Behavior::slow(30));
    let controller = TestController::start(config, mock.clone()).await;
    let scheduler = controller.scheduler.clone();

    let path = project_file(dir.path(), "a.blend");
    scheduler
        .enqueue(Some("a".into()), EnqueueParams::new(&path, 1, 3, &["n1"]))
        .await
        .unwrap();
    scheduler
        .enqueue(Some("b".into()), EnqueueParams::new(&path, 1, 3, &["n1"]))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let a = scheduler.status("a").await.unwrap();
        let b = scheduler.status("b").await.unwrap();
        assert!(
            !(a == JobStatus::Rendering && b == JobStatus::Rendering),
            "only one job may render at a time"
        );
        if a == JobStatus::Finished && b == JobStatus::Finished {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "jobs did not finish");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let order: Vec<String> = mock.launches().into_iter().map(|l| l.job_id).collect();
    assert_eq!(order, vec!["a", "a", "a", "b", "b", "b"]);

    controller.shutdown().await;
}

#[tokio::test]
async fn test_autostart_fills_up_to_the_concurrency_limit() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &["n1", "n2"]);
    config.autostart = true;
    config.max_concurrent_jobs = 2;
    let mock = MockExecutor::with_default(Behavior::Hang);
    let scheduler = test_scheduler(config, mock);

    let path = project_file(dir.path(), "a.blend");
    for id in ["a", "b", "c"] {
        scheduler
            .enqueue(Some(id.into()), EnqueueParams::new(&path, 1, 2, &["n1", "n2"]))
            .await
            .unwrap();
    }
    scheduler.check_autostart().await;

    assert_eq!(status_of(&scheduler, "a").await, "Rendering");
    assert_eq!(status_of(&scheduler, "b").await, "Rendering");
    assert_eq!(status_of(&scheduler, "c").await, "Waiting");
    assert_eq!(scheduler.waitlist().await, vec!["c"]);

    // A second pass changes nothing while the limit is reached.
    scheduler.check_autostart().await;
    assert_eq!(status_of(&scheduler, "c").await, "Waiting");

    for id in ["a", "b"] {
        scheduler.stop(id, true).await.unwrap();
    }
}

#[tokio::test]
async fn test_autostart_disabled_starts_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockExecutor::new();
    let scheduler = test_scheduler(test_config(dir.path(), &["n1"]), mock.clone());

    let path = project_file(dir.path(), "a.blend");
    scheduler
        .enqueue(Some("a".into()), EnqueueParams::new(&path, 1, 2, &["n1"]))
        .await
        .unwrap();
    scheduler.check_autostart().await;
    assert_eq!(status_of(&scheduler, "a").await, "Waiting");

    assert!(scheduler.toggle_autostart());
    scheduler.check_autostart().await;
    assert_ne!(status_of(&scheduler, "a").await, "Waiting");
}

#[tokio::test]
async fn test_high_priority_job_preempts_normal_job() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &["n1"]);
    config.autostart = true;
    let mock = MockExecutor::with_default(Behavior::slow(40));
    let scheduler = test_scheduler(config, mock.clone());

    let path = project_file(dir.path(), "a.blend");
    scheduler
        .enqueue(Some("a".into()), EnqueueParams::new(&path, 1, 20, &["n1"]))
        .await
        .unwrap();
    scheduler.check_autostart().await;
    assert_eq!(status_of(&scheduler, "a").await, "Rendering");

    assert_eventually(
        || async { !rendered_frames(&scheduler, "a").await.is_empty() },
        WAIT,
        "a should make progress",
    )
    .await;

    let urgent = EnqueueParams::new(&path, 1, 2, &["n1"]).with_priority(Priority::High);
    scheduler.enqueue(Some("c".into()), urgent).await.unwrap();
    scheduler.check_autostart().await;

    assert_eq!(status_of(&scheduler, "a").await, "Paused");
    assert_eq!(status_of(&scheduler, "c").await, "Rendering");
    assert_eq!(scheduler.waitlist().await, vec!["a"]);
    let kept = rendered_frames(&scheduler, "a").await.len();
    assert!(kept >= 1, "paused job keeps its rendered frames");

    // Nothing else starts while the high priority job renders.
    scheduler.check_autostart().await;
    assert_eq!(status_of(&scheduler, "a").await, "Paused");

    assert_eventually(
        || async { status_of(&scheduler, "c").await == "Finished" },
        WAIT,
        "c should finish",
    )
    .await;

    scheduler.check_autostart().await;
    assert_eq!(status_of(&scheduler, "a").await, "Rendering");
    assert_eventually(
        || async { status_of(&scheduler, "a").await == "Finished" },
        WAIT,
        "a should resume and finish",
    )
    .await;
    assert_eq!(rendered_frames(&scheduler, "a").await.len(), 20);
}

#[tokio::test]
async fn test_high_priority_job_blocks_normal_starts() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &["n1", "n2"]);
    config.autostart = true;
    config.max_concurrent_jobs = 2;
    let mock = MockExecutor::with_default(Behavior::Hang);
    let scheduler = test_scheduler(config, mock);

    let path = project_file(dir.path(), "a.blend");
    let urgent = EnqueueParams::new(&path, 1, 2, &["n1"]).with_priority(Priority::High);
    scheduler.enqueue(Some("h".into()), urgent).await.unwrap();
    scheduler
        .enqueue(Some("n".into()), EnqueueParams::new(&path, 1, 2, &["n2"]))
        .await
        .unwrap();

    scheduler.check_autostart().await;
    scheduler.check_autostart().await;
    assert_eq!(status_of(&scheduler, "h").await, "Rendering");
    assert_eq!(status_of(&scheduler, "n").await, "Waiting");

    scheduler.stop("h", true).await.unwrap();
}

#[tokio::test]
async fn test_start_requires_waiting_job() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockExecutor::with_default(Behavior::Hang);
    let scheduler = test_scheduler(test_config(dir.path(), &["n1"]), mock);

    let path = project_file(dir.path(), "a.blend");
    scheduler
        .enqueue(Some("a".into()), EnqueueParams::new(&path, 1, 2, &["n1"]))
        .await
        .unwrap();
    scheduler.start("a").await.unwrap();

    let err = scheduler.start("a").await.unwrap_err();
    assert_eq!(err.kind(), "JobStatusError");
    let err = scheduler.resume("a", false).await.unwrap_err();
    assert_eq!(err.kind(), "JobStatusError");

    scheduler.stop("a", true).await.unwrap();
    let err = scheduler.stop("a", true).await.unwrap_err();
    assert_eq!(err.kind(), "JobStatusError");
}

#[tokio::test]
async fn test_delete_refuses_rendering_job() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockExecutor::with_default(Behavior::Hang);
    let scheduler = test_scheduler(test_config(dir.path(), &["n1"]), mock);

    let path = project_file(dir.path(), "a.blend");
    scheduler
        .enqueue(Some("a".into()), EnqueueParams::new(&path, 1, 2, &["n1"]))
        .await
        .unwrap();
    scheduler.start("a").await.unwrap();

    let err = scheduler.delete("a").await.unwrap_err();
    assert!(matches!(
        err,
        ControllerError::JobStatus {
            status: JobStatus::Rendering,
            ..
        }
    ));
    assert!(scheduler.exists("a").await);

    scheduler.stop("a", true).await.unwrap();
    scheduler.delete("a").await.unwrap();
    assert!(!scheduler.exists("a").await);
}

#[tokio::test]
async fn test_enqueue_replaces_idle_job_but_not_rendering_one() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockExecutor::with_default(Behavior::Hang);
    let scheduler = test_scheduler(test_config(dir.path(), &["n1"]), mock);

    let path = project_file(dir.path(), "a.blend");
    scheduler
        .enqueue(Some("a".into()), EnqueueParams::new(&path, 1, 2, &["n1"]))
        .await
        .unwrap();
    scheduler
        .enqueue(Some("a".into()), EnqueueParams::new(&path, 1, 10, &["n1"]))
        .await
        .unwrap();
    let attrs = scheduler.attrs("a").await.unwrap();
    assert_eq!(attrs["end_frame"], 10);
    assert_eq!(scheduler.waitlist().await, vec!["a"]);

    scheduler.start("a").await.unwrap();
    let err = scheduler
        .enqueue(Some("a".into()), EnqueueParams::new(&path, 1, 3, &["n1"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "JobStatusError");

    scheduler.stop("a", true).await.unwrap();
}

#[tokio::test]
async fn test_enqueue_rejects_bad_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = test_scheduler(test_config(dir.path(), &["n1"]), MockExecutor::new());
    let path = project_file(dir.path(), "a.blend");

    let cases = [
        EnqueueParams::new(&path, 5, 1, &["n1"]),
        EnqueueParams::new(&path, 1, 5, &[]),
        EnqueueParams::new(&path, 1, 5, &["n1"]).with_extra_frames(&[3]),
        EnqueueParams::new("/no/such/project.blend", 1, 5, &["n1"]),
        EnqueueParams::new("/tmp/a.blend; rm -rf /", 1, 5, &["n1"]),
    ];
    for params in cases {
        let err = scheduler.enqueue(None, params).await.unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    let err = scheduler
        .enqueue(None, EnqueueParams::new(&path, 1, 5, &["n9"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NodeNotFoundError");
    assert!(scheduler.waitlist().await.is_empty());
}

#[tokio::test]
async fn test_set_priority_and_toggle_node() {
    let dir = tempfile::tempdir().unwrap();
    let scheduler = test_scheduler(test_config(dir.path(), &["n1", "n2"]), MockExecutor::new());
    let path = project_file(dir.path(), "a.blend");
    scheduler
        .enqueue(Some("a".into()), EnqueueParams::new(&path, 1, 2, &["n1"]))
        .await
        .unwrap();

    scheduler.set_priority("a", Priority::High).await.unwrap();
    let attrs = scheduler.attrs("a").await.unwrap();
    assert_eq!(attrs["priority"], "High");

    assert!(scheduler.toggle_node("a", "n2").await.unwrap());
    assert!(!scheduler.toggle_node("a", "n1").await.unwrap());
    let attrs = scheduler.attrs("a").await.unwrap();
    assert_eq!(attrs["node_pool"], serde_json::json!(["n2"]));

    let err = scheduler.toggle_node("a", "n9").await.unwrap_err();
    assert_eq!(err.kind(), "NodeNotFoundError");
}

#[tokio::test]
async fn test_killall_reaches_every_node() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockExecutor::new();
    let scheduler = test_scheduler(test_config(dir.path(), &["n1", "n2"]), mock.clone());

    let targets = scheduler.killall(&[], "blender").unwrap();
    assert_eq!(targets, vec!["n1", "n2"]);
    assert_eventually(
        || async { mock.killalls().len() == 2 },
        WAIT,
        "killall should reach both nodes",
    )
    .await;
    assert!(mock
        .killalls()
        .iter()
        .all(|(_, process)| process == "blender"));
}
