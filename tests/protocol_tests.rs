//! Protocol tests: framed JSON commands against a live controller.

mod test_harness;

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use render_controller::protocol::client::send_raw;
use render_controller::protocol::frame::read_message;
use render_controller::protocol::{send_request, Reply};
use test_harness::{
    assert_eventually, frames_in, project_file, test_config, Behavior, MockExecutor,
    TestController,
};

const WAIT: Duration = Duration::from_secs(10);

async fn ok(controller: &TestController, command: &str, kwargs: Value) -> Value {
    send_request(controller.addr, command, kwargs)
        .await
        .unwrap()
        .into_result()
        .unwrap_or_else(|e| panic!("{} failed: {}", command, e))
}

async fn error_kind(controller: &TestController, command: &str, kwargs: Value) -> String {
    let reply = send_request(controller.addr, command, kwargs).await.unwrap();
    reply
        .error_kind()
        .unwrap_or_else(|| panic!("{} should fail", command))
        .to_string()
}

#[tokio::test]
async fn test_enqueue_and_render_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &["n1", "n2"]);
    config.autostart = true;
    let controller = TestController::start(config, MockExecutor::new()).await;

    let path = project_file(dir.path(), "a.blend");
    let reply = ok(
        &controller,
        "enqueue",
        json!({
            "index": "job1",
            "path": path,
            "startframe": 1,
            "endframe": 5,
            "nodes": ["n1", "n2"],
        }),
    )
    .await;
    assert_eq!(reply["index"], "job1");

    assert_eventually(
        || async { ok(&controller, "get_status", json!({"index": "job1"})).await == "Finished" },
        WAIT,
        "job1 should finish",
    )
    .await;

    let attrs = ok(&controller, "get_attrs", json!({"index": "job1"})).await;
    let mut frames = frames_in(&attrs);
    frames.sort_unstable();
    assert_eq!(frames, vec![1, 2, 3, 4, 5]);
    assert_eq!(attrs["progress"], 100.0);

    let all = ok(&controller, "get_attrs", json!({})).await;
    assert!(all.get("job1").is_some());
    assert_eq!(ok(&controller, "job_exists", json!({"index": "job1"})).await, true);

    controller.shutdown().await;
}

#[tokio::test]
async fn test_unknown_command_is_refused_and_server_keeps_serving() {
    let dir = tempfile::tempdir().unwrap();
    let controller = TestController::start(test_config(dir.path(), &["n1"]), MockExecutor::new()).await;

    assert_eq!(
        error_kind(&controller, "shutdown_server", json!({})).await,
        "UnknownCommand"
    );
    assert_eq!(
        error_kind(&controller, "__init__", json!({"anything": 1})).await,
        "UnknownCommand"
    );

    let config = ok(&controller, "get_config_vars", json!({})).await;
    assert_eq!(config["max_concurrent_jobs"], 1);
    assert_eq!(config["autostart"], false);

    controller.shutdown().await;
}

#[tokio::test]
async fn test_operations_on_unknown_job_report_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let controller = TestController::start(test_config(dir.path(), &["n1"]), MockExecutor::new()).await;

    for command in ["start_render", "get_status", "clear_job", "get_attrs"] {
        assert_eq!(
            error_kind(&controller, command, json!({"index": "nope"})).await,
            "JobNotFoundError",
            "{}",
            command
        );
    }
    assert_eq!(ok(&controller, "job_exists", json!({"index": "nope"})).await, false);

    controller.shutdown().await;
}

#[tokio::test]
async fn test_argument_errors() {
    let dir = tempfile::tempdir().unwrap();
    let controller = TestController::start(test_config(dir.path(), &["n1"]), MockExecutor::new()).await;

    assert_eq!(
        error_kind(&controller, "start_render", json!({"index": "a", "bogus": true})).await,
        "InvalidArguments"
    );
    assert_eq!(
        error_kind(&controller, "start_render", json!({})).await,
        "InvalidArguments"
    );
    let path = project_file(dir.path(), "a.blend");
    assert_eq!(
        error_kind(
            &controller,
            "enqueue",
            json!({"path": path, "startframe": 9, "endframe": 1, "nodes": ["n1"]}),
        )
        .await,
        "ValidationError"
    );
    assert_eq!(
        error_kind(
            &controller,
            "killall",
            json!({"nodes": ["n1"], "process_name": "blender; reboot"}),
        )
        .await,
        "ValidationError"
    );

    controller.shutdown().await;
}

#[tokio::test]
async fn test_positional_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let controller = TestController::start(test_config(dir.path(), &["n1"]), MockExecutor::new()).await;
    let path = project_file(dir.path(), "a.blend");

    let request = json!({
        "command": "enqueue",
        "args": ["job2", path, 1, 3],
        "kwargs": {"nodes": ["n1"], "priority": "High"},
    });
    let reply = send_raw(controller.addr, &serde_json::to_vec(&request).unwrap())
        .await
        .unwrap();
    assert_eq!(reply.into_result().unwrap()["status"], "Waiting");

    let request = json!({"command": "get_attrs", "args": ["job2"]});
    let attrs = send_raw(controller.addr, &serde_json::to_vec(&request).unwrap())
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(attrs["priority"], "High");
    assert_eq!(attrs["end_frame"], 3);

    controller.shutdown().await;
}

#[tokio::test]
async fn test_malformed_request_gets_protocol_error() {
    let dir = tempfile::tempdir().unwrap();
    let controller = TestController::start(test_config(dir.path(), &["n1"]), MockExecutor::new()).await;

    let reply = send_raw(controller.addr, b"this is not json").await.unwrap();
    assert_eq!(reply.error_kind(), Some("ProtocolError"));

    // A header that is not a decimal length.
    let mut stream = TcpStream::connect(controller.addr).await.unwrap();
    stream.write_all(b"abcdefgh").await.unwrap();
    let raw = read_message(&mut stream).await.unwrap();
    let reply: Reply = serde_json::from_slice(&raw).unwrap();
    assert_eq!(reply.error_kind(), Some("ProtocolError"));

    assert_eq!(ok(&controller, "toggle_verbose", json!({})).await, true);
    controller.shutdown().await;
}

#[tokio::test]
async fn test_job_control_commands() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockExecutor::with_default(Behavior::Hang);
    let controller = TestController::start(test_config(dir.path(), &["n1", "n2"]), mock.clone()).await;
    let path = project_file(dir.path(), "a.blend");

    ok(
        &controller,
        "enqueue",
        json!({"index": "a", "path": path, "startframe": 1, "endframe": 4, "nodes": ["n1"]}),
    )
    .await;
    let reply = ok(&controller, "start_render", json!({"index": "a"})).await;
    assert_eq!(reply["status"], "Rendering");

    let reply = ok(&controller, "toggle_comp", json!({"index": "a", "node": "n2"})).await;
    assert_eq!(reply["in_pool"], true);

    assert_eventually(
        || async {
            let attrs = ok(&controller, "get_attrs", json!({"index": "a"})).await;
            attrs["node_state"]["n1"]["pid"].is_u64()
        },
        WAIT,
        "n1 should report a pid",
    )
    .await;
    let reply = ok(&controller, "kill_single_thread", json!({"index": "a", "node": "n1"})).await;
    assert!(reply["pid"].is_u64());

    let reply = ok(&controller, "kill_render", json!({"index": "a", "kill_now": true})).await;
    assert_eq!(reply["status"], "Stopped");

    let reply = ok(&controller, "resume_render", json!({"index": "a"})).await;
    assert_eq!(reply["status"], "Waiting");

    let reply = ok(&controller, "set_job_priority", json!({"index": "a", "priority": "High"})).await;
    assert_eq!(reply["priority"], "High");

    let reply = ok(&controller, "clear_job", json!({"index": "a"})).await;
    assert_eq!(reply["deleted"], true);

    let reply = ok(&controller, "killall", json!({"process_name": "blender"})).await;
    assert_eq!(reply["nodes"], json!(["n1", "n2"]));
    assert_eventually(
        || async { mock.killalls().len() == 2 },
        WAIT,
        "killall should reach every node",
    )
    .await;

    assert_eq!(ok(&controller, "toggle_autostart", json!({})).await, true);
    assert_eq!(
        ok(&controller, "check_path_exists", json!({"path": path})).await,
        true
    );

    controller.shutdown().await;
}
