//! Integration tests for the per-connection session state machine.
//!
//! Each test drives a `SessionBridge` directly against a `FakeSandbox`; the
//! fake debuggee side is a real loopback TCP socket.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use dap_bridge::bridge::{BridgeState, SessionBridge};
use dap_bridge::dap::DapCodec;
use dap_bridge::sandbox::OutputChunk;
use dap_bridge::AppError;

use super::test_helpers::{
    init_payload, recv_within, test_config, test_context, Debuggee, FakeSandbox,
};

struct Harness {
    _workspace: tempfile::TempDir,
    fake: std::sync::Arc<FakeSandbox>,
    accepted: mpsc::UnboundedReceiver<tokio::net::TcpStream>,
    session: SessionBridge,
    outbound: mpsc::Receiver<String>,
    close: CancellationToken,
    init: String,
    ctx: std::sync::Arc<dap_bridge::bridge::BridgeContext>,
}

fn harness(mode: Debuggee) -> Harness {
    let workspace = tempfile::tempdir().expect("tempdir");
    let config = test_config(workspace.path());
    let init = init_payload(&config);
    let (fake, accepted) = FakeSandbox::new(mode);
    let ctx = test_context(config, std::sync::Arc::clone(&fake));
    let (tx, outbound) = mpsc::channel(64);
    let close = CancellationToken::new();
    let session = SessionBridge::new("test-session", std::sync::Arc::clone(&ctx), tx, close.clone());
    Harness {
        _workspace: workspace,
        fake,
        accepted,
        session,
        outbound,
        close,
        init,
        ctx,
    }
}

#[tokio::test]
async fn init_writes_files_and_launches_on_allocated_port() {
    let mut h = harness(Debuggee::Listening);

    h.session
        .handle_message(h.init.clone())
        .await
        .expect("initialization succeeds");

    assert_eq!(h.session.state(), BridgeState::Bridged);

    let root = &h.ctx.config.workspace_root;
    assert_eq!(
        std::fs::read_to_string(root.join("a.js")).expect("file written"),
        "console.log(1)"
    );

    let port = h.session.port().expect("port allocated");
    assert!(h.ctx.ports.is_reserved(port));

    let requests = h.fake.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].port, port);
    assert_eq!(requests[0].main, root.join("a.js").to_string_lossy());

    let command = &h.fake.commands()[0];
    assert!(
        command.iter().any(|arg| arg.contains(&port.to_string())),
        "debug command {command:?} must reference port {port}"
    );
}

#[tokio::test]
async fn later_messages_are_relayed_verbatim() {
    let mut h = harness(Debuggee::Listening);
    h.session.handle_message(h.init.clone()).await.expect("init");
    let debuggee = tokio::time::timeout(Duration::from_secs(2), h.accepted.recv())
        .await
        .expect("debuggee connection")
        .expect("accepted stream");
    let mut debuggee_rx = FramedRead::new(debuggee, DapCodec::new());

    let request = r#"{"seq":1,"type":"request","command":"initialize"}"#;
    h.session
        .handle_message(request.to_owned())
        .await
        .expect("relay");

    let received = tokio::time::timeout(Duration::from_secs(2), debuggee_rx.next())
        .await
        .expect("timed out")
        .expect("stream open")
        .expect("decoded");
    assert_eq!(received, request);
}

#[tokio::test]
async fn debuggee_messages_reach_the_client() {
    let mut h = harness(Debuggee::Listening);
    h.session.handle_message(h.init.clone()).await.expect("init");
    let debuggee = h.accepted.recv().await.expect("accepted stream");
    let mut debuggee_tx = FramedWrite::new(debuggee, DapCodec::new());

    let response = r#"{"seq":1,"type":"response","request_seq":1,"success":true}"#;
    debuggee_tx.send(response).await.expect("debuggee write");

    assert_eq!(recv_within(&mut h.outbound).await, response);
}

#[tokio::test]
async fn stdout_becomes_exactly_one_output_event() {
    let mut h = harness(Debuggee::Listening);
    h.session.handle_message(h.init.clone()).await.expect("init");

    h.fake.emit(OutputChunk::stdout("hello\n"));

    let frame = recv_within(&mut h.outbound).await;
    let event: Value = serde_json::from_str(&frame).expect("json event");
    assert_eq!(event["type"], "event");
    assert_eq!(event["event"], "output");
    assert_eq!(event["body"]["category"], "stdout");
    assert_eq!(event["body"]["output"], "hello\n");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.outbound.try_recv().is_err(), "no further frames expected");
}

#[tokio::test]
async fn stderr_is_tagged_stderr() {
    let mut h = harness(Debuggee::Listening);
    h.session.handle_message(h.init.clone()).await.expect("init");

    h.fake.emit(OutputChunk::stderr("warning\n"));

    let event: Value =
        serde_json::from_str(&recv_within(&mut h.outbound).await).expect("json event");
    assert_eq!(event["body"]["category"], "stderr");
    assert_eq!(event["body"]["output"], "warning\n");
}

#[tokio::test]
async fn invalid_init_leaves_session_inert() {
    let mut h = harness(Debuggee::Listening);

    let err = h
        .session
        .handle_message("not json".to_owned())
        .await
        .expect_err("init must fail");
    assert!(matches!(err, AppError::Init(_)));
    assert_eq!(h.session.state(), BridgeState::Initializing);

    h.session
        .handle_message(h.init.clone())
        .await
        .expect("later messages are dropped quietly");

    assert_eq!(h.session.state(), BridgeState::Initializing);
    assert!(h.fake.requests().is_empty());
}

#[tokio::test]
async fn path_escape_fails_initialization() {
    let mut h = harness(Debuggee::Listening);
    let payload = r#"{"main":"/tmp/x.js","files":{"../x.js":"boom"}}"#;

    let err = h
        .session
        .handle_message(payload.to_owned())
        .await
        .expect_err("escape rejected");

    assert!(matches!(err, AppError::PathViolation(_)));
    assert!(h.fake.requests().is_empty());
}

#[tokio::test]
async fn exec_failure_fails_initialization() {
    let mut h = harness(Debuggee::Failing);

    let err = h
        .session
        .handle_message(h.init.clone())
        .await
        .expect_err("exec refused");

    assert!(matches!(err, AppError::Sandbox(_)));
    assert_eq!(h.session.state(), BridgeState::Initializing);
}

#[tokio::test]
async fn unreachable_debuggee_fails_after_retries() {
    let mut h = harness(Debuggee::Silent);

    let err = h
        .session
        .handle_message(h.init.clone())
        .await
        .expect_err("connect gives up");

    assert!(matches!(err, AppError::Transport(_)));
    assert_eq!(h.session.state(), BridgeState::Initializing);
}

#[tokio::test]
async fn debuggee_exit_before_listening_aborts_connect() {
    let mut h = harness(Debuggee::Exiting);

    let result = tokio::time::timeout(
        Duration::from_secs(2),
        h.session.handle_message(h.init.clone()),
    )
    .await
    .expect("connect must not keep retrying");

    assert!(matches!(result, Err(AppError::Transport(_))));
    tokio::time::timeout(Duration::from_secs(2), h.close.cancelled())
        .await
        .expect("exit requests close");
}

#[tokio::test]
async fn output_end_requests_close_and_releases_exec() {
    let mut h = harness(Debuggee::Listening);
    h.session.handle_message(h.init.clone()).await.expect("init");

    h.fake.emit(OutputChunk::stdout("bye\n"));
    h.fake.finish_output();

    tokio::time::timeout(Duration::from_secs(2), h.close.cancelled())
        .await
        .expect("close requested");
    assert_eq!(h.fake.released(), vec!["exec-1".to_owned()]);

    let event: Value =
        serde_json::from_str(&recv_within(&mut h.outbound).await).expect("json event");
    assert_eq!(event["body"]["output"], "bye\n");
}

#[tokio::test]
async fn close_releases_port_and_drops_messages() {
    let mut h = harness(Debuggee::Listening);
    h.session.handle_message(h.init.clone()).await.expect("init");
    let port = h.session.port().expect("port");

    h.session.close();
    h.session.close();

    assert_eq!(h.session.state(), BridgeState::Closed);
    assert!(!h.ctx.ports.is_reserved(port));
    assert!(h.close.is_cancelled());
    h.session
        .handle_message("{}".to_owned())
        .await
        .expect("closed session ignores messages");
}
