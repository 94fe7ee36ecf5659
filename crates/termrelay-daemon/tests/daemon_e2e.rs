//! End-to-end tests against a running daemon: control socket admission plus
//! a real `/bin/sh` driven through the relay listener.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use termrelay_common::error_codes;
use termrelay_daemon::{CloseReason, RelayConfig, RpcRequest, RpcResponse, RunningDaemon};
use termrelay_protocol::{preamble, InboundFrame, MessageCodec, OutboundFrame, WindowSize};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::codec::{Framed, LinesCodec};

const STEP: Duration = Duration::from_secs(10);

struct Harness {
    daemon: RunningDaemon,
    _dir: tempfile::TempDir,
}

async fn start() -> Harness {
    start_with_shells(&["/bin/sh"]).await
}

async fn start_with_shells(shells: &[&str]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = RelayConfig::default()
        .with_listen_addr("127.0.0.1:0".parse().unwrap())
        .with_control_socket(dir.path().join("control.sock"))
        .with_state_file(dir.path().join("sessions.json"))
        .with_recording_dir(dir.path().join("recordings"))
        .with_max_sessions_per_user(5)
        .with_shells(shells.iter().map(|s| s.to_string()).collect());
    let daemon = RunningDaemon::start(config).await.unwrap();
    Harness { daemon, _dir: dir }
}

struct Control {
    lines: Framed<UnixStream, LinesCodec>,
    next_id: u64,
}

impl Control {
    async fn connect(harness: &Harness) -> Self {
        let stream = UnixStream::connect(harness.daemon.control_socket())
            .await
            .unwrap();
        Self {
            lines: Framed::new(stream, LinesCodec::new()),
            next_id: 1,
        }
    }

    async fn raw(&mut self, line: String) -> RpcResponse {
        self.lines.send(line).await.unwrap();
        let reply = tokio::time::timeout(STEP, self.lines.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    async fn call(&mut self, method: &str, params: Value) -> RpcResponse {
        let request = RpcRequest::new(self.next_id, method, Some(params));
        self.next_id += 1;
        let response = self.raw(serde_json::to_string(&request).unwrap()).await;
        assert_eq!(response.id, request.id);
        response
    }

    async fn create(&mut self, owner: &str) -> RpcResponse {
        self.call(
            "create_session",
            json!({ "owner_id": owner, "cols": 80, "rows": 24 }),
        )
        .await
    }
}

fn session_id(response: &RpcResponse) -> String {
    response.result.as_ref().unwrap()["session_id"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn attach(harness: &Harness, id: &str) -> Framed<TcpStream, MessageCodec> {
    let stream = TcpStream::connect(harness.daemon.relay_addr()).await.unwrap();
    let mut relay = Framed::new(stream, MessageCodec::default());
    relay.send(preamble::encode(id)).await.unwrap();
    relay
}

/// Collects output until `needle` appears or the stream ends.
async fn read_until(relay: &mut Framed<TcpStream, MessageCodec>, needle: &str) -> (String, bool) {
    let mut output = Vec::new();
    loop {
        let next = tokio::time::timeout(STEP, relay.next()).await.unwrap();
        match next {
            None | Some(Err(_)) => return (String::from_utf8_lossy(&output).into_owned(), true),
            Some(Ok(message)) => {
                if let OutboundFrame::Output(data) = OutboundFrame::decode(message) {
                    output.extend_from_slice(&data);
                    if String::from_utf8_lossy(&output).contains(needle) {
                        return (String::from_utf8_lossy(&output).into_owned(), false);
                    }
                }
            }
        }
    }
}

async fn wait_closed(harness: &Harness, id: &str) -> termrelay_daemon::Session {
    for _ in 0..200 {
        let session = harness.daemon.manager().get(id).unwrap();
        if !session.is_active() {
            return session;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("session {id} never closed");
}

async fn stop(harness: Harness) {
    harness.daemon.shutdown_token().cancel();
    harness.daemon.wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shell_session_lists_directory_and_exits() {
    let harness = start().await;
    let mut control = Control::connect(&harness).await;

    let created = control.create("U1").await;
    let id = session_id(&created);
    assert_eq!(created.result.as_ref().unwrap()["dimensions"]["cols"], 80);

    let mut relay = attach(&harness, &id).await;
    relay
        .send(InboundFrame::Resize(WindowSize::new(80, 24)).encode())
        .await
        .unwrap();
    relay.send(InboundFrame::Keepalive.encode()).await.unwrap();
    for _ in 0..5 {
        relay
            .send(InboundFrame::Input(Bytes::from_static(b"ls\n")).encode())
            .await
            .unwrap();
    }

    let (output, ended) = read_until(&mut relay, "Cargo.toml").await;
    assert!(!ended, "stream ended early: {output:?}");
    assert!(output.contains("Cargo.toml"));

    relay
        .send(InboundFrame::Input(Bytes::from_static(b"exit\n")).encode())
        .await
        .unwrap();
    let (_, ended) = read_until(&mut relay, "\u{0}never").await;
    assert!(ended, "relay did not close after exit");

    let session = wait_closed(&harness, &id).await;
    assert_eq!(session.close_reason, Some(CloseReason::ProcessExited));

    let fetched = control.call("get_session", json!({ "session_id": id })).await;
    assert_eq!(fetched.result.unwrap()["status"], "closed");

    let metrics = control.call("metrics", json!({})).await.result.unwrap();
    assert_eq!(metrics["sessions"]["active_count"], 0);
    assert_eq!(metrics["sessions"]["closed_total"], 1);
    assert_eq!(metrics["relay"]["connections_total"], 1);

    stop(harness).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_per_user_cap_over_the_control_socket() {
    let harness = start().await;
    let mut control = Control::connect(&harness).await;

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(session_id(&control.create("U1").await));
    }

    let denied = control.create("U1").await.error.unwrap();
    assert_eq!(denied.code, error_codes::PER_USER_LIMIT);
    assert_eq!(denied.category(), Some("busy"));
    assert!(denied.suggestion().unwrap().contains("Close one of your sessions"));

    let other = control.create("U2").await;
    assert!(other.error.is_none());

    let closed = control
        .call("close_session", json!({ "session_id": ids[0] }))
        .await;
    assert!(closed.error.is_none());

    let sixth = control.create("U1").await;
    assert!(sixth.error.is_none());

    let mine = control
        .call("user_sessions", json!({ "owner_id": "U1" }))
        .await
        .result
        .unwrap();
    assert_eq!(mine["sessions"].as_array().unwrap().len(), 5);

    stop(harness).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_control_socket_survives_bad_lines() {
    let harness = start().await;
    let mut control = Control::connect(&harness).await;

    let garbage = control.raw("{not json".to_string()).await;
    assert_eq!(garbage.error.unwrap().code, error_codes::PARSE_ERROR);

    let pong = control.call("ping", json!({})).await;
    assert_eq!(pong.result.unwrap()["pong"], true);

    let zero = control
        .call("set_max_sessions", json!({ "max": 0 }))
        .await
        .error
        .unwrap();
    assert_eq!(zero.code, error_codes::INVALID_SETTING);
    assert_eq!(harness.daemon.manager().max_sessions(), 100);

    stop(harness).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_relay_refuses_unknown_and_doubly_attached_sessions() {
    let harness = start().await;
    let mut control = Control::connect(&harness).await;

    let mut stranger = attach(&harness, "no-such-session").await;
    let (_, ended) = read_until(&mut stranger, "\u{0}never").await;
    assert!(ended);

    let id = session_id(&control.create("U1").await);
    let mut first = attach(&harness, &id).await;
    first
        .send(InboundFrame::Input(Bytes::from_static(b"echo attached-once\n")).encode())
        .await
        .unwrap();
    let (output, _) = read_until(&mut first, "attached-once").await;
    assert!(output.contains("attached-once"));

    let mut second = attach(&harness, &id).await;
    let (_, ended) = read_until(&mut second, "\u{0}never").await;
    assert!(ended);
    assert!(harness.daemon.manager().get(&id).unwrap().is_active());

    stop(harness).await;

    let (_, ended) = read_until(&mut first, "\u{0}never").await;
    assert!(ended);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_sessions_and_removes_socket() {
    let harness = start().await;
    let mut control = Control::connect(&harness).await;
    let id = session_id(&control.create("U1").await);
    let socket = harness.daemon.control_socket().to_path_buf();
    let manager = std::sync::Arc::clone(harness.daemon.manager());
    assert!(socket.exists());

    let Harness { daemon, _dir: dir } = harness;
    daemon.shutdown_token().cancel();
    daemon.wait().await;

    let session = manager.get(&id).unwrap();
    assert_eq!(session.close_reason, Some(CloseReason::Shutdown));
    assert!(!socket.exists());
    assert!(!dir.path().join("control.lock").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_spawn_closes_the_session() {
    let harness = start_with_shells(&["/definitely/not/a/shell"]).await;
    let mut control = Control::connect(&harness).await;

    let id = session_id(&control.create("U1").await);
    let mut relay = attach(&harness, &id).await;
    let (_, ended) = read_until(&mut relay, "\u{0}never").await;
    assert!(ended);

    let closed = wait_closed(&harness, &id).await;
    assert!(matches!(closed.close_reason, Some(CloseReason::SpawnFailed(_))));
    assert_eq!(harness.daemon.manager().metrics().active_count, 0);

    stop(harness).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_path_like_session_ids_are_refused() {
    let harness = start().await;
    let mut control = Control::connect(&harness).await;

    for id in ["../../../../tmp/escape", "/etc/cron.d/evil"] {
        let response = control
            .call(
                "create_session",
                json!({ "owner_id": "U1", "session_id": id, "recording_enabled": true }),
            )
            .await;
        assert_eq!(response.error.unwrap().code, error_codes::INVALID_SESSION_ID);
    }
    assert!(harness.daemon.manager().list_active().is_empty());

    stop(harness).await;
}
