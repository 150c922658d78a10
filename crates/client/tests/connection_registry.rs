mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{assert_elapsed, settle, FakeTransport, Handshake, Recorder, ServerEnd};
use mission_control_client::ws::{passthrough_parser, Frame};
use mission_control_client::{
    ConnectOptions, ConnectionRegistry, ConnectionState, Handlers, StreamConfig, TokioClock,
};
use mission_control_shared::{
    ConnectionError, ProtocolError, StreamError, StreamIdentity, StreamMessage,
};
use serde_json::json;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

fn registry(transport: Arc<FakeTransport>) -> ConnectionRegistry {
    ConnectionRegistry::new(StreamConfig::default(), transport, Arc::new(TokioClock))
}

fn identity() -> StreamIdentity {
    StreamIdentity::new("op-1").with_enterprise("ent-1")
}

struct Observed {
    messages: Recorder<StreamMessage>,
    states: Recorder<ConnectionState>,
    errors: Recorder<StreamError>,
}

fn observed() -> (Observed, Handlers) {
    let messages = Recorder::default();
    let states = Recorder::default();
    let errors = Recorder::default();
    let handlers = {
        let (m, s, e) = (messages.clone(), states.clone(), errors.clone());
        Handlers::new()
            .on_message(move |msg| m.push(msg.clone()))
            .on_status(move |state| s.push(state.clone()))
            .on_error(move |err| e.push(err.clone()))
    };
    (
        Observed {
            messages,
            states,
            errors,
        },
        handlers,
    )
}

async fn next_server(servers: &mut UnboundedReceiver<ServerEnd>) -> ServerEnd {
    let server = servers.recv().await.expect("transport dropped");
    settle().await;
    server
}

#[tokio::test(start_paused = true)]
async fn trajectory_stream_recovers_from_abnormal_close() {
    let (transport, mut servers) = FakeTransport::new();
    let registry = registry(transport.clone());
    let (seen, handlers) = observed();

    let _sub = registry
        .connect(
            "/ws/trajectory",
            &identity(),
            ConnectOptions::new(handlers).with_param("spacecraftId", "7"),
        )
        .unwrap();

    let mut server = next_server(&mut servers).await;
    assert!(registry.is_connected("/ws/trajectory"));
    assert_eq!(server.protocol.as_deref(), Some("json"));
    assert_eq!(
        transport.attempts()[0].url,
        "ws://localhost:8080/ws/trajectory?userId=op-1&enterpriseId=ent-1&spacecraftId=7"
    );

    // Keepalive after 20 s.
    let opened = Instant::now();
    let ping = server.next_json().await.unwrap();
    assert_eq!(ping["type"], "ping");
    assert!(ping["timestamp"].is_i64());
    assert_elapsed(opened, Duration::from_secs(20));

    server.send_json(json!({"type": "telemetry", "spacecraftId": 7, "altitude": 412.5}));
    settle().await;
    let messages = seen.messages.items();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].spacecraft_id(), Some(7));

    // Network drop: close code 1006 on the client side.
    let dropped = Instant::now();
    drop(server);
    let _server = next_server(&mut servers).await;
    assert_elapsed(dropped, Duration::from_secs(2));

    let status = registry.status("/ws/trajectory").unwrap();
    assert!(status.connected);
    assert_eq!(status.attempt, 0);
    assert_eq!(status.message_count, 1);
    // The retry rotated to the next subprotocol (none).
    assert_eq!(status.protocol, None);

    assert_eq!(
        seen.states.items(),
        vec![
            ConnectionState::Connected,
            ConnectionState::Reconnecting { attempt: 1 },
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );
    assert!(matches!(
        seen.errors.items().as_slice(),
        [StreamError::Connection(ConnectionError::Closed { code: 1006, .. })]
    ));
}

#[tokio::test(start_paused = true)]
async fn backoff_grows_caps_and_resets_after_open() {
    let (transport, mut servers) = FakeTransport::new();
    transport.script(&[Handshake::Refuse; 9]);
    let registry = registry(transport.clone());
    let _sub = registry
        .connect("/ws/telemetry", &identity(), ConnectOptions::default())
        .unwrap();

    let server = next_server(&mut servers).await;
    let attempts = transport.attempts();
    assert_eq!(attempts.len(), 10);
    let gaps: Vec<u128> = attempts
        .windows(2)
        .map(|w| (w[1].at - w[0].at).as_millis())
        .collect();
    assert_eq!(
        gaps,
        vec![2000, 3000, 4500, 6750, 10125, 15187, 22781, 30000, 30000]
    );

    // Subprotocols alternate per attempt.
    let protocols: Vec<Option<&str>> = attempts.iter().map(|a| a.protocol.as_deref()).collect();
    assert_eq!(&protocols[..4], &[Some("json"), None, Some("json"), None]);

    // After a healthy session the first retry waits the base delay again.
    let dropped = Instant::now();
    drop(server);
    let _server = next_server(&mut servers).await;
    assert_elapsed(dropped, Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn repeated_connect_shares_one_socket() {
    let (transport, mut servers) = FakeTransport::new();
    let registry = registry(transport.clone());
    let (first, first_handlers) = observed();
    let (late, late_handlers) = observed();

    let _a = registry
        .connect("/ws/telemetry", &identity(), ConnectOptions::new(first_handlers))
        .unwrap();
    // Still connecting: joins the same connection.
    let _b = registry
        .connect("ws/telemetry", &identity(), ConnectOptions::default())
        .unwrap();

    let server = next_server(&mut servers).await;
    let _c = registry
        .connect("/ws/telemetry", &identity(), ConnectOptions::new(late_handlers))
        .unwrap();

    assert_eq!(transport.attempts().len(), 1);
    assert_eq!(transport.open_sockets(), 1);
    assert_eq!(registry.subscriber_count("/ws/telemetry"), 3);
    assert_eq!(registry.endpoints(), vec!["/ws/telemetry".to_string()]);
    // A late subscriber hears about the open connection right away.
    assert_eq!(late.states.items(), vec![ConnectionState::Connected]);

    server.send_json(json!({"telemetry": {}, "operatorId": "op-1"}));
    settle().await;
    assert_eq!(first.messages.len(), 1);
    assert_eq!(late.messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_terminal() {
    let (transport, mut servers) = FakeTransport::new();
    let registry = registry(transport.clone());
    let (seen, handlers) = observed();
    let _sub = registry
        .connect("/ws/commands", &identity(), ConnectOptions::new(handlers))
        .unwrap();
    let mut server = next_server(&mut servers).await;

    assert!(registry.disconnect("/ws/commands").await);
    assert_eq!(
        server.next_frame().await,
        Some(Frame::Close {
            code: 1000,
            reason: "Closed by client".to_string()
        })
    );

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.attempts().len(), 1);
    assert_eq!(transport.open_sockets(), 0);
    assert!(registry.status("/ws/commands").is_none());
    assert_eq!(
        seen.states.items().last(),
        Some(&ConnectionState::Disconnected)
    );
    assert!(!registry.disconnect("/ws/commands").await);
}

#[tokio::test(start_paused = true)]
async fn send_requires_open_connection() {
    let (transport, mut servers) = FakeTransport::new();
    transport.script(&[Handshake::Hang]);
    let registry = registry(transport.clone());
    let _sub = registry
        .connect("/ws/commands", &identity(), ConnectOptions::default())
        .unwrap();
    settle().await;

    let err = registry
        .send("/ws/commands", &json!({"command": "deploy"}))
        .await
        .unwrap_err();
    assert_eq!(err, ConnectionError::NotConnected("/ws/commands".to_string()));

    // The handshake times out after 10 s; the retry succeeds 2 s later.
    let started = Instant::now();
    let mut server = next_server(&mut servers).await;
    assert_elapsed(started, Duration::from_secs(12));

    registry
        .send("/ws/commands", &json!({"command": "deploy"}))
        .await
        .unwrap();
    assert_eq!(server.next_json().await, Some(json!({"command": "deploy"})));
}

#[tokio::test(start_paused = true)]
async fn silent_server_trips_watchdog() {
    let (transport, mut servers) = FakeTransport::new();
    let registry = registry(transport.clone());
    let (seen, handlers) = observed();
    let _sub = registry
        .connect("/ws/telemetry", &identity(), ConnectOptions::new(handlers))
        .unwrap();
    let mut silent = next_server(&mut servers).await;
    let opened = Instant::now();

    let _next = next_server(&mut servers).await;
    // 40 s of silence, then the 2 s backoff.
    assert_elapsed(opened, Duration::from_secs(42));
    assert!(seen
        .errors
        .items()
        .contains(&StreamError::Connection(ConnectionError::Inactive { idle_ms: 40_000 })));

    // The dead link was closed, without the reason that stops reconnection.
    let close = loop {
        match silent.next_frame().await {
            Some(Frame::Close { code, reason }) => break Some((code, reason)),
            Some(_) => continue,
            None => break None,
        }
    };
    assert_eq!(close, Some((1000, "Reconnecting".to_string())));
}

#[tokio::test(start_paused = true)]
async fn pongs_keep_connection_alive_and_server_pings_are_answered() {
    let (transport, mut servers) = FakeTransport::new();
    let registry = registry(transport.clone());
    let (seen, handlers) = observed();
    let _sub = registry
        .connect("/ws/telemetry", &identity(), ConnectOptions::new(handlers))
        .unwrap();
    let mut server = next_server(&mut servers).await;

    server.send_json(json!({"type": "ping", "timestamp": 5}));
    assert_eq!(
        server.next_json().await,
        Some(json!({"type": "pong", "timestamp": 5}))
    );

    for _ in 0..5 {
        let ping = server.next_json().await.unwrap();
        assert_eq!(ping["type"], "ping");
        server.send_json(json!({"type": "pong", "timestamp": ping["timestamp"]}));
    }
    settle().await;

    assert_eq!(transport.attempts().len(), 1);
    assert!(registry.is_connected("/ws/telemetry"));
    assert!(seen.messages.items().is_empty());
    assert!(seen.errors.items().is_empty());
    assert_eq!(registry.status("/ws/telemetry").unwrap().message_count, 6);
}

#[tokio::test(start_paused = true)]
async fn bad_frames_go_to_error_handlers_only() {
    let (transport, mut servers) = FakeTransport::new();
    let registry = registry(transport.clone());
    let (seen, handlers) = observed();
    let _sub = registry
        .connect("/ws/telemetry", &identity(), ConnectOptions::new(handlers))
        .unwrap();
    let server = next_server(&mut servers).await;

    server.send_text("not json");
    server.send_json(json!({"type": "mystery"}));
    server.send_json(json!({"error": "operator not found"}));
    server.send_json(json!({"data": {"type": "command_status", "commandId": "c-1", "spacecraftId": 3, "status": true}}));
    settle().await;

    let errors = seen.errors.items();
    assert_eq!(errors.len(), 3);
    assert!(matches!(errors[0], StreamError::Protocol(ProtocolError::Malformed(_))));
    assert_eq!(
        errors[1],
        StreamError::Protocol(ProtocolError::UnknownType("mystery".to_string()))
    );
    assert_eq!(errors[2], StreamError::Server("operator not found".to_string()));

    let messages = seen.messages.items();
    assert_eq!(messages.len(), 1);
    assert!(matches!(&messages[0], StreamMessage::CommandStatus(u) if u.command_id == "c-1"));
    assert!(registry.is_connected("/ws/telemetry"));
}

#[tokio::test(start_paused = true)]
async fn custom_parser_and_cancelled_subscription() {
    let (transport, mut servers) = FakeTransport::new();
    let registry = registry(transport.clone());
    let (kept, kept_handlers) = observed();
    let (gone, gone_handlers) = observed();

    let _kept = registry
        .connect(
            "/ws/raw",
            &identity(),
            ConnectOptions::new(kept_handlers).with_parser(passthrough_parser()),
        )
        .unwrap();
    let cancelled = registry
        .connect("/ws/raw", &identity(), ConnectOptions::new(gone_handlers))
        .unwrap();
    let server = next_server(&mut servers).await;

    assert!(cancelled.cancel());
    server.send_json(json!({"anything": 1}));
    settle().await;

    assert_eq!(
        kept.messages.items(),
        vec![StreamMessage::Raw(json!({"anything": 1}))]
    );
    assert!(gone.messages.items().is_empty());
    assert_eq!(registry.subscriber_count("/ws/raw"), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_skips_backoff() {
    let (transport, mut servers) = FakeTransport::new();
    let registry = registry(transport.clone());
    let _sub = registry
        .connect("/ws/telemetry", &identity(), ConnectOptions::default())
        .unwrap();
    let mut first = next_server(&mut servers).await;

    let requested = Instant::now();
    registry.reconnect("/ws/telemetry").unwrap();
    assert!(matches!(first.next_frame().await, Some(Frame::Close { code: 1000, .. })));
    let _second = next_server(&mut servers).await;
    assert_elapsed(requested, Duration::ZERO);
    assert_eq!(transport.attempts().len(), 2);
    assert_eq!(transport.open_sockets(), 1);
}

#[tokio::test(start_paused = true)]
async fn intentional_server_close_stops_until_next_connect() {
    let (transport, mut servers) = FakeTransport::new();
    let registry = registry(transport.clone());
    let (seen, handlers) = observed();
    let _sub = registry
        .connect("/ws/telemetry", &identity(), ConnectOptions::new(handlers))
        .unwrap();
    let server = next_server(&mut servers).await;

    server.close(1000, "Closed by client");
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.attempts().len(), 1);
    assert_eq!(
        registry.status("/ws/telemetry").map(|s| s.state),
        Some(ConnectionState::Disconnected)
    );

    // A stopped connection is replaced; its subscribers carry over.
    let _again = registry
        .connect("/ws/telemetry", &identity(), ConnectOptions::default())
        .unwrap();
    let server = next_server(&mut servers).await;
    assert_eq!(registry.subscriber_count("/ws/telemetry"), 2);
    server.send_json(json!({"telemetry": {}}));
    settle().await;
    assert_eq!(seen.messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn probe_reports_any_successful_protocol() {
    let (transport, mut servers) = FakeTransport::new();
    let registry = registry(transport.clone());

    transport.script(&[Handshake::Refuse, Handshake::Accept]);
    assert!(registry.probe("/ws/telemetry", &identity()).await.unwrap());
    let mut server = servers.recv().await.unwrap();
    assert!(matches!(server.next_frame().await, Some(Frame::Close { code: 1000, .. })));

    transport.script(&[Handshake::Hang, Handshake::Refuse]);
    let started = Instant::now();
    assert!(!registry.probe("/ws/telemetry", &identity()).await.unwrap());
    assert_elapsed(started, Duration::from_secs(5));
    assert!(registry.endpoints().is_empty());
}
