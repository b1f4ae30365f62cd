//! End-to-end: the real router on an ephemeral port, driven by the client
//! engine or a raw WebSocket.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tether_client::{ClientConfig, ClientEvent, SeqStore, StreamClient};
use tether_protocol::{
    AgentEvent, ClientMessage, ResumeStreamData, ServerMessage, SubscriptionLevel, TurnStage,
};
use tether_server::build_app;
use tether_server::owner::OwnerHandle;
use tether_stream_core::{BackoffPolicy, StreamConfig};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

async fn spawn_server(token: Option<&str>) -> (SocketAddr, OwnerHandle) {
    spawn_server_with(token, Duration::ZERO).await
}

async fn spawn_server_with(token: Option<&str>, echo_delay: Duration) -> (SocketAddr, OwnerHandle) {
    let (app, owner) = build_app(StreamConfig::default(), token.map(str::to_string), echo_delay);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, owner)
}

async fn next_matching<F>(events: &mut UnboundedReceiver<ClientEvent>, mut pred: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("engine stopped");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn prompt_streams_events_and_staged_acks() {
    let (addr, _owner) = spawn_server(None).await;
    let tmp = tempfile::tempdir().unwrap();
    let config = ClientConfig::new(format!("http://{addr}"), tmp.path());
    let (client, mut events) = StreamClient::connect(config, SeqStore::in_memory());

    client.subscribe("s1", SubscriptionLevel::Full).await.unwrap();
    let turn_id = client.prompt("s1", "hello there").await.unwrap();

    let mut durable = Vec::new();
    let mut stages = Vec::new();
    let mut streamed = String::new();
    tokio::time::timeout(WAIT, async {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Durable(event) => durable.push((event.seq, event.name)),
                ClientEvent::Ephemeral(batch) => {
                    for event in batch {
                        if let Some(delta) = event.payload["delta"].as_str() {
                            streamed.push_str(delta);
                        }
                    }
                }
                ClientEvent::TurnAck {
                    client_turn_id,
                    stage,
                    duplicate,
                    ..
                } => {
                    assert_eq!(client_turn_id, turn_id);
                    assert!(!duplicate);
                    stages.push(stage);
                    if stage == TurnStage::Completed {
                        break;
                    }
                }
                _ => {}
            }
        }
    })
    .await
    .expect("turn did not complete");

    assert_eq!(
        stages,
        vec![TurnStage::Accepted, TurnStage::Dispatched, TurnStage::Completed]
    );
    assert_eq!(
        durable,
        vec![
            (Some(1), "agent_start".to_string()),
            (Some(2), "message_end".to_string()),
            (Some(3), "agent_end".to_string()),
        ]
    );
    assert_eq!(streamed, "hello there ");
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn reconnecting_client_catches_up_from_last_seen() {
    let (addr, owner) = spawn_server(None).await;
    for name in ["agent_start", "message_end", "agent_end"] {
        owner.publish("s1", AgentEvent::durable(name, json!({}))).await;
    }

    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join("last-seen.json"),
        r#"{"version":1,"sessions":{"s1":1}}"#,
    )
    .unwrap();
    let config = ClientConfig::new(format!("http://{addr}"), tmp.path());
    let store = SeqStore::load(config.seq_store_path());
    let (client, mut events) = StreamClient::connect(config, store);
    client.subscribe("s1", SubscriptionLevel::Full).await.unwrap();

    let first = next_matching(&mut events, |e| matches!(e, ClientEvent::Durable(_))).await;
    let second = next_matching(&mut events, |e| matches!(e, ClientEvent::Durable(_))).await;
    let (ClientEvent::Durable(first), ClientEvent::Durable(second)) = (first, second) else {
        unreachable!()
    };
    assert_eq!(first.seq, Some(2));
    assert_eq!(second.seq, Some(3));
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn server_restart_forces_resync_and_resets_store() {
    let (addr, owner) = spawn_server(None).await;
    owner
        .publish("s1", AgentEvent::durable("agent_start", json!({})))
        .await;
    owner
        .publish(
            "s1",
            AgentEvent::durable("message_end", json!({ "role": "assistant", "text": "hi" })),
        )
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let store_path = tmp.path().join("last-seen.json");
    std::fs::write(&store_path, r#"{"version":1,"sessions":{"s1":42}}"#).unwrap();
    let config = ClientConfig::new(format!("http://{addr}"), tmp.path());
    let (client, mut events) = StreamClient::connect(config, SeqStore::load(&store_path));
    client.subscribe("s1", SubscriptionLevel::Full).await.unwrap();

    let resynced = next_matching(&mut events, |e| matches!(e, ClientEvent::Resynced(_))).await;
    let ClientEvent::Resynced(snapshot) = resynced else {
        unreachable!()
    };
    assert_eq!(snapshot.session_id, "s1");
    assert_eq!(snapshot.current_seq, 2);
    assert_eq!(snapshot.state["messages"][0]["text"], json!("hi"));

    client.shutdown().await.unwrap();
    assert_eq!(SeqStore::load(&store_path).get("s1"), Some(2));
}

#[tokio::test]
async fn completed_ack_reaches_a_client_displaced_mid_turn() {
    let (addr, _owner) = spawn_server_with(None, Duration::from_millis(200)).await;
    let tmp = tempfile::tempdir().unwrap();
    // Slow enough that the turn finishes while the client is away.
    let stream = StreamConfig {
        transport_backoff: BackoffPolicy::transport().with_jitter(0.0),
        ..StreamConfig::default()
    };
    let config = ClientConfig::new(format!("http://{addr}"), tmp.path()).with_stream(stream);
    let (client, mut events) = StreamClient::connect(config, SeqStore::in_memory());
    client.subscribe("s1", SubscriptionLevel::Full).await.unwrap();
    let turn_id = client.prompt("s1", "hello there").await.unwrap();
    next_matching(&mut events, |e| {
        matches!(e, ClientEvent::TurnAck { stage: TurnStage::Accepted, .. })
    })
    .await;

    let _intruder = raw_socket(addr).await;

    let mut completed = None;
    let mut saw_agent_end = false;
    while completed.is_none() || !saw_agent_end {
        match next_matching(&mut events, |e| {
            matches!(e, ClientEvent::TurnAck { .. } | ClientEvent::Durable(_))
        })
        .await
        {
            ClientEvent::TurnAck {
                client_turn_id,
                stage: TurnStage::Completed,
                duplicate,
                ..
            } => {
                assert_eq!(client_turn_id, turn_id);
                completed = Some(duplicate);
            }
            ClientEvent::Durable(event) if event.name == "agent_end" => saw_agent_end = true,
            _ => {}
        }
    }
    // Answered from the dedupe cache, not by running the turn again.
    assert_eq!(completed, Some(true));
    client.shutdown().await.unwrap();
}

async fn raw_socket(
    addr: SocketAddr,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    ws
}

async fn send(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    message: ClientMessage,
) {
    let json = serde_json::to_string(&message).unwrap();
    ws.send(Message::Text(json.into())).await.unwrap();
}

async fn recv(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) -> ServerMessage {
    tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await.expect("socket closed").unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

/// Skip frames until one matches; ephemeral deltas and events interleave with acks.
async fn recv_matching<F>(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    mut pred: F,
) -> ServerMessage
where
    F: FnMut(&ServerMessage) -> bool,
{
    loop {
        let message = recv(ws).await;
        if pred(&message) {
            return message;
        }
    }
}

#[tokio::test]
async fn repeated_turn_is_acked_as_duplicate_and_reused_id_conflicts() {
    let (addr, owner) = spawn_server(None).await;
    let mut ws = raw_socket(addr).await;

    send(
        &mut ws,
        ClientMessage::Subscribe {
            session_id: "s1".into(),
            level: SubscriptionLevel::Full,
            since_seq: None,
            request_id: "sub".into(),
        },
    )
    .await;
    recv_matching(&mut ws, |m| matches!(m, ServerMessage::RpcResult(_))).await;

    let prompt = |request_id: &str, message: &str| ClientMessage::Prompt {
        session_id: "s1".into(),
        client_turn_id: "t1".into(),
        request_id: request_id.into(),
        message: message.into(),
    };

    send(&mut ws, prompt("r1", "hi")).await;
    let completed = recv_matching(&mut ws, |m| {
        matches!(m, ServerMessage::TurnAck { stage: TurnStage::Completed, .. })
    })
    .await;
    assert!(matches!(completed, ServerMessage::TurnAck { duplicate: false, .. }));

    send(&mut ws, prompt("r2", "hi")).await;
    let duplicate = recv_matching(&mut ws, |m| matches!(m, ServerMessage::TurnAck { .. })).await;
    assert_eq!(
        duplicate,
        ServerMessage::TurnAck {
            session_id: "s1".into(),
            client_turn_id: "t1".into(),
            request_id: Some("r2".into()),
            stage: TurnStage::Completed,
            duplicate: true,
        }
    );

    send(&mut ws, prompt("r3", "something else")).await;
    let conflict = recv_matching(&mut ws, |m| matches!(m, ServerMessage::Error { .. })).await;
    let ServerMessage::Error {
        code, request_id, ..
    } = conflict
    else {
        unreachable!()
    };
    assert_eq!(code, "turn_conflict");
    assert_eq!(request_id.as_deref(), Some("r3"));

    // Exactly one agent run: seq stays at three durable events.
    let snapshot = owner.snapshot("s1").await.unwrap();
    assert_eq!(snapshot.current_seq, 3);
}

#[tokio::test]
async fn resume_stream_replays_notifications_only() {
    let (addr, owner) = spawn_server(None).await;
    for name in ["agent_start", "message_end", "agent_end"] {
        owner.publish("s1", AgentEvent::durable(name, json!({}))).await;
    }

    let mut ws = raw_socket(addr).await;
    send(
        &mut ws,
        ClientMessage::Subscribe {
            session_id: "s1".into(),
            level: SubscriptionLevel::Notifications,
            since_seq: None,
            request_id: "sub".into(),
        },
    )
    .await;
    recv(&mut ws).await;

    send(
        &mut ws,
        ClientMessage::ResumeStream {
            since_stream_seq: 0,
            request_id: "resume".into(),
        },
    )
    .await;
    let ServerMessage::RpcResult(result) = recv(&mut ws).await else {
        panic!("expected rpc_result first");
    };
    assert_eq!(result.command, "resume_stream");
    let data: ResumeStreamData = result.data_as().unwrap();
    assert_eq!(data.current_stream_seq, 3);
    assert!(data.catch_up_complete);

    let mut names = Vec::new();
    for _ in 0..2 {
        let ServerMessage::Event(event) = recv(&mut ws).await else {
            panic!("expected replayed event");
        };
        names.push(event.name);
    }
    assert_eq!(names, vec!["agent_start", "agent_end"]);
}

#[tokio::test]
async fn auth_token_guards_api_but_not_health() {
    let (addr, _owner) = spawn_server(Some("secret")).await;
    let http = reqwest::Client::new();

    let health = http.get(format!("http://{addr}/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);

    let denied = http.get(format!("http://{addr}/api/status")).send().await.unwrap();
    assert_eq!(denied.status(), 401);

    let allowed = http
        .get(format!("http://{addr}/api/status"))
        .bearer_auth("secret")
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), 200);

    let by_query = http
        .get(format!("http://{addr}/api/sessions/missing/state?token=secret"))
        .send()
        .await
        .unwrap();
    assert_eq!(by_query.status(), 404);
}
