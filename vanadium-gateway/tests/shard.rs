//! End-to-end shard tests against an in-process gateway.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use vanadium_gateway::{IdentifyQueue, Shard, ShardConfig, ShardEvent, ShardState};
use vanadium_model::{Intents, Snowflake};

type ServerWs = WebSocketStream<TcpStream>;

/// Identify permit that admits immediately.
struct InstantQueue;

impl IdentifyQueue for InstantQueue {
    fn request(&self, _shard_id: u32) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("ws://{}", listener.local_addr().unwrap());
    (listener, addr)
}

async fn accept(listener: &TcpListener) -> ServerWs {
    let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("no connection attempt")
        .unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn send_json(ws: &mut ServerWs, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn next_json(ws: &mut ServerWs) -> Value {
    timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await.expect("connection ended").unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Close(frame) => panic!("unexpected close: {frame:?}"),
                _ => continue,
            }
        }
    })
    .await
    .expect("no frame arrived")
}

/// Read frames until the peer closes, returning the close code.
async fn next_close(ws: &mut ServerWs) -> u16 {
    timeout(Duration::from_secs(10), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => {
                    return frame.map(|f| u16::from(f.code)).unwrap_or(1005)
                }
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => panic!("connection ended without close frame"),
            }
        }
    })
    .await
    .expect("no close arrived")
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn config(addr: &str, intents: Intents) -> ShardConfig {
    ShardConfig::new("T", intents)
        .with_gateway_url(addr)
        .with_identify_queue(Arc::new(InstantQueue))
}

/// Drive the identify handshake to Connected and hand back the server side.
async fn establish(
    listener: &TcpListener,
    shard: &Shard,
    heartbeat_interval: u64,
    resume_gateway_url: &str,
) -> ServerWs {
    let identify_task = tokio::spawn({
        let shard = shard.clone();
        async move { shard.identify().await }
    });

    let mut ws = accept(listener).await;
    send_json(
        &mut ws,
        json!({"op": 10, "d": {"heartbeat_interval": heartbeat_interval}}),
    )
    .await;

    let identify = next_json(&mut ws).await;
    assert_eq!(identify["op"], 2);

    send_json(
        &mut ws,
        json!({
            "op": 0,
            "t": "READY",
            "s": 1,
            "d": {
                "v": 10,
                "session_id": "S",
                "resume_gateway_url": resume_gateway_url,
            },
        }),
    )
    .await;

    timeout(Duration::from_secs(5), identify_task)
        .await
        .expect("identify did not finish")
        .unwrap()
        .unwrap();
    assert_eq!(shard.state(), ShardState::Connected);
    ws
}

#[tokio::test]
async fn cold_identify_reaches_connected() {
    let (listener, addr) = bind().await;
    let (shard, events) = Shard::new(0, config(&addr, Intents::GUILDS | Intents::GUILD_MESSAGES));

    let identify_task = tokio::spawn({
        let shard = shard.clone();
        async move { shard.identify().await }
    });

    let mut ws = accept(&listener).await;
    send_json(&mut ws, json!({"op": 10, "d": {"heartbeat_interval": 41250}})).await;

    let identify = next_json(&mut ws).await;
    assert_eq!(identify["op"], 2);
    assert_eq!(identify["d"]["token"], "Bot T");
    assert_eq!(identify["d"]["intents"], 513);
    assert_eq!(identify["d"]["shard"], json!([0, 1]));

    send_json(
        &mut ws,
        json!({
            "op": 0,
            "t": "READY",
            "s": 1,
            "d": {"v": 10, "session_id": "S", "resume_gateway_url": "wss://r"},
        }),
    )
    .await;

    timeout(Duration::from_secs(5), identify_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert_eq!(shard.state(), ShardState::Connected);
    assert_eq!(shard.session_id().as_deref(), Some("S"));
    assert_eq!(shard.sequence(), Some(1));

    let seen: Vec<ShardEvent> = events.try_iter().collect();
    assert!(seen.iter().any(|e| matches!(e, ShardEvent::Identifying)));
    assert!(seen.iter().any(|e| matches!(e, ShardEvent::Connected)));
    assert!(seen
        .iter()
        .any(|e| matches!(e, ShardEvent::Hello { heartbeat_interval: 41250 })));
    assert!(seen.iter().any(|e| matches!(e, ShardEvent::Identified)));

    shard.shutdown().await;
}

#[tokio::test]
async fn transient_close_resumes_with_last_sequence() {
    let (listener, addr) = bind().await;
    let (shard, _events) = Shard::new(0, config(&addr, Intents::GUILDS));
    let mut ws = establish(&listener, &shard, 45_000, &addr).await;

    send_json(&mut ws, json!({"op": 0, "t": "GUILD_CREATE", "s": 42, "d": {}})).await;
    wait_for(|| shard.sequence() == Some(42)).await;

    ws.send(Message::Close(Some(CloseFrame {
        code: CloseCode::from(4000),
        reason: "unknown error".into(),
    })))
    .await
    .unwrap();

    // The shard reconnects to the resume endpoint and resumes in place.
    let mut ws2 = accept(&listener).await;
    let resume = next_json(&mut ws2).await;
    assert_eq!(resume["op"], 6);
    assert_eq!(resume["d"]["token"], "Bot T");
    assert_eq!(resume["d"]["session_id"], "S");
    assert_eq!(resume["d"]["seq"], 42);

    send_json(&mut ws2, json!({"op": 10, "d": {"heartbeat_interval": 45000}})).await;
    send_json(&mut ws2, json!({"op": 0, "t": "RESUMED", "s": 43, "d": null})).await;

    wait_for(|| shard.state() == ShardState::Connected).await;
    assert_eq!(shard.sequence(), Some(43));

    shard.shutdown().await;
}

#[tokio::test]
async fn unacknowledged_heartbeat_zombies_and_reidentifies() {
    let (listener, addr) = bind().await;
    let (shard, _events) = Shard::new(0, config(&addr, Intents::GUILDS));
    // Short interval (but long enough for a non-zero command allowance);
    // the server never acks anything after Ready.
    let mut ws = establish(&listener, &shard, 1_100, &addr).await;

    let code = next_close(&mut ws).await;
    assert_eq!(code, 3010);

    // A fresh identify follows on a new connection.
    let mut ws2 = accept(&listener).await;
    let identify = next_json(&mut ws2).await;
    assert_eq!(identify["op"], 2);

    shard.shutdown().await;
}

#[tokio::test]
async fn invalid_session_triggers_fresh_identify() {
    let (listener, addr) = bind().await;
    let (shard, events) = Shard::new(0, config(&addr, Intents::GUILDS));
    let mut ws = establish(&listener, &shard, 45_000, &addr).await;

    send_json(&mut ws, json!({"op": 9, "d": false})).await;

    // After the randomized backoff the shard replaces the connection.
    let code = next_close(&mut ws).await;
    assert_eq!(code, 3066);

    let mut ws2 = accept(&listener).await;
    send_json(&mut ws2, json!({"op": 10, "d": {"heartbeat_interval": 45000}})).await;
    let identify = next_json(&mut ws2).await;
    assert_eq!(identify["op"], 2);

    send_json(
        &mut ws2,
        json!({
            "op": 0,
            "t": "READY",
            "s": 1,
            "d": {"v": 10, "session_id": "S2", "resume_gateway_url": "wss://r"},
        }),
    )
    .await;

    wait_for(|| shard.session_id().as_deref() == Some("S2")).await;
    assert!(events
        .try_iter()
        .any(|e| matches!(e, ShardEvent::InvalidSession { resumable: false })));

    shard.shutdown().await;
}

#[tokio::test]
async fn fatal_close_goes_offline() {
    let (listener, addr) = bind().await;
    let (shard, events) = Shard::new(0, config(&addr, Intents::GUILDS));
    let mut ws = establish(&listener, &shard, 45_000, &addr).await;

    ws.send(Message::Close(Some(CloseFrame {
        code: CloseCode::from(4014),
        reason: "Disallowed intent(s).".into(),
    })))
    .await
    .unwrap();

    wait_for(|| shard.state() == ShardState::Offline).await;
    assert_eq!(shard.session_id(), None);
    assert!(events
        .try_iter()
        .any(|e| matches!(e, ShardEvent::Disconnected { code: 4014 })));
}

#[tokio::test]
async fn send_path_delivers_after_admission() {
    let (listener, addr) = bind().await;
    let (shard, _events) = Shard::new(0, config(&addr, Intents::GUILDS));
    let mut ws = establish(&listener, &shard, 45_000, &addr).await;

    shard
        .send(
            &json!({"op": 3, "d": {"since": null, "activities": [], "status": "online", "afk": false}}),
            false,
        )
        .await
        .unwrap();

    let message = next_json(&mut ws).await;
    assert_eq!(message["op"], 3);
    assert_eq!(message["d"]["status"], "online");

    shard.shutdown().await;
}

#[tokio::test]
async fn request_members_assembles_chunks() {
    let (listener, addr) = bind().await;
    let (shard, _events) = Shard::new(0, config(&addr, Intents::GUILDS | Intents::GUILD_MEMBERS));
    let mut ws = establish(&listener, &shard, 45_000, &addr).await;

    let request_task = tokio::spawn({
        let shard = shard.clone();
        async move {
            shard
                .request_members(Snowflake::new(9), Default::default())
                .await
        }
    });

    let request = next_json(&mut ws).await;
    assert_eq!(request["op"], 8);
    assert_eq!(request["d"]["guild_id"], "9");
    assert_eq!(request["d"]["query"], "");
    assert_eq!(request["d"]["limit"], 0);
    let nonce = request["d"]["nonce"].as_str().unwrap().to_string();

    for (index, user) in [(0u32, 1u64), (1, 2)] {
        send_json(
            &mut ws,
            json!({
                "op": 0,
                "t": "GUILD_MEMBERS_CHUNK",
                "s": 10 + index,
                "d": {
                    "guild_id": "9",
                    "members": [{"user": {"id": user.to_string(), "username": format!("u{user}")}}],
                    "chunk_index": index,
                    "chunk_count": 2,
                    "nonce": nonce,
                },
            }),
        )
        .await;
    }

    let members = timeout(Duration::from_secs(5), request_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(members.len(), 2);
    assert_eq!(
        members[0].user.as_ref().unwrap().id,
        Snowflake::new(1)
    );

    shard.shutdown().await;
}

#[tokio::test]
async fn offline_senders_drain_after_reconnect() {
    let (listener, addr) = bind().await;
    let (shard, _events) = Shard::new(0, config(&addr, Intents::GUILDS));
    let mut ws = establish(&listener, &shard, 45_000, &addr).await;

    ws.send(Message::Close(Some(CloseFrame {
        code: CloseCode::from(4000),
        reason: "".into(),
    })))
    .await
    .unwrap();
    wait_for(|| !shard.is_open()).await;

    // Parked while the socket is down; released once the resume completes.
    let send_task = tokio::spawn({
        let shard = shard.clone();
        async move {
            shard
                .send(&json!({"op": 3, "d": {"status": "idle"}}), false)
                .await
        }
    });

    let mut ws2 = accept(&listener).await;
    let resume = next_json(&mut ws2).await;
    assert_eq!(resume["op"], 6);
    send_json(&mut ws2, json!({"op": 10, "d": {"heartbeat_interval": 45000}})).await;
    send_json(&mut ws2, json!({"op": 0, "t": "RESUMED", "s": 2, "d": null})).await;

    timeout(Duration::from_secs(5), send_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let delivered = next_json(&mut ws2).await;
    assert_eq!(delivered["op"], 3);

    shard.shutdown().await;
}
