use futures_util::{SinkExt, StreamExt};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use warmup_core::{
    Command, CommandKind, LifecycleState, ResourceId, ServerEnvelope, ServerMessage, StatusUpdate,
    Target,
};
use warmup_hub::{config::Config, launch, operation::TimedWarmup, server::serve};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_hub(stage_delay: Duration) -> SocketAddr {
    let config = Config {
        addr: "127.0.0.1:0".to_string(),
        stage_delay,
        ping_interval: Duration::from_millis(200),
        max_warmup: Duration::from_secs(5),
        ..Config::default()
    };
    let state = launch(&config, Arc::new(TimedWarmup::new(stage_delay))).expect("launch");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(serve(listener, state, std::future::pending()));
    addr
}

async fn connect(addr: SocketAddr) -> WsStream {
    let (ws, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("connect");
    ws
}

async fn next_envelope(ws: &mut WsStream) -> ServerEnvelope {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame timeout")
            .expect("stream open")
            .expect("frame");
        if let Message::Text(text) = msg {
            return ServerEnvelope::decode(&text).expect("decode");
        }
    }
}

async fn send(ws: &mut WsStream, command: &Command) {
    ws.send(Message::Text(command.encode().expect("encode")))
        .await
        .expect("send");
}

fn all_active(latest: &HashMap<ResourceId, LifecycleState>) -> bool {
    latest.len() == 2 && latest.values().all(|state| *state == LifecycleState::Active)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_joiner_gets_partial_snapshot_then_same_broadcasts() {
    let addr = start_hub(Duration::from_millis(40)).await;

    let mut first = connect(addr).await;
    let ServerMessage::InitialStatus(initial) = next_envelope(&mut first).await.msg else {
        panic!("expected initial_status")
    };
    assert!(initial
        .models
        .values()
        .all(|entry| entry.status == LifecycleState::Idle));

    let warmup = Command::new(CommandKind::Warmup, Target::All);
    send(&mut first, &warmup).await;

    let mut first_updates: Vec<StatusUpdate> = Vec::new();
    let mut acked = false;
    let mut second = None;
    let mut latest: HashMap<ResourceId, LifecycleState> = HashMap::new();
    while !(acked && all_active(&latest)) {
        match next_envelope(&mut first).await.msg {
            ServerMessage::CommandAck(ack) => {
                assert_eq!(ack.client_id, warmup.client_id);
                assert!(ack.accepted);
                acked = true;
            }
            ServerMessage::StatusUpdate(update) => {
                latest.insert(update.resource.clone(), update.state);
                if second.is_none() && update.state == LifecycleState::Loading {
                    second = Some(connect(addr).await);
                }
                first_updates.push(update);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    let mut previous: HashMap<ResourceId, u8> = HashMap::new();
    for update in &first_updates {
        let last = previous.entry(update.resource.clone()).or_insert(0);
        assert!(update.progress() >= *last, "progress went backwards");
        *last = update.progress();
    }
    assert!(previous.values().all(|progress| *progress == 100));

    let mut second = second.expect("second client connected mid-sequence");
    let ServerMessage::InitialStatus(snapshot) = next_envelope(&mut second).await.msg else {
        panic!("expected initial_status")
    };
    assert!(snapshot
        .models
        .values()
        .any(|entry| entry.status != LifecycleState::Idle));

    let mut second_updates = Vec::new();
    let mut second_latest: HashMap<ResourceId, LifecycleState> = snapshot
        .models
        .iter()
        .map(|(resource, entry)| (resource.clone(), entry.status))
        .collect();
    while !all_active(&second_latest) {
        let ServerMessage::StatusUpdate(update) = next_envelope(&mut second).await.msg else {
            panic!("expected status_update")
        };
        second_latest.insert(update.resource.clone(), update.state);
        second_updates.push(update);
    }

    for (resource, entry) in &snapshot.models {
        if let Some(next) = second_updates.iter().find(|u| &u.resource == resource) {
            assert!(next.progress() >= entry.details.progress);
        }
    }
    let tail = &first_updates[first_updates.len() - second_updates.len()..];
    assert_eq!(tail, second_updates.as_slice());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ping_and_query_status_reply_before_ack() {
    let addr = start_hub(Duration::from_millis(5)).await;
    let mut ws = connect(addr).await;
    next_envelope(&mut ws).await;

    let ping = Command::new(CommandKind::Ping, Target::All);
    send(&mut ws, &ping).await;
    let ServerMessage::Pong(pong) = next_envelope(&mut ws).await.msg else {
        panic!("expected pong")
    };
    assert_eq!(pong.client_id.as_deref(), Some(ping.client_id.as_str()));
    assert!(matches!(
        next_envelope(&mut ws).await.msg,
        ServerMessage::CommandAck(ack) if ack.accepted && ack.client_id == ping.client_id
    ));

    let query = Command::new(CommandKind::QueryStatus, Target::All);
    send(&mut ws, &query).await;
    let ServerMessage::InitialStatus(snapshot) = next_envelope(&mut ws).await.msg else {
        panic!("expected initial_status")
    };
    assert_eq!(snapshot.models.len(), 2);
    assert!(matches!(
        next_envelope(&mut ws).await.msg,
        ServerMessage::CommandAck(ack) if ack.accepted
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_frame_is_rejected_and_connection_survives() {
    let addr = start_hub(Duration::from_millis(5)).await;
    let mut ws = connect(addr).await;
    next_envelope(&mut ws).await;

    ws.send(Message::Text("{not json".to_string()))
        .await
        .expect("send");
    let ServerMessage::CommandAck(ack) = next_envelope(&mut ws).await.msg else {
        panic!("expected command_ack")
    };
    assert!(!ack.accepted);
    assert_eq!(ack.reason.as_deref(), Some("invalid_json"));

    let ping = Command::new(CommandKind::Ping, Target::All);
    send(&mut ws, &ping).await;
    assert!(matches!(
        next_envelope(&mut ws).await.msg,
        ServerMessage::Pong(_)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_surface_mirrors_commands() {
    let addr = start_hub(Duration::from_millis(5)).await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let health = client
        .get(format!("{base}/health"))
        .send()
        .await
        .expect("health");
    assert!(health.status().is_success());

    let warmup = Command::new(
        CommandKind::Warmup,
        Target::Resource(ResourceId::from("stylevae")),
    );
    let response = client
        .post(format!("{base}/api/warmup"))
        .body(warmup.encode().expect("encode"))
        .send()
        .await
        .expect("post warmup");
    assert_eq!(response.status().as_u16(), 200);
    let envelope: ServerEnvelope = response.json().await.expect("ack body");
    assert!(matches!(envelope.msg, ServerMessage::CommandAck(ack) if ack.accepted));

    let unknown = Command::new(
        CommandKind::Warmup,
        Target::Resource(ResourceId::from("ghost")),
    );
    let response = client
        .post(format!("{base}/api/warmup"))
        .body(unknown.encode().expect("encode"))
        .send()
        .await
        .expect("post unknown");
    assert_eq!(response.status().as_u16(), 400);
    let envelope: ServerEnvelope = response.json().await.expect("ack body");
    assert!(matches!(
        envelope.msg,
        ServerMessage::CommandAck(ack) if ack.reason.as_deref() == Some("unknown_resource")
    ));

    let mut active = false;
    for _ in 0..100 {
        let envelope: ServerEnvelope = client
            .get(format!("{base}/api/status"))
            .send()
            .await
            .expect("status")
            .json()
            .await
            .expect("status body");
        let ServerMessage::InitialStatus(snapshot) = envelope.msg else {
            panic!("expected initial_status")
        };
        if snapshot
            .get(&ResourceId::from("stylevae"))
            .is_some_and(|entry| entry.status == LifecycleState::Active)
        {
            active = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(active);

    let envelope: ServerEnvelope = client
        .get(format!("{base}/api/ping?clientId=h-1"))
        .send()
        .await
        .expect("ping")
        .json()
        .await
        .expect("pong body");
    assert!(matches!(
        envelope.msg,
        ServerMessage::Pong(pong) if pong.client_id.as_deref() == Some("h-1")
    ));
}
