//! End-to-end: real listener, WebSocket clients, HTTP sends.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parley_broker::{Broker, MemoryBroker};
use parley_core::{Envelope, UserId};
use parley_server::{ParleyServer, RunningServer, ServerConfig, TokenService};
use parley_store::Database;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn tokens() -> TokenService {
    TokenService::new("integration-secret", 3600)
}

async fn boot_with(broker: Arc<dyn Broker>) -> RunningServer {
    let server = ParleyServer::new(
        ServerConfig::default(),
        Database::in_memory().unwrap(),
        broker,
        tokens(),
        None,
    )
    .await
    .unwrap();
    server.listen().await.unwrap()
}

async fn boot() -> (RunningServer, TokenService) {
    (boot_with(Arc::new(MemoryBroker::new(256))).await, tokens())
}

async fn connect(server: &RunningServer, tokens: &TokenService, user: &str, device: &str) -> Client {
    let token = tokens.issue(&UserId::from_raw(user)).unwrap();
    let url = format!(
        "ws://{}/api/chat/ws?token={token}&device={device}",
        server.local_addr()
    );
    let (client, _resp) = connect_async(url).await.unwrap();
    client
}

async fn wait_for_connections(server: &RunningServer, user: &str, expected: usize) {
    let user = UserId::from_raw(user);
    for _ in 0..100 {
        if server.hub().user_connections(&user).await.unwrap().len() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{user} never reached {expected} connections");
}

async fn next_envelope(client: &mut Client) -> Envelope {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .unwrap();
        if msg.is_text() {
            return serde_json::from_str(msg.to_text().unwrap()).unwrap();
        }
    }
}

#[tokio::test]
async fn message_reaches_every_device_of_recipient() {
    let (server, tokens) = boot().await;
    let mut phone = connect(&server, &tokens, "bob", "phone").await;
    let mut laptop = connect(&server, &tokens, "bob", "laptop").await;
    wait_for_connections(&server, "bob", 2).await;

    let alice = tokens.issue(&UserId::from_raw("alice")).unwrap();
    let http = reqwest::Client::new();
    let resp = http
        .post(format!("http://{}/api/chat/messages", server.local_addr()))
        .bearer_auth(&alice)
        .json(&serde_json::json!({"toId": "bob", "content": "hello bob"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let sent: Envelope = resp.json().await.unwrap();

    for client in [&mut phone, &mut laptop] {
        let got = next_envelope(client).await;
        assert_eq!(got.id, sent.id);
        assert_eq!(got.from_id.as_str(), "alice");
        assert_eq!(got.content, "hello bob");
    }

    let history: Vec<Envelope> = http
        .get(format!("http://{}/api/chat/messages/alice", server.local_addr()))
        .bearer_auth(tokens.issue(&UserId::from_raw("bob")).unwrap())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, sent.id);

    server.shutdown().await;
}

#[tokio::test]
async fn closing_client_unregisters() {
    let (server, tokens) = boot().await;
    let mut client = connect(&server, &tokens, "carol", "phone").await;
    wait_for_connections(&server, "carol", 1).await;

    client.send(Message::Close(None)).await.unwrap();
    wait_for_connections(&server, "carol", 0).await;
    assert_eq!(server.hub().online_users().await.unwrap(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn http_errors_are_reported() {
    let (server, tokens) = boot().await;
    let http = reqwest::Client::new();
    let url = format!("http://{}/api/chat/messages", server.local_addr());

    let resp = http
        .post(&url)
        .json(&serde_json::json!({"toId": "bob", "content": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = http
        .post(&url)
        .bearer_auth(tokens.issue(&UserId::from_raw("alice")).unwrap())
        .json(&serde_json::json!({"toId": "bob", "content": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let ws = connect_async(format!("ws://{}/api/chat/ws", server.local_addr())).await;
    assert!(ws.is_err());

    server.shutdown().await;
}

/// Two server processes share one broker: Redis when
/// `PARLEY_TEST_REDIS_URL` is set, otherwise a shared in-process broker.
#[tokio::test]
async fn message_crosses_servers_through_shared_broker() {
    let url = std::env::var("PARLEY_TEST_REDIS_URL").ok();
    let broker = parley_broker::connect(url.as_deref(), 256).await.unwrap();
    let tokens = tokens();
    let server_a = boot_with(Arc::clone(&broker)).await;
    let server_b = boot_with(broker).await;

    let mut bob = connect(&server_b, &tokens, "bob", "phone").await;
    wait_for_connections(&server_b, "bob", 1).await;
    assert!(server_a
        .hub()
        .user_connections(&UserId::from_raw("bob"))
        .await
        .unwrap()
        .is_empty());

    let resp = reqwest::Client::new()
        .post(format!("http://{}/api/chat/messages", server_a.local_addr()))
        .bearer_auth(tokens.issue(&UserId::from_raw("alice")).unwrap())
        .json(&serde_json::json!({"toId": "bob", "content": "via server a"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let sent: Envelope = resp.json().await.unwrap();

    let got = next_envelope(&mut bob).await;
    assert_eq!(got.id, sent.id);
    assert_eq!(got.content, "via server a");

    server_a.shutdown().await;
    server_b.shutdown().await;
}
