use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use peercall::signaling::{MessageType, SignalingChannel, SignalingError, WsSignaling};
use peercall::SignalingMessage;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

type Peers = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<String>>>>;

/// Минимальный JSON-ретранслятор: register / relay / ping
async fn spawn_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let peers: Peers = Arc::new(Mutex::new(HashMap::new()));
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let peers = peers.clone();
            tokio::spawn(async move {
                let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                let (mut write, mut read) = ws.split();
                let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                tokio::spawn(async move {
                    while let Some(text) = rx.recv().await {
                        if write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                });
                while let Some(Ok(Message::Text(text))) = read.next().await {
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    match frame["type"].as_str() {
                        Some("register") => {
                            let id = frame["endpointId"].as_str().unwrap().to_string();
                            let reply = if id == "taken" {
                                json!({ "type": "error", "message": "endpoint id taken" })
                            } else {
                                peers.lock().insert(id.clone(), tx.clone());
                                json!({ "type": "registered", "endpointId": id })
                            };
                            let _ = tx.send(reply.to_string());
                        }
                        Some("relay") => {
                            let to = frame["to"].as_str().unwrap();
                            let target = peers.lock().get(to).cloned();
                            if let Some(target) = target {
                                let out = json!({ "type": "message", "message": frame["message"] });
                                let _ = target.send(out.to_string());
                            }
                        }
                        Some("ping") => {
                            let _ = tx.send(json!({ "type": "pong" }).to_string());
                        }
                        _ => {}
                    }
                }
            });
        }
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn messages_travel_through_websocket_relay() {
    let url = spawn_relay().await;
    let p1 = WsSignaling::connect(&url).await.unwrap();
    let d1 = WsSignaling::connect(&url).await.unwrap();

    let early = SignalingMessage::new(MessageType::Bye, "c1", "p1", "d1", Value::Null);
    assert!(matches!(
        p1.send("d1", early).await,
        Err(SignalingError::NotRegistered)
    ));

    p1.register("p1").await.unwrap();
    d1.register("d1").await.unwrap();
    let mut inbox = d1.subscribe();

    let offer = SignalingMessage::new(
        MessageType::Offer,
        "c1",
        "p1",
        "d1",
        json!({ "type": "offer", "sdp": "v=0" }),
    );
    p1.send("d1", offer.clone()).await.unwrap();
    let received = timeout(Duration::from_secs(2), inbox.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, offer);
}

#[tokio::test]
async fn relay_error_rejects_registration() {
    let url = spawn_relay().await;
    let client = WsSignaling::connect(&url).await.unwrap();
    let err = client.register("taken").await.unwrap_err();
    assert!(matches!(err, SignalingError::Rejected(reason) if reason == "endpoint id taken"));
}

#[tokio::test]
async fn unreachable_relay_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let result = WsSignaling::connect(&format!("ws://{addr}")).await;
    assert!(matches!(result, Err(SignalingError::Transport(_))));
}
