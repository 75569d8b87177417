use super::{SignalingChannel, SignalingError, SignalingMessage, Subscribers, Subscription};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use url::Url;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
const HEARTBEAT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ClientFrame {
    Register {
        #[serde(rename = "endpointId")]
        endpoint_id: String,
    },
    Relay {
        to: String,
        message: SignalingMessage,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ServerFrame {
    Registered {
        #[serde(rename = "endpointId")]
        endpoint_id: String,
    },
    Message {
        message: SignalingMessage,
    },
    Error {
        message: String,
    },
    Pong,
}

type AckSlot = Arc<Mutex<Option<oneshot::Sender<Result<String, String>>>>>;

/// Клиент JSON-ретранслятора поверх WebSocket.
pub struct WsSignaling {
    send_tx: mpsc::UnboundedSender<ClientFrame>,
    subscribers: Subscribers,
    disconnect: Arc<watch::Sender<bool>>,
    ack: AckSlot,
    registered: Mutex<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsSignaling {
    pub async fn connect(signaling_url: &str) -> Result<Arc<Self>, SignalingError> {
        let url = websocket_url(signaling_url)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalingError::Transport(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target: "peercall::signaling", url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (disconnect, _) = watch::channel(false);
        let disconnect = Arc::new(disconnect);
        let subscribers = Subscribers::default();
        let ack: AckSlot = Arc::new(Mutex::new(None));

        let writer = tokio::spawn(async move {
            while let Some(frame) = send_rx.recv().await {
                match serde_json::to_string(&frame) {
                    Ok(text) => {
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(target: "peercall::signaling", "failed to encode frame: {err}");
                    }
                }
            }
        });

        let reader_subscribers = subscribers.clone();
        let reader_ack = Arc::clone(&ack);
        let reader_disconnect = Arc::clone(&disconnect);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target: "peercall::signaling", "signaling websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target: "peercall::signaling", "signaling websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => handle_frame(frame, &reader_subscribers, &reader_ack),
                    Err(err) => {
                        tracing::warn!(target: "peercall::signaling", len = text.len(), "dropping unparsable frame: {err}");
                    }
                }
            }
            let _ = reader_disconnect.send(true);
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT);
            loop {
                ticker.tick().await;
                if heartbeat_tx.send(ClientFrame::Ping).is_err() {
                    break;
                }
            }
        });

        Ok(Arc::new(Self {
            send_tx,
            subscribers,
            disconnect,
            ack,
            registered: Mutex::new(None),
            tasks: Mutex::new(vec![writer, reader, heartbeat]),
        }))
    }
}

fn handle_frame(frame: ServerFrame, subscribers: &Subscribers, ack: &AckSlot) {
    match frame {
        ServerFrame::Registered { endpoint_id } => {
            if let Some(tx) = ack.lock().take() {
                let _ = tx.send(Ok(endpoint_id));
            }
        }
        ServerFrame::Message { message } => {
            tracing::trace!(
                target: "peercall::signaling",
                kind = ?message.kind,
                call_id = %message.call_id,
                "ws_in"
            );
            subscribers.dispatch(&message);
        }
        ServerFrame::Error { message } => {
            if let Some(tx) = ack.lock().take() {
                let _ = tx.send(Err(message));
            } else {
                tracing::warn!(target: "peercall::signaling", "relay error: {message}");
            }
        }
        ServerFrame::Pong => {}
    }
}

#[async_trait]
impl SignalingChannel for WsSignaling {
    async fn register(&self, endpoint_id: &str) -> Result<(), SignalingError> {
        let (tx, rx) = oneshot::channel();
        *self.ack.lock() = Some(tx);
        self.send_tx
            .send(ClientFrame::Register {
                endpoint_id: endpoint_id.to_string(),
            })
            .map_err(|_| SignalingError::Closed)?;
        match tokio::time::timeout(REGISTER_TIMEOUT, rx).await {
            Ok(Ok(Ok(assigned))) => {
                tracing::debug!(target: "peercall::signaling", endpoint = %assigned, "registered with relay");
                *self.registered.lock() = Some(assigned);
                Ok(())
            }
            Ok(Ok(Err(reason))) => Err(SignalingError::Rejected(reason)),
            Ok(Err(_)) => Err(SignalingError::Closed),
            Err(_) => Err(SignalingError::Transport("registration timed out".into())),
        }
    }

    async fn send(&self, to: &str, message: SignalingMessage) -> Result<(), SignalingError> {
        if self.registered.lock().is_none() {
            return Err(SignalingError::NotRegistered);
        }
        self.send_tx
            .send(ClientFrame::Relay {
                to: to.to_string(),
                message,
            })
            .map_err(|_| SignalingError::Closed)
    }

    fn subscribe(&self) -> Subscription {
        self.subscribers.subscribe()
    }

    fn on_disconnect(&self) -> watch::Receiver<bool> {
        self.disconnect.subscribe()
    }
}

impl Drop for WsSignaling {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// http(s) → ws(s); ws(s) оставляем как есть
fn websocket_url(raw: &str) -> Result<Url, SignalingError> {
    let mut url =
        Url::parse(raw).map_err(|e| SignalingError::Transport(format!("invalid url {raw}: {e}")))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => return Ok(url),
        other => {
            return Err(SignalingError::Transport(format!(
                "unsupported scheme {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::Transport(format!("cannot rewrite scheme of {raw}")))?;
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::MessageType;
    use serde_json::{json, Value};

    #[test]
    fn http_urls_become_websocket_urls() {
        assert_eq!(
            websocket_url("http://localhost:3000/signal").unwrap().as_str(),
            "ws://localhost:3000/signal"
        );
        assert_eq!(
            websocket_url("https://relay.example.org").unwrap().scheme(),
            "wss"
        );
        assert!(websocket_url("ftp://relay.example.org").is_err());
    }

    #[test]
    fn frames_use_relay_field_names() {
        let frame = ClientFrame::Register {
            endpoint_id: "p1".into(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "type": "register", "endpointId": "p1" })
        );

        let raw = json!({
            "type": "message",
            "message": { "type": "bye", "callId": "c", "fromId": "d1", "toId": "p1", "payload": null }
        });
        match serde_json::from_value::<ServerFrame>(raw).unwrap() {
            ServerFrame::Message { message } => {
                assert_eq!(message.kind, MessageType::Bye);
                assert_eq!(message.payload, Value::Null);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn registered_frame_resolves_pending_ack() {
        let subscribers = Subscribers::default();
        let ack: AckSlot = Arc::new(Mutex::new(None));
        let (tx, rx) = oneshot::channel();
        *ack.lock() = Some(tx);
        handle_frame(
            ServerFrame::Registered {
                endpoint_id: "d1".into(),
            },
            &subscribers,
            &ack,
        );
        assert_eq!(rx.await.unwrap(), Ok("d1".to_string()));
    }
}
