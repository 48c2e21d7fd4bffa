//! Signaling client
//!
//! JSON-over-WebSocket rendezvous with the signaling server. The server
//! authenticates usernames and exchanges public endpoints; it never
//! carries data packets.
//!
//! Inbound messages are dispatched to a [`SignalingSink`] from the
//! reader task; implementations must hand heavy work off to their own
//! tasks.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::{NetworkError, NetworkResult};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Receiver of signaling callbacks. The session supervisor implements
/// this; tests install channel-backed fakes.
pub trait SignalingSink: Send + Sync {
    /// Another user asked to connect to us
    fn on_chat_request(&self, from: &str);

    /// The server answered a get-peer lookup
    fn on_peer_info(&self, username: &str, ip: IpAddr, port: u16);

    /// Both sides agreed; hole punching may start toward this endpoint
    fn on_chat_init(&self, username: &str, ip: IpAddr, port: u16);

    /// The server told us our registered name
    fn on_your_name(&self, _username: &str) {}

    /// The WebSocket closed or failed
    fn on_disconnected(&self) {}
}

/// Messages we send to the server
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientMessage<'a> {
    Greeting,
    Register {
        username: &'a str,
        ip: String,
        port: u16,
    },
    GetName,
    GetPeer {
        username: &'a str,
    },
    StartChat {
        target: &'a str,
    },
    ChatAccept,
    ChatDecline,
}

/// Messages the server sends us. Anything else is logged and dropped.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ServerMessage {
    GreetBack {
        #[serde(default)]
        message: Option<String>,
    },
    RegisterAck {
        #[serde(default)]
        message: Option<String>,
    },
    YourName {
        username: String,
    },
    PeerInfo {
        username: String,
        ip: String,
        port: u16,
    },
    ChatRequest {
        from: String,
    },
    ChatInit {
        username: String,
        ip: String,
        port: u16,
    },
    Error {
        message: String,
    },
}

/// WebSocket signaling client
pub struct SignalingClient {
    writer: tokio::sync::Mutex<WsSink>,
    connected: Arc<AtomicBool>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SignalingClient {
    /// Connect to the signaling server and start the reader task.
    pub async fn connect(url: &str, sink: Arc<dyn SignalingSink>) -> NetworkResult<Self> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| NetworkError::Signaling(format!("Connect failed: {}", e)))?;

        info!("Connected to signaling server at {}", url);
        let (writer, mut reader) = stream.split();

        let connected = Arc::new(AtomicBool::new(true));
        let reader_connected = Arc::clone(&connected);

        let reader_task = tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(Message::Text(text)) => handle_server_message(&text, sink.as_ref()),
                    Ok(Message::Close(_)) => {
                        info!("Signaling server closed the connection");
                        break;
                    }
                    Ok(_) => {} // binary / ping / pong: nothing to do
                    Err(e) => {
                        error!("Signaling connection error: {}", e);
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::Release);
            sink.on_disconnected();
        });

        Ok(Self {
            writer: tokio::sync::Mutex::new(writer),
            connected,
            reader_task: std::sync::Mutex::new(Some(reader_task)),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Close the socket and stop the reader task.
    pub async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let mut writer = self.writer.lock().await;
            let _ = writer.send(Message::Close(None)).await;
        }

        let task = self.reader_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        debug!("Signaling client disconnected");
    }

    pub async fn send_greeting(&self) -> NetworkResult<()> {
        self.send(&ClientMessage::Greeting).await
    }

    /// Publish our username and server-reflexive endpoint.
    pub async fn register(&self, username: &str, ip: IpAddr, port: u16) -> NetworkResult<()> {
        self.send(&ClientMessage::Register {
            username,
            ip: ip.to_string(),
            port,
        })
        .await
    }

    pub async fn request_username(&self) -> NetworkResult<()> {
        self.send(&ClientMessage::GetName).await
    }

    /// Look up another user's public endpoint.
    pub async fn request_peer_info(&self, username: &str) -> NetworkResult<()> {
        self.send(&ClientMessage::GetPeer { username }).await
    }

    /// Ask the server to broker a connection with `target`.
    pub async fn send_chat_request(&self, target: &str) -> NetworkResult<()> {
        self.send(&ClientMessage::StartChat { target }).await
    }

    pub async fn accept_chat_request(&self) -> NetworkResult<()> {
        self.send(&ClientMessage::ChatAccept).await
    }

    pub async fn decline_chat_request(&self) -> NetworkResult<()> {
        self.send(&ClientMessage::ChatDecline).await
    }

    async fn send(&self, message: &ClientMessage<'_>) -> NetworkResult<()> {
        if !self.is_connected() {
            return Err(NetworkError::Signaling("Not connected".into()));
        }

        let json = serde_json::to_string(message)
            .map_err(|e| NetworkError::Signaling(e.to_string()))?;

        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(json))
            .await
            .map_err(|e| NetworkError::Signaling(format!("Send failed: {}", e)))
    }
}

/// Parse one server message and dispatch it to the sink.
fn handle_server_message(text: &str, sink: &dyn SignalingSink) {
    let message: ServerMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Unparseable signaling message ({}): {}", e, text);
            return;
        }
    };

    match message {
        ServerMessage::GreetBack { message } => {
            info!("Server: {}", message.unwrap_or_default());
        }
        ServerMessage::RegisterAck { message } => {
            info!("Server: {}", message.unwrap_or_default());
        }
        ServerMessage::YourName { username } => {
            sink.on_your_name(&username);
        }
        ServerMessage::PeerInfo { username, ip, port } => match ip.parse() {
            Ok(ip) => sink.on_peer_info(&username, ip, port),
            Err(_) => warn!("peer-info with invalid ip: {}", ip),
        },
        ServerMessage::ChatRequest { from } => {
            sink.on_chat_request(&from);
        }
        ServerMessage::ChatInit { username, ip, port } => match ip.parse() {
            Ok(ip) => sink.on_chat_init(&username, ip, port),
            Err(_) => warn!("chat-init with invalid ip: {}", ip),
        },
        ServerMessage::Error { message } => {
            error!("Signaling server error: {}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn drain(&self) -> Vec<String> {
            std::mem::take(&mut self.events.lock().unwrap())
        }
    }

    impl SignalingSink for RecordingSink {
        fn on_chat_request(&self, from: &str) {
            self.events.lock().unwrap().push(format!("request:{}", from));
        }

        fn on_peer_info(&self, username: &str, ip: IpAddr, port: u16) {
            self.events
                .lock()
                .unwrap()
                .push(format!("peer:{}:{}:{}", username, ip, port));
        }

        fn on_chat_init(&self, username: &str, ip: IpAddr, port: u16) {
            self.events
                .lock()
                .unwrap()
                .push(format!("init:{}:{}:{}", username, ip, port));
        }

        fn on_your_name(&self, username: &str) {
            self.events.lock().unwrap().push(format!("name:{}", username));
        }
    }

    #[test]
    fn client_messages_serialize_with_expected_tags() {
        let register = serde_json::to_value(ClientMessage::Register {
            username: "alice",
            ip: "198.51.100.4".into(),
            port: 40102,
        })
        .unwrap();
        assert_eq!(register["type"], "register");
        assert_eq!(register["username"], "alice");
        assert_eq!(register["ip"], "198.51.100.4");
        assert_eq!(register["port"], 40102);

        let start = serde_json::to_value(ClientMessage::StartChat { target: "bob" }).unwrap();
        assert_eq!(start["type"], "start-chat");
        assert_eq!(start["target"], "bob");

        assert_eq!(
            serde_json::to_value(ClientMessage::Greeting).unwrap()["type"],
            "greeting"
        );
        assert_eq!(
            serde_json::to_value(ClientMessage::GetName).unwrap()["type"],
            "get-name"
        );
        assert_eq!(
            serde_json::to_value(ClientMessage::ChatAccept).unwrap()["type"],
            "chat-accept"
        );
        assert_eq!(
            serde_json::to_value(ClientMessage::ChatDecline).unwrap()["type"],
            "chat-decline"
        );
        assert_eq!(
            serde_json::to_value(ClientMessage::GetPeer { username: "bob" }).unwrap()["type"],
            "get-peer"
        );
    }

    #[test]
    fn dispatches_server_messages() {
        let sink = RecordingSink::default();

        handle_server_message(r#"{"type":"chat-request","from":"bob"}"#, &sink);
        handle_server_message(
            r#"{"type":"peer-info","username":"bob","ip":"203.0.113.9","port":50000}"#,
            &sink,
        );
        handle_server_message(
            r#"{"type":"chat-init","username":"bob","ip":"203.0.113.9","port":50000}"#,
            &sink,
        );
        handle_server_message(r#"{"type":"your-name","username":"alice"}"#, &sink);

        assert_eq!(
            sink.drain(),
            vec![
                "request:bob",
                "peer:bob:203.0.113.9:50000",
                "init:bob:203.0.113.9:50000",
                "name:alice",
            ]
        );
    }

    #[test]
    fn unknown_and_malformed_messages_are_dropped() {
        let sink = RecordingSink::default();

        handle_server_message(r#"{"type":"mystery","x":1}"#, &sink);
        handle_server_message("not json at all", &sink);
        handle_server_message(r#"{"type":"peer-info","username":"bob","ip":"bogus","port":1}"#, &sink);
        handle_server_message(r#"{"type":"error","message":"User 'bob' not found"}"#, &sink);
        handle_server_message(r#"{"type":"greet-back","message":"hi"}"#, &sink);
        handle_server_message(r#"{"type":"register-ack"}"#, &sink);

        assert!(sink.drain().is_empty());
    }
}
