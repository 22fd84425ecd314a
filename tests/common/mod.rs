//! In-memory gateway sockets shared by the integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fluxer::config::GatewayConfig;
use fluxer::error::{ClientError, ClientResult};
use fluxer::gateway::{
    Connector, Frame, GatewayConnection, GatewayHandle, Listeners, Payload, Transport,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const INTERVAL_MS: u64 = 41_250;

/// The server side of one accepted socket.
pub struct ServerEnd {
    pub url: String,
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: mpsc::UnboundedReceiver<String>,
    closed_with: Arc<Mutex<Option<u16>>>,
}

impl ServerEnd {
    pub fn send(&self, payload: Value) {
        self.to_client
            .send(Frame::Text(payload.to_string()))
            .unwrap();
    }

    pub fn hello(&self) {
        self.send(json!({ "op": 10, "d": { "heartbeat_interval": INTERVAL_MS } }));
    }

    pub fn dispatch(&self, event: &str, seq: u64, data: Value) {
        self.send(json!({ "op": 0, "t": event, "s": seq, "d": data }));
    }

    pub fn ready(&self, seq: u64) {
        self.dispatch(
            "READY",
            seq,
            json!({
                "session_id": "session-1",
                "resume_gateway_url": "wss://resume.gateway.test",
                "user": { "id": "42", "username": "bot" },
            }),
        );
    }

    pub fn close(&self, code: u16) {
        self.to_client
            .send(Frame::Close {
                code,
                reason: String::new(),
            })
            .unwrap();
    }

    /// Next frame the client sent with opcode `op`, skipping heartbeats
    /// unless those are what we're after.
    pub async fn expect_op(&mut self, op: u8) -> Payload {
        loop {
            let text = timeout(Duration::from_secs(600), self.from_client.recv())
                .await
                .expect("client went quiet")
                .expect("client dropped the socket");
            let payload = Payload::decode(&text).unwrap();
            if payload.op == 1 && op != 1 {
                continue;
            }
            assert_eq!(payload.op, op, "unexpected frame {text}");
            return payload;
        }
    }

    /// Every frame the client has written so far, without waiting.
    pub fn drain_sent(&mut self) -> Vec<Payload> {
        let mut sent = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            sent.push(Payload::decode(&text).unwrap());
        }
        sent
    }

    pub fn closed_with(&self) -> Option<u16> {
        *self.closed_with.lock().unwrap()
    }
}

struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Frame>,
    outgoing: mpsc::UnboundedSender<String>,
    closed_with: Arc<Mutex<Option<u16>>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> ClientResult<()> {
        self.outgoing
            .send(text)
            .map_err(|_| ClientError::transport("server end dropped"))
    }

    async fn recv(&mut self) -> Option<ClientResult<Frame>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self, code: u16) -> ClientResult<()> {
        *self.closed_with.lock().unwrap() = Some(code);
        Ok(())
    }
}

pub struct MockConnector {
    pub accepted: mpsc::UnboundedSender<ServerEnd>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> ClientResult<Box<dyn Transport>> {
        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        let closed_with = Arc::new(Mutex::new(None));
        self.accepted
            .send(ServerEnd {
                url: url.to_string(),
                to_client,
                from_client,
                closed_with: closed_with.clone(),
            })
            .map_err(|_| ClientError::transport("test finished"))?;
        Ok(Box::new(MockTransport {
            incoming,
            outgoing,
            closed_with,
        }))
    }
}

impl MockConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (Self { accepted }, rx)
    }
}

/// A [`GatewayConnection`] running on its own task against a [`MockConnector`].
pub struct Harness {
    pub handle: GatewayHandle,
    pub task: JoinHandle<ClientResult<()>>,
    pub accepted: mpsc::UnboundedReceiver<ServerEnd>,
}

impl Harness {
    pub fn start(listeners: Listeners) -> Self {
        let (connector, accepted) = MockConnector::new();
        let config = GatewayConfig {
            url: "wss://gateway.test".into(),
            ..GatewayConfig::default()
        };
        let connection = GatewayConnection::new(
            "token",
            config,
            Arc::new(connector),
            listeners,
        );
        let handle = connection.handle();
        Self {
            handle,
            task: connection.spawn(),
            accepted,
        }
    }

    pub async fn accept(&mut self) -> ServerEnd {
        timeout(Duration::from_secs(600), self.accepted.recv())
            .await
            .expect("client never connected")
            .expect("connector dropped")
    }

    /// Accepts, says HELLO and answers the IDENTIFY with READY at `seq`.
    pub async fn connect_ready(&mut self, seq: u64) -> ServerEnd {
        let mut server = self.accept().await;
        server.hello();
        let identify = server.expect_op(2).await;
        assert_eq!(identify.d["token"], "token");
        server.ready(seq);
        self.handle.wait_until_connected().await.unwrap();
        server
    }
}

