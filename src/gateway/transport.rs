use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::trace;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{ClientError, ClientResult};

/// What a transport hands back to the connection loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close { code: u16, reason: String },
}

/// One open socket. `recv` must be cancel-safe: the connection loop races it
/// against timers.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> ClientResult<()>;

    /// `None` once the stream has ended.
    async fn recv(&mut self) -> Option<ClientResult<Frame>>;

    async fn close(&mut self, code: u16) -> ClientResult<()>;
}

/// Opens sockets. Swapped out in tests for an in-memory pair.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> ClientResult<Box<dyn Transport>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> ClientResult<Box<dyn Transport>> {
        let (stream, _) = connect_async(url).await?;
        Ok(Box::new(WebSocketTransport { stream }))
    }
}

struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> ClientResult<()> {
        self.stream.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<ClientResult<Frame>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(Frame::Text(text.to_string()))),
                Ok(WsMessage::Close(frame)) => {
                    let (code, reason) = frame.map_or_else(
                        || (1005, String::new()),
                        |f| (u16::from(f.code), f.reason.to_string()),
                    );
                    return Some(Ok(Frame::Close { code, reason }));
                }
                Ok(WsMessage::Binary(data)) => {
                    trace!("Ignoring {} byte binary frame", data.len());
                }
                Ok(_) => {}
                Err(e) => return Some(Err(ClientError::WebSocket(e))),
            }
        }
    }

    async fn close(&mut self, code: u16) -> ClientResult<()> {
        let frame = CloseFrame {
            code: WsCloseCode::from(code),
            reason: "".into(),
        };
        match self.stream.close(Some(frame)).await {
            Ok(())
            | Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
