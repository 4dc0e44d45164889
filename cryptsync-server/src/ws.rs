//! Server-side WebSocket transport adapter.

use cryptsync_core::connector::transport::{Transport, TransportError};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

/// An accepted client connection as the session's duplex channel.
pub struct WsServerTransport {
    stream: WebSocketStream<TcpStream>,
}

impl WsServerTransport {
    pub fn new(stream: WebSocketStream<TcpStream>) -> Self {
        Self { stream }
    }
}

impl Transport for WsServerTransport {
    async fn send(&mut self, data: Vec<u8>) -> Result<(), TransportError> {
        self.stream
            .send(WsMessage::Binary(data))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Binary(data)) => return Some(Ok(data)),
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => continue,
                Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => return None,
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
