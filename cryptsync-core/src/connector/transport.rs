//! The duplex message channel the connector runs on.
//!
//! The connector only assumes an ordered, reliable, framed, full-duplex
//! binary pipe. Production uses a WebSocket; tests drive the connector with
//! an in-memory pair.

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Transport failures. TLS problems are kept apart from plain connect
/// failures so the caller can log them distinctly.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("TLS failure: {0}")]
    Tls(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Receive(String),
}

/// An established duplex binary message channel.
pub trait Transport: Send {
    fn send(&mut self, data: Vec<u8>) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Next inbound binary message; `None` once the peer closed the channel.
    fn recv(&mut self) -> impl Future<Output = Option<Result<Vec<u8>, TransportError>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens transports; the connector dials on every (re)connect.
pub trait Dialer: Send {
    type Transport: Transport;

    fn connect(
        &mut self,
        url: &str,
        access_key: &str,
        headers: &[(String, Vec<u8>)],
    ) -> impl Future<Output = Result<Self::Transport, TransportError>> + Send;
}

/// WebSocket transport.
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Transport for WsTransport {
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
                // Protocol-level ping/pong and text frames are not part of
                // the message contract.
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

/// Dialer producing WebSocket transports. The access key travels as the
/// websocket subprotocol; extra headers are attached to the upgrade request.
#[derive(Default)]
pub struct WsDialer;

impl Dialer for WsDialer {
    type Transport = WsTransport;

    async fn connect(
        &mut self,
        url: &str,
        access_key: &str,
        headers: &[(String, Vec<u8>)],
    ) -> Result<WsTransport, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        if !access_key.is_empty() {
            let value = HeaderValue::from_str(access_key)
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", value);
        }
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let value = HeaderValue::from_bytes(value)
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _response) = connect_async(request).await.map_err(|e| match &e {
            tokio_tungstenite::tungstenite::Error::Tls(tls) => TransportError::Tls(tls.to_string()),
            _ => TransportError::Connect(e.to_string()),
        })?;
        Ok(WsTransport { stream })
    }
}

/// In-memory transport backed by two unbounded channels.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryTransport {
    /// Create a connected pair of transports.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (
            Self { tx: tx_a, rx: rx_b },
            Self { tx: tx_b, rx: rx_a },
        )
    }
}

impl Transport for MemoryTransport {
    async fn send(&mut self, data: Vec<u8>) -> Result<(), TransportError> {
        self.tx
            .send(data)
            .map_err(|_| TransportError::Send("channel closed".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Vec<u8>, TransportError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

/// Dialer handing out a scripted sequence of in-memory transports, for
/// exercising connect/retry flows without sockets.
pub struct MemoryDialer {
    transports: VecDeque<MemoryTransport>,
}

impl MemoryDialer {
    pub fn new(transports: impl IntoIterator<Item = MemoryTransport>) -> Self {
        Self {
            transports: transports.into_iter().collect(),
        }
    }
}

impl Dialer for MemoryDialer {
    type Transport = MemoryTransport;

    async fn connect(
        &mut self,
        _url: &str,
        _access_key: &str,
        _headers: &[(String, Vec<u8>)],
    ) -> Result<MemoryTransport, TransportError> {
        self.transports
            .pop_front()
            .ok_or_else(|| TransportError::Connect("no transport scripted".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pair_is_full_duplex() {
        let (mut client, mut server) = MemoryTransport::pair();

        client.send(b"ping".to_vec()).await.unwrap();
        server.send(b"pong".to_vec()).await.unwrap();

        assert_eq!(server.recv().await.unwrap().unwrap(), b"ping");
        assert_eq!(client.recv().await.unwrap().unwrap(), b"pong");
    }

    #[tokio::test]
    async fn dropped_peer_ends_stream() {
        let (mut client, server) = MemoryTransport::pair();
        drop(server);
        assert!(client.recv().await.is_none());
        assert!(client.send(b"late".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn memory_dialer_exhausts_script() {
        let (a, _peer) = MemoryTransport::pair();
        let mut dialer = MemoryDialer::new([a]);

        assert!(dialer.connect("wss://x", "", &[]).await.is_ok());
        assert!(dialer.connect("wss://x", "", &[]).await.is_err());
    }
}
