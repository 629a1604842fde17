//! Websocket framing shared by both subprotocols. A `Connection` wraps one
//! established `tokio-tungstenite` stream and serializes writes behind a
//! mutex so a text command and its binary follow-up frame can never be
//! interleaved with another sender's frames.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const FRONTEND_SUBPROTOCOL: &str = "asyonline/asy";
pub const EXECUTOR_SUBPROTOCOL: &str = "asyonline.asy";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One websocket frame pair as seen by the protocol layer: a decoded text
/// command, optionally followed by the raw bytes of the next binary frame.
#[derive(Debug)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

pub struct Connection {
    write: Mutex<futures_util::stream::SplitSink<WsStream, Message>>,
    read: Mutex<futures_util::stream::SplitStream<WsStream>>,
}

impl Connection {
    fn from_stream(stream: WsStream) -> Self {
        let (write, read) = stream.split();
        Self {
            write: Mutex::new(write),
            read: Mutex::new(read),
        }
    }

    /// Accept a server-side handshake on an already-accepted TCP stream,
    /// requiring exactly `subprotocol`.
    pub async fn accept(
        tcp: TcpStream,
        subprotocol: &'static str,
    ) -> Result<Self, tokio_tungstenite::tungstenite::Error> {
        let callback = move |req: &Request, mut resp: Response| {
            let offered = req
                .headers()
                .get("sec-websocket-protocol")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(',').any(|p| p.trim() == subprotocol))
                .unwrap_or(false);
            if !offered {
                return Err(tokio_tungstenite::tungstenite::handshake::server::ErrorResponse::new(
                    Some("unknown websocket sub-protocols".to_string()),
                ));
            }
            resp.headers_mut().insert(
                "sec-websocket-protocol",
                subprotocol.parse().expect("valid header value"),
            );
            Ok(resp)
        };
        let stream = tokio_tungstenite::accept_hdr_async(
            MaybeTlsStream::Plain(tcp),
            callback,
        )
        .await?;
        Ok(Self::from_stream(stream))
    }

    /// Dial a backend speaking `subprotocol` at `ws://addr/asy`.
    pub async fn dial(
        addr: std::net::SocketAddr,
        subprotocol: &'static str,
    ) -> Result<Self, tokio_tungstenite::tungstenite::Error> {
        let url = format!("ws://{addr}/asy");
        let mut request = url.into_client_request()?;
        request
            .headers_mut()
            .insert("sec-websocket-protocol", subprotocol.parse().expect("valid header value"));
        let (stream, _resp) = tokio_tungstenite::connect_async(request).await?;
        Ok(Self::from_stream(stream))
    }

    pub async fn send_text(&self, text: String) -> std::io::Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(text.into()))
            .await
            .map_err(std::io::Error::other)
    }

    pub async fn send_binary(&self, data: Vec<u8>) -> std::io::Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Binary(data.into()))
            .await
            .map_err(std::io::Error::other)
    }

    /// Sends a text command and its binary payload as one atomic pair — no
    /// other sender's frame can land between them.
    pub async fn send_pair(&self, text: String, payload: Vec<u8>) -> std::io::Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(text.into()))
            .await
            .map_err(std::io::Error::other)?;
        write
            .send(Message::Binary(payload.into()))
            .await
            .map_err(std::io::Error::other)
    }

    /// Reads the next meaningful frame, transparently answering pings and
    /// skipping pongs/close handshakes are surfaced as `None`.
    pub async fn recv(&self) -> Option<std::io::Result<Frame>> {
        let mut read = self.read.lock().await;
        loop {
            match read.next().await? {
                Ok(Message::Text(t)) => return Some(Ok(Frame::Text(t.to_string()))),
                Ok(Message::Binary(b)) => return Some(Ok(Frame::Binary(b.into()))),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(Err(std::io::Error::other(e))),
            }
        }
    }
}
