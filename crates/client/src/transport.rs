// WebSocket transport carrying session frames to and from the broker.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use huddle_common::room::RoomName;

/// Broker endpoint URL with the three identifying query parameters.
pub fn session_url(base: &str, room: &RoomName, user_id: &str, replica_id: u64) -> Result<Url> {
    let mut url = Url::parse(base).with_context(|| format!("invalid broker url `{base}`"))?;
    url.query_pairs_mut()
        .append_pair("room", room.as_str())
        .append_pair("userId", user_id)
        .append_pair("clientId", &replica_id.to_string());
    Ok(url)
}

pub struct WsTransport {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsTransport {
    pub async fn connect(
        base: &str,
        room: &RoomName,
        user_id: &str,
        replica_id: u64,
    ) -> Result<Self> {
        let url = session_url(base, room, user_id, replica_id)?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect to broker at {url}"))?;
        Ok(Self { socket })
    }

    pub async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        self.socket
            .send(Message::Binary(frame.into()))
            .await
            .context("websocket send failed")
    }

    /// Next binary frame, transparently answering pings. `None` on a
    /// clean close.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        while let Some(message) = self.socket.next().await {
            match message.context("websocket read failed")? {
                Message::Binary(payload) => return Ok(Some(payload.to_vec())),
                Message::Ping(payload) => {
                    self.socket
                        .send(Message::Pong(payload))
                        .await
                        .context("websocket pong failed")?;
                }
                Message::Close(_) => return Ok(None),
                Message::Text(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
        Ok(None)
    }

    pub async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}
