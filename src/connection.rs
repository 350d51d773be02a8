use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use log::debug;
use tokio_stream::StreamExt;

use crate::error::{RelayError, Result};
use crate::protocol::{Inbound, Reply};

/// Full-duplex message channel to one streamer client.
#[async_trait]
pub trait Connection: Send {
    /// Next message from the client. `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Result<Inbound>>;

    async fn send(&mut self, reply: Reply) -> Result<()>;

    /// Closes the channel. Safe to call on an already closed connection.
    async fn close(&mut self);
}

pub struct WsConnection {
    socket: WebSocket,
    closed: bool,
}

impl WsConnection {
    pub fn new(socket: WebSocket) -> Self {
        WsConnection {
            socket,
            closed: false,
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn recv(&mut self) -> Option<Result<Inbound>> {
        loop {
            match self.socket.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Inbound::Text(text.as_str().to_owned()))),
                Ok(Message::Binary(bytes)) => return Some(Ok(Inbound::Binary(bytes))),
                Ok(Message::Close(frame)) => {
                    debug!("client sent close: {:?}", frame);
                    self.closed = true;
                    return None;
                }
                // Pings are answered by axum itself.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Err(e) => return Some(Err(RelayError::Connection(e.to_string()))),
            }
        }
    }

    async fn send(&mut self, reply: Reply) -> Result<()> {
        self.socket
            .send(Message::Text(reply.to_json().into()))
            .await
            .map_err(|e| RelayError::Connection(e.to_string()))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.socket.send(Message::Close(None)).await {
            debug!("close frame not delivered: {}", e);
        }
    }
}
