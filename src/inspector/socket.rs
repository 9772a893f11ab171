//! One accepted debugger connection.
//!
//! Each connection runs as its own task. It parses HTTP and reports
//! [`SocketEvent`]s; the server loop decides and answers with
//! [`SocketCommand`]s. Once an upgrade is accepted the stream is handed to
//! tokio-tungstenite, which owns framing, ping replies and the close
//! handshake from then on.
//!
//! ```text
//!   Http ──upgrade request──▶ UpgradePending ──AcceptUpgrade──▶ WebSocket
//!    │                              │
//!    └──────── CancelHandshake ─────┴──▶ closed
//! ```

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::{self, Message};

use super::http::{self, HttpRequest, ParseResult};
use super::server::{ServerEvent, SessionId};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Largest message accepted from a client.
pub(crate) const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// What a connection reports to the server loop.
#[derive(Debug)]
pub(crate) enum SocketEvent {
    HttpGet { host: String, path: String },
    Upgrade { host: String, path: String, ws_key: String },
    Frame(Vec<u8>),
    /// Always the last event of a connection.
    Closed,
}

/// What the server loop asks a connection to do.
#[derive(Debug)]
pub(crate) enum SocketCommand {
    /// Raw bytes, before any upgrade.
    Http(Bytes),
    /// A text message, once upgraded. Dropped before that.
    Text(String),
    AcceptUpgrade(String),
    CancelHandshake,
    Close,
}

/// How the HTTP phase ended.
enum Handshake {
    /// Upgraded; carries bytes the client sent after the request head.
    Accepted(Vec<u8>),
    Closed,
}

enum RequestAction {
    Continue,
    AwaitUpgrade,
    Cancel,
}

pub(crate) struct Connection {
    session_id: SessionId,
    events: mpsc::UnboundedSender<ServerEvent>,
    commands: mpsc::UnboundedReceiver<SocketCommand>,
    allow_any_host: bool,
}

fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(MAX_MESSAGE_SIZE);
    config
}

impl Connection {
    /// Spawns the connection task and returns its command channel.
    pub fn spawn(
        session_id: SessionId,
        stream: TcpStream,
        allow_any_host: bool,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> mpsc::UnboundedSender<SocketCommand> {
        let (command_tx, commands) = mpsc::unbounded_channel();

        let connection = Self {
            session_id,
            events,
            commands,
            allow_any_host,
        };
        tokio::spawn(connection.run(stream));

        command_tx
    }

    async fn run(mut self, mut stream: TcpStream) {
        match self.serve_http(&mut stream).await {
            Ok(Handshake::Accepted(leftover)) => {
                let ws = WebSocketStream::from_partially_read(stream, leftover, Role::Server, Some(ws_config())).await;
                match self.serve_websocket(ws).await {
                    Ok(()) | Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {}
                    Err(tungstenite::Error::Protocol(e)) => {
                        tracing::warn!(session = self.session_id, "websocket protocol error: {}", e);
                    }
                    Err(e) => tracing::debug!(session = self.session_id, "websocket error: {}", e),
                }
            }
            Ok(Handshake::Closed) => {
                let _ = stream.shutdown().await;
            }
            Err(e) => tracing::debug!(session = self.session_id, "connection error: {}", e),
        }
        self.emit(SocketEvent::Closed);
    }

    /// Serves requests until the connection closes or an upgrade is accepted.
    ///
    /// Input is not read while an upgrade waits for the server's decision.
    async fn serve_http(&mut self, stream: &mut TcpStream) -> io::Result<Handshake> {
        let mut read_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut upgrade_pending = false;

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    let Some(command) = command else { return Ok(Handshake::Closed) };
                    match command {
                        SocketCommand::Http(data) => stream.write_all(&data).await?,
                        SocketCommand::Text(_) => {}
                        SocketCommand::AcceptUpgrade(ws_key) if upgrade_pending => {
                            stream
                                .write_all(http::accept_upgrade_response(&ws_key).as_bytes())
                                .await?;
                            // Frames may have arrived together with the handshake.
                            return Ok(Handshake::Accepted(read_buf.to_vec()));
                        }
                        SocketCommand::AcceptUpgrade(_) => {
                            tracing::warn!(session = self.session_id, "upgrade accepted outside a handshake");
                        }
                        SocketCommand::CancelHandshake => return cancel_handshake(stream).await,
                        SocketCommand::Close => return Ok(Handshake::Closed),
                    }
                }

                read = stream.read_buf(&mut read_buf), if !upgrade_pending => {
                    if read? == 0 {
                        return Ok(Handshake::Closed);
                    }

                    while !upgrade_pending {
                        match http::parse_request(&read_buf) {
                            ParseResult::Incomplete => break,
                            ParseResult::Invalid => return cancel_handshake(stream).await,
                            ParseResult::Complete(request, used) => {
                                read_buf.advance(used);
                                match self.on_request(request) {
                                    RequestAction::Continue => {}
                                    RequestAction::AwaitUpgrade => upgrade_pending = true,
                                    RequestAction::Cancel => return cancel_handshake(stream).await,
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn serve_websocket(&mut self, mut ws: WebSocketStream<TcpStream>) -> tungstenite::Result<()> {
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(SocketCommand::Text(message)) => ws.send(Message::Text(message)).await?,
                    Some(SocketCommand::Close) | None => {
                        let _ = ws.close(None).await;
                        return Ok(());
                    }
                    Some(_) => {}
                },

                message = ws.next() => match message {
                    None => return Ok(()),
                    Some(message) => match message? {
                        Message::Text(text) => self.emit(SocketEvent::Frame(text.into_bytes())),
                        Message::Binary(data) => self.emit(SocketEvent::Frame(data)),
                        // The pong is queued by the crate; push it out now.
                        Message::Ping(_) => ws.flush().await?,
                        Message::Pong(_) | Message::Frame(_) => {}
                        Message::Close(_) => {
                            let _ = ws.flush().await;
                            return Ok(());
                        }
                    },
                },
            }
        }
    }

    fn on_request(&self, request: HttpRequest) -> RequestAction {
        if !request.is_get() || !(self.allow_any_host || http::is_allowed_host(&request.host)) {
            return RequestAction::Cancel;
        }

        let HttpRequest {
            path,
            host,
            upgrade,
            ws_key,
            ..
        } = request;

        if !upgrade {
            self.emit(SocketEvent::HttpGet { host, path });
            return RequestAction::Continue;
        }

        match ws_key {
            Some(ws_key) => {
                self.emit(SocketEvent::Upgrade { host, path, ws_key });
                RequestAction::AwaitUpgrade
            }
            None => RequestAction::Cancel,
        }
    }

    fn emit(&self, event: SocketEvent) {
        let _ = self.events.send(ServerEvent::Socket {
            session_id: self.session_id,
            event,
        });
    }
}

async fn cancel_handshake(stream: &mut TcpStream) -> io::Result<Handshake> {
    stream.write_all(http::HANDSHAKE_FAILED_RESPONSE).await?;
    let _ = stream.shutdown().await;
    Ok(Handshake::Closed)
}
