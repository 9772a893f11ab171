//! DevTools inspector server.
//!
//! ```text
//!   accept loops ──Accepted──┐
//!                            ▼
//!   connection tasks ──▶ ServerEvent channel ──▶ InspectorSocketServer::run
//!        ▲                                        │
//!        └─────────── SocketCommand ──────────────┤
//!                                                 ▼
//!                                      SocketServerDelegate
//! ```
//!
//! Discovery is plain HTTP under `/json`; a WebSocket upgrade on
//! `/<target id>` attaches a session to a target.

mod discovery;
mod http;
mod options;
mod server;
mod socket;

pub use discovery::{format_host_port, format_ws_address};
pub use options::{InspectPublishUid, ServerOptions};
pub use server::{
    InspectorSocketServer, ServerHandle, ServerState, SessionId, SocketServerDelegate, local_socket_name,
};
