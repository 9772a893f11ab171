//! DevTools inspector socket server.
//!
//! The server owns every session and the delegate. Accept loops and
//! per-connection tasks only forward [`ServerEvent`]s into one channel, and
//! [`InspectorSocketServer::run`] applies them in order, so no session or
//! server state is ever touched from two places at once.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::discovery::{self, JsonMap, StatusCode};
use super::options::ServerOptions;
use super::socket::{Connection, SocketCommand, SocketEvent};
use crate::error::InspectorError;
use crate::jsvm_check;

pub type SessionId = u64;

/// Backlog used by node's `net` module.
const LISTEN_BACKLOG: u32 = 511;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// The embedder side of the inspector: targets and sessions.
pub trait SocketServerDelegate: Send + 'static {
    /// Called once from [`InspectorSocketServer::new`].
    fn assign_server(&mut self, server: ServerHandle);

    fn start_session(&mut self, session_id: SessionId, target_id: &str);

    fn end_session(&mut self, session_id: SessionId);

    fn message_received(&mut self, session_id: SessionId, message: &str);

    fn get_target_ids(&self) -> Vec<String>;

    fn get_target_title(&self, id: &str) -> String;

    fn get_target_url(&self, id: &str) -> String;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    New,
    Running,
    Stopped,
}

pub(crate) enum ServerEvent {
    Accepted { server_port: u16, stream: TcpStream },
    Socket { session_id: SessionId, event: SocketEvent },
    Send { session_id: SessionId, message: String },
    Stop,
    TerminateConnections,
}

/// Cloneable entry point into a running server loop.
#[derive(Clone)]
pub struct ServerHandle {
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl ServerHandle {
    /// Sends a protocol message to a session. Unknown sessions are ignored.
    pub fn send(&self, session_id: SessionId, message: impl Into<String>) {
        let _ = self.events.send(ServerEvent::Send {
            session_id,
            message: message.into(),
        });
    }

    pub fn stop(&self) {
        let _ = self.events.send(ServerEvent::Stop);
    }

    pub fn terminate_connections(&self) {
        let _ = self.events.send(ServerEvent::TerminateConnections);
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("closed", &self.events.is_closed())
            .finish()
    }
}

/// Name of the abstract unix socket local tooling probes for.
pub fn local_socket_name(port: u16, pid: u32) -> String {
    format!("jsvm_devtools_remote_{}_{}", port, pid)
}

struct SocketSession {
    server_port: u16,
    /// Local address of the accepted socket, used when `Host` is empty.
    local_host: String,
    /// Set once the upgrade to a known target was accepted.
    target_id: Option<String>,
    socket: mpsc::UnboundedSender<SocketCommand>,
}

impl SocketSession {
    fn command(&self, command: SocketCommand) {
        let _ = self.socket.send(command);
    }

    fn is_attached(&self) -> bool {
        self.target_id.is_some()
    }
}

/// One listening address plus its optional local discovery socket.
struct ServerSocket {
    port: u16,
    accept_task: JoinHandle<()>,
    local_task: Option<JoinHandle<()>>,
}

impl ServerSocket {
    fn listen(
        addr: SocketAddr,
        pid: Option<u32>,
        events: mpsc::UnboundedSender<ServerEvent>,
    ) -> io::Result<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(LISTEN_BACKLOG)?;

        // Port 0 binds an ephemeral port; report the real one.
        let port = listener.local_addr()?.port();
        let local_task = pid.and_then(|pid| listen_local(port, pid));
        let accept_task = tokio::spawn(accept_loop(listener, port, events));

        Ok(Self {
            port,
            accept_task,
            local_task,
        })
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        self.accept_task.abort();
        if let Some(task) = self.local_task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, port: u16, events: mpsc::UnboundedSender<ServerEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, port, "debugger connection");
                let accepted = ServerEvent::Accepted {
                    server_port: port,
                    stream,
                };
                if events.send(accepted).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(port, "accept failed: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Binds `\0jsvm_devtools_remote_<port>_<pid>`. Its existence is the whole
/// protocol, so accepted connections are dropped.
#[cfg(target_os = "linux")]
fn listen_local(port: u16, pid: u32) -> Option<JoinHandle<()>> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr as UnixAddr, UnixListener as StdUnixListener};

    let name = local_socket_name(port, pid);
    let bind = || -> io::Result<tokio::net::UnixListener> {
        let addr = UnixAddr::from_abstract_name(name.as_bytes())?;
        let listener = StdUnixListener::bind_addr(&addr)?;
        listener.set_nonblocking(true)?;
        tokio::net::UnixListener::from_std(listener)
    };

    match bind() {
        Ok(listener) => Some(tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        })),
        Err(e) => {
            tracing::debug!("local discovery socket {} unavailable: {}", name, e);
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn listen_local(_port: u16, _pid: u32) -> Option<JoinHandle<()>> {
    None
}

/// Writes a console notice. Failures to write are ignored.
fn write_notice(out: &mut Option<Box<dyn Write + Send>>, notice: fmt::Arguments<'_>) {
    if let Some(out) = out.as_mut() {
        let _ = writeln!(out, "{}", notice);
        let _ = out.flush();
    }
}

pub struct InspectorSocketServer {
    delegate: Option<Box<dyn SocketServerDelegate>>,
    host: String,
    port: u16,
    options: ServerOptions,
    out: Option<Box<dyn Write + Send>>,
    state: ServerState,
    next_session_id: SessionId,
    sessions: BTreeMap<SessionId, SocketSession>,
    server_sockets: Vec<ServerSocket>,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    events_rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl InspectorSocketServer {
    /// Creates a server in the `New` state and hands the delegate its handle.
    ///
    /// Console notices go to `out` (typically stderr); `None` silences them.
    pub fn new(
        mut delegate: Box<dyn SocketServerDelegate>,
        host: impl Into<String>,
        port: u16,
        options: ServerOptions,
        out: Option<Box<dyn Write + Send>>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        delegate.assign_server(ServerHandle {
            events: events_tx.clone(),
        });

        Self {
            delegate: Some(delegate),
            host: host.into(),
            port,
            options,
            out,
            state: ServerState::New,
            next_session_id: 0,
            sessions: BTreeMap::new(),
            server_sockets: Vec::new(),
            events_tx,
            events_rx,
        }
    }

    /// Resolves the host and listens on every address it maps to.
    ///
    /// Succeeds if at least one address was bound. Must be called from
    /// within a tokio runtime.
    pub async fn start(&mut self) -> Result<(), InspectorError> {
        jsvm_check!(self.delegate.is_some(), "inspector server started without a delegate");
        if self.state != ServerState::New {
            return Err(InspectorError::AlreadyStarted);
        }

        let addrs: Vec<SocketAddr> = match tokio::net::lookup_host((self.host.as_str(), self.port)).await {
            Ok(addrs) => addrs.collect(),
            Err(source) => {
                write_notice(
                    &mut self.out,
                    format_args!("Unable to resolve \"{}\": {}", self.host, source),
                );
                return Err(InspectorError::Resolve {
                    host: self.host.clone(),
                    source,
                });
            }
        };

        self.listen_all(addrs)?;

        self.state = ServerState::Running;
        self.print_ready_message("listening");
        Ok(())
    }

    /// Listens on every address. Fails only if none could be bound, with
    /// the last error.
    fn listen_all(&mut self, addrs: Vec<SocketAddr>) -> Result<(), InspectorError> {
        let mut last_error = None;
        for addr in addrs {
            match ServerSocket::listen(addr, self.options.pid, self.events_tx.clone()) {
                Ok(socket) => {
                    tracing::info!(%addr, port = socket.port, "inspector listening");
                    self.server_sockets.push(socket);
                }
                Err(e) => {
                    tracing::debug!(%addr, "inspector bind failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        // Only the last failure is reported, and only if nothing was bound.
        if self.server_sockets.is_empty() {
            let source = last_error.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses to bind")
            });
            tracing::error!(host = %self.host, port = self.port, "inspector failed to start: {}", source);
            write_notice(
                &mut self.out,
                format_args!("Starting inspector on {}:{} failed: {}", self.host, self.port, source),
            );
            return Err(InspectorError::Bind {
                host: self.host.clone(),
                port: self.port,
                source,
            });
        }

        Ok(())
    }

    /// Closes the listening sockets. Connected sessions stay open.
    pub fn stop(&mut self) {
        if self.state == ServerState::Stopped {
            return;
        }
        jsvm_check!(
            self.state == ServerState::Running,
            "inspector server stopped before it was started"
        );

        self.state = ServerState::Stopped;
        self.server_sockets.clear();
        if self.done() {
            self.release_delegate();
        }
    }

    /// Closes every session.
    pub fn terminate_connections(&mut self) {
        for session in self.sessions.values() {
            session.command(SocketCommand::Close);
        }
    }

    pub fn send(&mut self, session_id: SessionId, message: &str) {
        if let Some(session) = self.sessions.get(&session_id) {
            session.command(SocketCommand::Text(message.to_string()));
        }
    }

    /// Processes events until the server is stopped and every session has
    /// drained. Returns immediately if the server never started.
    pub async fn run(&mut self) {
        while !self.finished() {
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            self.handle_event(event);
        }
    }

    /// Port of the first listening socket, or the configured port.
    pub fn port(&self) -> u16 {
        self.server_sockets.first().map_or(self.port, |socket| socket.port)
    }

    pub fn ports(&self) -> Vec<u16> {
        self.server_sockets.iter().map(|socket| socket.port).collect()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            events: self.events_tx.clone(),
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// `false` once the delegate has been released after shutdown.
    pub fn has_delegate(&self) -> bool {
        self.delegate.is_some()
    }

    fn finished(&self) -> bool {
        self.state != ServerState::Running && self.sessions.is_empty()
    }

    fn done(&self) -> bool {
        self.server_sockets.is_empty() && self.sessions.is_empty()
    }

    fn release_delegate(&mut self) {
        if self.delegate.take().is_some() {
            tracing::debug!("inspector delegate released");
        }
    }

    fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Accepted { server_port, stream } => self.accept(server_port, stream),

            ServerEvent::Socket { session_id, event } => match event {
                SocketEvent::HttpGet { host, path } => {
                    if !self.handle_get_request(session_id, &host, &path) {
                        self.command(session_id, SocketCommand::CancelHandshake);
                    }
                }
                SocketEvent::Upgrade { path, ws_key, .. } => {
                    let target_id = path.get(1..).unwrap_or_default();
                    self.session_started(session_id, target_id, ws_key);
                }
                SocketEvent::Frame(data) => self.message_received(session_id, &data),
                SocketEvent::Closed => self.session_terminated(session_id),
            },

            ServerEvent::Send { session_id, message } => self.send(session_id, &message),
            ServerEvent::Stop => self.stop(),
            ServerEvent::TerminateConnections => self.terminate_connections(),
        }
    }

    fn accept(&mut self, server_port: u16, stream: TcpStream) {
        // Connections queued before the listener closed.
        if self.state != ServerState::Running {
            return;
        }

        let session_id = self.next_session_id;
        self.next_session_id += 1;

        let local_host = stream
            .local_addr()
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default();
        let socket = Connection::spawn(
            session_id,
            stream,
            self.options.allow_any_host,
            self.events_tx.clone(),
        );

        tracing::debug!(session = session_id, server_port, "session accepted");
        self.sessions.insert(
            session_id,
            SocketSession {
                server_port,
                local_host,
                target_id: None,
                socket,
            },
        );
    }

    fn command(&self, session_id: SessionId, command: SocketCommand) {
        if let Some(session) = self.sessions.get(&session_id) {
            session.command(command);
        }
    }

    fn target_exists(&self, target_id: &str) -> bool {
        self.delegate
            .as_ref()
            .is_some_and(|delegate| delegate.get_target_ids().iter().any(|id| id == target_id))
    }

    fn session_started(&mut self, session_id: SessionId, target_id: &str, ws_key: String) {
        let exists = self.target_exists(target_id);
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return;
        };

        if !exists {
            tracing::debug!(session = session_id, target_id, "upgrade to unknown target declined");
            session.command(SocketCommand::CancelHandshake);
            return;
        }

        session.target_id = Some(target_id.to_string());
        session.command(SocketCommand::AcceptUpgrade(ws_key));
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.start_session(session_id, target_id);
        }
    }

    fn message_received(&mut self, session_id: SessionId, data: &[u8]) {
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.message_received(session_id, &String::from_utf8_lossy(data));
        }
    }

    fn session_terminated(&mut self, session_id: SessionId) {
        let Some(session) = self.sessions.remove(&session_id) else {
            return;
        };

        let was_attached = session.is_attached();
        if was_attached {
            if let Some(delegate) = self.delegate.as_mut() {
                delegate.end_session(session_id);
            }
        }
        tracing::debug!(session = session_id, was_attached, "session terminated");

        if self.sessions.is_empty() {
            if was_attached && self.state == ServerState::Running && !self.server_sockets.is_empty() {
                self.print_ready_message("ending");
            }
            if self.state == ServerState::Stopped {
                self.release_delegate();
            }
        }
    }

    /// Serves `/json*`. Returns `false` when the path is not a discovery
    /// endpoint and the handshake should be cancelled.
    fn handle_get_request(&self, session_id: SessionId, host: &str, path: &str) -> bool {
        let Some(session) = self.sessions.get(&session_id) else {
            return true;
        };

        if !self.options.publish_uid.http {
            Self::respond(session, "", StatusCode::NotFound);
            return true;
        }

        let Some(command) = discovery::match_path_segment(path, "/json") else {
            return false;
        };

        if command.is_empty() || discovery::match_path_segment(command, "list").is_some() {
            let body = self.list_response(host, session);
            Self::respond(session, &body, StatusCode::Ok);
        } else if discovery::match_path_segment(command, "protocol").is_some() {
            match discovery::protocol_json() {
                Ok(json) => Self::respond(session, &json, StatusCode::Ok),
                Err(e) => {
                    tracing::error!("embedded protocol description is corrupt: {}", e);
                    return false;
                }
            }
        } else if discovery::match_path_segment(command, "version").is_some() {
            Self::respond(session, &discovery::version_body(), StatusCode::Ok);
        } else {
            return false;
        }
        true
    }

    fn list_response(&self, host: &str, session: &SocketSession) -> String {
        let Some(delegate) = self.delegate.as_ref() else {
            return discovery::maps_to_string(&[]);
        };

        let detected_host = if host.is_empty() {
            discovery::format_host_port(&session.local_host, session.server_port)
        } else {
            host.to_string()
        };

        let targets: Vec<JsonMap> = delegate
            .get_target_ids()
            .into_iter()
            .map(|id| {
                let address = discovery::format_address(&detected_host, &id, false);

                let mut target = JsonMap::new();
                target.insert("description", "jsvm instance".to_string());
                target.insert("title", discovery::escape(&delegate.get_target_title(&id)));
                target.insert("type", "node".to_string());
                // Best effort, not guaranteed to resolve.
                target.insert("url", discovery::escape(&delegate.get_target_url(&id)));
                target.insert("devtoolsFrontendUrl", discovery::frontend_url(false, &address));
                // For Chrome before 66.0.3345.0.
                target.insert("devtoolsFrontendUrlCompat", discovery::frontend_url(true, &address));
                target.insert(
                    "webSocketDebuggerUrl",
                    discovery::format_address(&detected_host, &id, true),
                );
                target.insert("id", id);
                target
            })
            .collect();

        discovery::maps_to_string(&targets)
    }

    fn respond(session: &SocketSession, body: &str, code: StatusCode) {
        let response = discovery::http_response(body, code);
        session.command(SocketCommand::Http(Bytes::from(response)));
    }

    fn print_ready_message(&mut self, verb: &str) {
        if !self.options.publish_uid.console {
            return;
        }
        let Some(out) = self.out.as_mut() else {
            return;
        };
        let ids = self
            .delegate
            .as_ref()
            .map(|delegate| delegate.get_target_ids())
            .unwrap_or_default();

        for socket in &self.server_sockets {
            for id in &ids {
                let address = discovery::format_ws_address(&self.host, socket.port, id, true);
                if writeln!(out, "Debugger {} on {}", verb, address).is_err() {
                    return;
                }
            }
        }
        if writeln!(out, "For help, see: {}", discovery::HELP_URL).is_err() {
            return;
        }
        let _ = out.flush();
    }
}

impl fmt::Debug for InspectorSocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InspectorSocketServer")
            .field("host", &self.host)
            .field("port", &self.port())
            .field("state", &self.state)
            .field("sessions", &self.sessions.len())
            .field("has_delegate", &self.delegate.is_some())
            .finish()
    }
}
