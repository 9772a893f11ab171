#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jsvm_runtime::inspector::{
    InspectorSocketServer, ServerHandle, ServerOptions, SessionId, SocketServerDelegate,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

pub const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DelegateCall {
    Start(SessionId, String),
    End(SessionId),
    Message(SessionId, String),
}

#[derive(Clone, Debug)]
pub struct Target {
    pub id: String,
    pub title: String,
    pub url: String,
}

impl Target {
    pub fn new(id: &str, title: &str, url: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            url: url.to_string(),
        }
    }
}

/// Shared view of everything the delegate saw.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<DelegateCall>>>,
    released: Arc<AtomicBool>,
}

impl Recorder {
    pub fn calls(&self) -> Vec<DelegateCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub async fn wait_for(&self, call: DelegateCall) {
        let recorder = self.clone();
        wait_until(move || recorder.calls().contains(&call)).await;
    }
}

/// Delegate that records calls and echoes every message back.
pub struct TestDelegate {
    targets: Vec<Target>,
    recorder: Recorder,
    server: Option<ServerHandle>,
}

impl TestDelegate {
    pub fn new(targets: Vec<Target>, recorder: Recorder) -> Self {
        Self {
            targets,
            recorder,
            server: None,
        }
    }

    fn record(&self, call: DelegateCall) {
        self.recorder.calls.lock().unwrap().push(call);
    }
}

impl SocketServerDelegate for TestDelegate {
    fn assign_server(&mut self, server: ServerHandle) {
        self.server = Some(server);
    }

    fn start_session(&mut self, session_id: SessionId, target_id: &str) {
        self.record(DelegateCall::Start(session_id, target_id.to_string()));
    }

    fn end_session(&mut self, session_id: SessionId) {
        self.record(DelegateCall::End(session_id));
    }

    fn message_received(&mut self, session_id: SessionId, message: &str) {
        self.record(DelegateCall::Message(session_id, message.to_string()));
        if let Some(server) = &self.server {
            server.send(session_id, format!("echo:{}", message));
        }
    }

    fn get_target_ids(&self) -> Vec<String> {
        self.targets.iter().map(|t| t.id.clone()).collect()
    }

    fn get_target_title(&self, id: &str) -> String {
        self.targets
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.title.clone())
            .unwrap_or_default()
    }

    fn get_target_url(&self, id: &str) -> String {
        self.targets
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.url.clone())
            .unwrap_or_default()
    }
}

impl Drop for TestDelegate {
    fn drop(&mut self) {
        self.recorder.released.store(true, Ordering::SeqCst);
    }
}

/// `Write` sink the test can read back.
#[derive(Clone, Default)]
pub struct SharedOutput(Arc<Mutex<Vec<u8>>>);

impl SharedOutput {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct TestServer {
    pub port: u16,
    pub handle: ServerHandle,
    pub recorder: Recorder,
    pub output: SharedOutput,
    pub task: JoinHandle<InspectorSocketServer>,
}

/// Starts a server on an ephemeral loopback port and runs it in a task.
pub async fn start_server(targets: Vec<Target>, options: ServerOptions) -> TestServer {
    let recorder = Recorder::default();
    let output = SharedOutput::default();
    let delegate = TestDelegate::new(targets, recorder.clone());

    let mut server = InspectorSocketServer::new(
        Box::new(delegate),
        "127.0.0.1",
        0,
        options,
        Some(Box::new(output.clone())),
    );
    server.start().await.unwrap();

    let port = server.port();
    let handle = server.handle();
    let task = tokio::spawn(async move {
        server.run().await;
        server
    });

    TestServer {
        port,
        handle,
        recorder,
        output,
        task,
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub struct HttpResponse {
    pub status_line: String,
    pub head: String,
    pub body: String,
}

pub async fn connect(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port)).await.unwrap()
}

/// Sends a GET with an optional `Host` header and reads one response.
pub async fn http_get(port: u16, path: &str, host: Option<&str>) -> HttpResponse {
    let mut stream = connect(port).await;
    let mut request = format!("GET {} HTTP/1.1\r\n", path);
    if let Some(host) = host {
        request.push_str(&format!("Host: {}\r\n", host));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    read_http_response(&mut stream).await
}

/// Reads a response head, then `Content-Length` bytes or until EOF.
pub async fn read_http_response(stream: &mut TcpStream) -> HttpResponse {
    let mut buf = Vec::new();
    let head_end = tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                return end + 4;
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before the response head");
            buf.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .expect("response head timed out");

    let head = String::from_utf8(buf[..head_end].to_vec()).unwrap();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("Content-Length: "))
        .map(|len| len.trim().parse::<usize>().unwrap());

    let mut body = buf[head_end..].to_vec();
    tokio::time::timeout(TIMEOUT, async {
        match content_length {
            Some(len) => {
                while body.len() < len {
                    let mut chunk = [0u8; 4096];
                    let n = stream.read(&mut chunk).await.unwrap();
                    assert!(n > 0, "connection closed inside the body");
                    body.extend_from_slice(&chunk[..n]);
                }
            }
            None => {
                stream.read_to_end(&mut body).await.unwrap();
            }
        }
    })
    .await
    .expect("response body timed out");

    HttpResponse {
        status_line: head.lines().next().unwrap_or_default().to_string(),
        head,
        body: String::from_utf8(body).unwrap(),
    }
}

pub const WS_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
pub const WS_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

/// Sends an upgrade request for `path` and reads the handshake reply.
pub async fn ws_upgrade(port: u16, path: &str) -> (TcpStream, HttpResponse) {
    let mut stream = connect(port).await;
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
        path, port, WS_KEY
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let response = read_upgrade_response(&mut stream).await;
    (stream, response)
}

async fn read_upgrade_response(stream: &mut TcpStream) -> HttpResponse {
    let mut head = Vec::new();
    tokio::time::timeout(TIMEOUT, async {
        while !head.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            if stream.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            head.push(byte[0]);
        }
    })
    .await
    .expect("handshake timed out");

    let head = String::from_utf8(head).unwrap();
    let mut body = Vec::new();
    if !head.starts_with("HTTP/1.1 101") {
        let _ = tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut body)).await;
    }
    HttpResponse {
        status_line: head.lines().next().unwrap_or_default().to_string(),
        head,
        body: String::from_utf8_lossy(&body).into_owned(),
    }
}

pub fn client_frame(opcode: u8, payload: &[u8], masked: bool) -> Vec<u8> {
    let mask = [0xA1, 0xB2, 0xC3, 0xD4];
    let mut frame = vec![0x80 | opcode];
    let mask_bit = if masked { 0x80 } else { 0 };
    match payload.len() {
        len if len < 126 => frame.push(mask_bit | len as u8),
        len => {
            frame.push(mask_bit | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
    }
    if masked {
        frame.extend_from_slice(&mask);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    } else {
        frame.extend_from_slice(payload);
    }
    frame
}

pub async fn send_text(stream: &mut TcpStream, text: &str) {
    stream.write_all(&client_frame(0x1, text.as_bytes(), true)).await.unwrap();
}

/// Reads one unmasked server frame: `(opcode, payload)`, or `None` on EOF.
pub async fn read_frame(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    tokio::time::timeout(TIMEOUT, async {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await.ok()?;
        assert_eq!(header[1] & 0x80, 0, "server frames are never masked");

        let len = match header[1] & 0x7F {
            126 => stream.read_u16().await.ok()? as usize,
            127 => stream.read_u64().await.ok()? as usize,
            n => n as usize,
        };
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.ok()?;
        Some((header[0] & 0x0F, payload))
    })
    .await
    .expect("frame read timed out")
}

/// Reads until the peer closes. Returns everything received.
pub async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut rest = Vec::new();
    tokio::time::timeout(TIMEOUT, stream.read_to_end(&mut rest))
        .await
        .expect("connection was not closed")
        .unwrap_or_default();
    rest
}
