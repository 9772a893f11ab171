//! Request-head parsing and the handshake responses.
//!
//! Parsing is done by `httparse`; the upgrade itself is decided by the
//! server loop, so only the fields it needs are extracted here.

use std::net::IpAddr;

use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

/// Requests whose head exceeds this are rejected.
pub(crate) const MAX_REQUEST_HEAD: usize = 16 * 1024;

const MAX_HEADERS: usize = 64;

pub(crate) const HANDSHAKE_FAILED_RESPONSE: &[u8] = b"HTTP/1.0 400 Bad Request\r\n\
Content-Type: text/html; charset=UTF-8\r\n\r\n\
WebSockets request was expected\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HttpRequest {
    pub method: String,
    pub path: String,
    pub host: String,
    /// `Upgrade: websocket` was requested.
    pub upgrade: bool,
    pub ws_key: Option<String>,
}

impl HttpRequest {
    #[inline]
    pub fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ParseResult {
    /// Need more bytes.
    Incomplete,
    /// A request and the number of bytes it consumed.
    Complete(HttpRequest, usize),
    Invalid,
}

pub(crate) fn parse_request(buf: &[u8]) -> ParseResult {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    let used = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(used)) => used,
        Ok(httparse::Status::Partial) if buf.len() > MAX_REQUEST_HEAD => return ParseResult::Invalid,
        Ok(httparse::Status::Partial) => return ParseResult::Incomplete,
        Err(_) => return ParseResult::Invalid,
    };
    let (Some(method), Some(path)) = (parsed.method, parsed.path) else {
        return ParseResult::Invalid;
    };

    let mut request = HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        host: String::new(),
        upgrade: false,
        ws_key: None,
    };

    for header in parsed.headers.iter() {
        let value = String::from_utf8_lossy(header.value);
        let value = value.trim();
        if header.name.eq_ignore_ascii_case("host") {
            request.host = value.to_string();
        } else if header.name.eq_ignore_ascii_case("upgrade") {
            request.upgrade = value.eq_ignore_ascii_case("websocket");
        } else if header.name.eq_ignore_ascii_case("sec-websocket-key") {
            request.ws_key = Some(value.to_string());
        }
    }

    ParseResult::Complete(request, used)
}

/// `Host` values allowed without `allow_any_host`: empty, IP literals and localhost.
pub(crate) fn is_allowed_host(host_with_port: &str) -> bool {
    let host = trim_port(host_with_port);
    host.is_empty() || is_ip_address(host) || host.eq_ignore_ascii_case("localhost")
}

fn trim_port(host: &str) -> &str {
    let Some(colon) = host.rfind(':') else {
        return host;
    };
    match host.rfind(']') {
        Some(bracket) if bracket > colon => host,
        _ => &host[..colon],
    }
}

fn is_ip_address(host: &str) -> bool {
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.parse::<IpAddr>().is_ok()
}

/// `Sec-WebSocket-Accept` for a client key.
pub(crate) fn ws_accept_key(key: &str) -> String {
    derive_accept_key(key.as_bytes())
}

pub(crate) fn accept_upgrade_response(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        ws_accept_key(key)
    )
}
