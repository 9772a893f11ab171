//! DevTools discovery documents served under `/json`.
//!
//! The JSON here is emitted by hand to keep the exact layout DevTools
//! frontends and existing tooling scrape: sorted keys, two-space indent,
//! and user strings sanitized with [`escape`] rather than JSON-escaped.

use std::collections::BTreeMap;
use std::io::Read;

use flate2::read::ZlibDecoder;

/// `[size: u24 BE][zlib stream]`, produced by `build.rs`.
static PROTOCOL_JSON: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/inspector_protocol.bin"));

pub(crate) const HELP_URL: &str = "https://nodejs.org/en/docs/inspector";

pub(crate) type JsonMap = BTreeMap<&'static str, String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StatusCode {
    Ok = 200,
    NotFound = 404,
}

/// `host:port`, bracketing IPv6 literals.
pub fn format_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Replaces `"` and `\` with `_`.
pub(crate) fn escape(s: &str) -> String {
    s.chars()
        .map(|c| if c == '"' || c == '\\' { '_' } else { c })
        .collect()
}

pub(crate) fn format_address(host: &str, target_id: &str, include_protocol: bool) -> String {
    if include_protocol {
        format!("ws://{}/{}", host, target_id)
    } else {
        format!("{}/{}", host, target_id)
    }
}

/// `ws://host:port/target`.
pub fn format_ws_address(host: &str, port: u16, target_id: &str, include_protocol: bool) -> String {
    format_address(&format_host_port(host, port), target_id, include_protocol)
}

pub(crate) fn frontend_url(compat: bool, formatted_address: &str) -> String {
    format!(
        "devtools://devtools/bundled/{}.html?v8only=true&ws={}",
        if compat { "inspector" } else { "js_app" },
        formatted_address
    )
}

pub(crate) fn map_to_string(object: &JsonMap) -> String {
    let fields: Vec<String> = object
        .iter()
        .map(|(name, value)| format!("  \"{}\": \"{}\"", name, value))
        .collect();
    format!("{{\n{}\n}} ", fields.join(",\n"))
}

pub(crate) fn maps_to_string(array: &[JsonMap]) -> String {
    let objects: Vec<String> = array.iter().map(map_to_string).collect();
    format!("[ {}]\n\n", objects.join(", "))
}

/// Case-insensitive prefix match of one path segment.
///
/// Returns the remainder after `expected` and its trailing `/`, or `None`
/// when the segment differs.
pub(crate) fn match_path_segment<'a>(path: &'a str, expected: &str) -> Option<&'a str> {
    let len = expected.len();
    let head = path.get(..len)?;
    if !head.eq_ignore_ascii_case(expected) {
        return None;
    }
    match path.as_bytes().get(len) {
        None => Some(""),
        Some(b'/') => Some(&path[len + 1..]),
        Some(_) => None,
    }
}

/// Header plus body of a discovery response.
pub(crate) fn http_response(body: &str, code: StatusCode) -> String {
    format!(
        "HTTP/1.0 {} OK\r\n\
         Content-Type: application/json; charset=UTF-8\r\n\
         Cache-Control: no-cache\r\n\
         Content-Length: {}\r\n\r\n{}",
        code as u16,
        body.len(),
        body
    )
}

pub(crate) fn version_body() -> String {
    let mut response = JsonMap::new();
    response.insert("Protocol-Version", "1.1".to_string());
    response.insert("Browser", format!("jsvm/{}", crate::platform::version()));
    map_to_string(&response)
}

/// Inflates the embedded protocol description.
pub(crate) fn protocol_json() -> std::io::Result<String> {
    let invalid = |msg: &str| std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string());

    let (size, compressed) = match PROTOCOL_JSON {
        [a, b, c, rest @ ..] => ((*a as usize) << 16 | (*b as usize) << 8 | *c as usize, rest),
        _ => return Err(invalid("protocol description is truncated")),
    };

    let mut json = String::with_capacity(size);
    ZlibDecoder::new(compressed).read_to_string(&mut json)?;
    if json.len() != size {
        return Err(invalid("protocol description size mismatch"));
    }
    Ok(json)
}
