use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use flate2::Compression;
use flate2::write::ZlibEncoder;

const PROTOCOL_JSON_PATH: &str = "resources/inspector_protocol.json";

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed={}", PROTOCOL_JSON_PATH);

    let json = fs::read(PROTOCOL_JSON_PATH).expect("read protocol description");
    assert!(json.len() < 1 << 24, "protocol description must fit a 24-bit size");

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(&json).expect("compress protocol description");
    let compressed = encoder.finish().expect("compress protocol description");

    // 3-byte big-endian uncompressed size, then the zlib stream.
    let size = json.len() as u32;
    let mut out = Vec::with_capacity(compressed.len() + 3);
    out.extend_from_slice(&size.to_be_bytes()[1..]);
    out.extend_from_slice(&compressed);

    let path = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR")).join("inspector_protocol.bin");
    fs::write(&path, out).expect("write compressed protocol description");
}
