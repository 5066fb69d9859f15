//! Endpoints every VPN node serves so the collector can measure it:
//! `/ping` for latency probes and `/speedtest` for a fixed-size timed download.

use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::Bytes;
use once_cell::sync::OnceCell;

pub const DEFAULT_PAYLOAD_BYTES: usize = 1024 * 1024;

// Payload size, read once (NODESCORE_PROBE_PAYLOAD_BYTES overrides the 1 MiB default)
fn payload_len() -> usize {
    static LEN: OnceCell<usize> = OnceCell::new();
    *LEN.get_or_init(|| {
        std::env::var("NODESCORE_PROBE_PAYLOAD_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_PAYLOAD_BYTES)
    })
}

/// Deterministic, poorly compressible filler (xorshift), built once and shared.
pub fn payload() -> Bytes {
    static PAYLOAD: OnceCell<Bytes> = OnceCell::new();
    PAYLOAD
        .get_or_init(|| {
            let mut x: u32 = 0x9E37_79B9;
            let buf: Vec<u8> = (0..payload_len())
                .map(|_| {
                    x ^= x << 13;
                    x ^= x >> 17;
                    x ^= x << 5;
                    x as u8
                })
                .collect();
            Bytes::from(buf)
        })
        .clone()
}

pub fn router() -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/speedtest", get(speedtest))
}

async fn ping() -> &'static str {
    "pong"
}

async fn speedtest() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        payload(),
    )
}

/// Port from `--port N`, `-p N` or `--port=N`; falls back to `default_port`.
pub fn parse_port<I: IntoIterator<Item = String>>(args: I, default_port: u16) -> u16 {
    let mut it = args.into_iter();
    let _ = it.next(); // program name
    let mut long: Option<String> = None;
    let mut short: Option<String> = None;
    while let Some(a) = it.next() {
        match a.as_str() {
            "--port" => long = it.next(),
            "-p" => short = it.next(),
            _ if a.starts_with("--port=") => {
                if let Some((_, v)) = a.split_once('=') {
                    long = Some(v.to_string());
                }
            }
            _ => {}
        }
    }
    long.or(short)
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(default_port)
}
