//! HTTP camouflage & tunnel layer
//!
//! Three disguises for the obfuscated stream, all wire-compatible with the
//! same server port:
//! - legacy: one fabricated request header, then raw bytes on the socket
//! - stream: a real HTTP tunnel (split session or one full-duplex POST)
//! - poll: split session with base64 line framing
//! plus auto (stream with a short leash, then poll).

mod client;
pub(crate) mod http1;
pub(crate) mod masker;
mod server;

pub use client::dial_tunnel;
pub use http1::BodyStream;
pub use masker::{build_mask_header, looks_like_http_request_start};
pub use server::{TunnelServer, WrapOutcome};
