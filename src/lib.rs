//! Sudokium - Sudoku-grid steganographic proxy transport
//!
//! # Architecture (Layered Stack)
//!
//! ```text
//! Raw TCP (or HTTP tunnel: legacy header / stream / poll)
//! → Obfuscated Codec (puzzle hints uplink, hint or packed downlink)
//! → AEAD Framing (aes-128-gcm / chacha20-poly1305 / none)
//! → Handshake (timestamp block, blind table probe, mode byte)
//! → Session (TCP relay target, or UDP-over-TCP datagrams)
//! ```
//!
//! ## Core Principles
//!
//! - Each layer does ONE thing and wraps a plain duplex `Stream`
//! - Codecs are pure state machines; the async adapters only pump bytes
//! - The server never consumes probe bytes without replaying them
//! - All randomness that shapes the wire is seeded per connection from a
//!   secure source
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Stream, Address, Dialer primitives
//! ├── table/           # 288 grids, byte layouts, obfuscation tables
//! ├── obfs/            # hint + packed codecs and the stream adapter
//! ├── crypto/          # AEAD ciphers, frame layer, key material
//! ├── handshake/       # client/server handshake, table probe
//! ├── httpmask/        # camouflage header + HTTP tunnel modes
//! └── uot.rs           # UDP-over-TCP framing
//! ```

// Core types
pub mod common;
pub mod error;

// Transport stack
pub mod config;
pub mod crypto;
pub mod handshake;
pub mod httpmask;
pub mod obfs;
pub mod table;
pub mod uot;

// Re-exports for convenience
pub use common::{Address, Dialer, Stream, TcpDialer};
pub use config::{MaskMode, MaskStrategy, ProtocolConfig};
pub use crypto::{client_key_seed, gen_key_pair};
pub use error::{Error, Result};
pub use handshake::{
    client_handshake, dial, dial_uot, server_handshake, ServerSession, SessionKind,
};
pub use httpmask::{TunnelServer, WrapOutcome};
pub use table::Table;
pub use uot::UotSocket;
