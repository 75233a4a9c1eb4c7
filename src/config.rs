//! Protocol configuration
//!
//! One `ProtocolConfig` is built per adapter instance by the surrounding
//! options layer, validated once, and shared read-only by every connection.
//! The only mutation after that is the per-connection derived copy that
//! forces `disable_http_mask` after an HTTP-tunnel upgrade.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::crypto::{client_key_seed, AeadMethod};
use crate::error::{Error, Result};
use crate::table::Table;

/// HTTP camouflage mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskMode {
    /// Fake request header, then raw Sudoku bytes. Not CDN-compatible.
    #[default]
    Legacy,
    /// Real HTTP tunnel (split session preferred, stream-one fallback).
    Stream,
    /// Plain-text long-poll tunnel with base64 line framing.
    Poll,
    /// Try stream briefly, fall back to poll.
    Auto,
}

impl MaskMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "legacy" => Some(MaskMode::Legacy),
            "stream" => Some(MaskMode::Stream),
            "poll" => Some(MaskMode::Poll),
            "auto" => Some(MaskMode::Auto),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MaskMode::Legacy => "legacy",
            MaskMode::Stream => "stream",
            MaskMode::Poll => "poll",
            MaskMode::Auto => "auto",
        }
    }

    /// Whether the client dials through the HTTP tunnel instead of writing
    /// raw bytes on its own connection.
    pub fn uses_tunnel(&self) -> bool {
        !matches!(self, MaskMode::Legacy)
    }
}

/// Legacy-mode fake header shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskStrategy {
    /// Randomly POST- or WebSocket-shaped, from the template pool.
    #[default]
    Random,
    Post,
    WebSocket,
}

impl MaskStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "random" => Some(MaskStrategy::Random),
            "post" => Some(MaskStrategy::Post),
            "websocket" | "ws" => Some(MaskStrategy::WebSocket),
            _ => None,
        }
    }
}

/// Configuration for the Sudoku protocol stack.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Client-only: proxy server "host:port".
    #[serde(default)]
    pub server_address: String,

    /// Pre-shared key or x25519 key material; derives tables and AEAD keys.
    pub key: String,

    /// "aes-128-gcm", "chacha20-poly1305", or "none".
    #[serde(default = "default_aead_method")]
    pub aead_method: String,

    /// ASCII-preference for the byte layout: "", "prefer_entropy",
    /// "prefer_ascii" (or the short forms "entropy"/"ascii").
    #[serde(default)]
    pub ascii: String,

    /// Optional single custom layout pattern (8 symbols of x/p/v).
    #[serde(default)]
    pub custom_table: String,

    /// Optional rotation set of custom layout patterns. When two or more
    /// are given, the client picks one table per connection and the server
    /// probes blindly.
    #[serde(default)]
    pub custom_tables: Vec<String>,

    /// Padding insertion ratio bounds in percent (0-100, max >= min).
    #[serde(default = "default_padding_min")]
    pub padding_min: u8,
    #[serde(default = "default_padding_max")]
    pub padding_max: u8,

    /// true (default): downlink stays in hint encoding ("pure").
    /// false: downlink switches to the packed 6-bit encoding, which
    /// requires an authenticated AEAD method.
    #[serde(default = "default_true")]
    pub enable_pure_downlink: bool,

    /// Client-only: final relay target "host:port".
    #[serde(default)]
    pub target_address: String,

    /// Server-side handshake timeout in seconds; 0 means the 5 s default.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,

    /// Disables every HTTP camouflage layer.
    #[serde(default)]
    pub disable_http_mask: bool,

    /// "legacy" (default), "stream", "poll", or "auto".
    #[serde(default)]
    pub http_mask_mode: String,

    /// Legacy header shape: "random" (default), "post", "websocket".
    #[serde(default)]
    pub http_mask_strategy: String,

    /// HTTPS for the tunnel modes (client side).
    #[serde(default)]
    pub http_mask_tls: bool,

    /// Host header / SNI override for the tunnel modes (client side).
    #[serde(default)]
    pub http_mask_host: String,

    /// Candidate obfuscation tables. Built by [`build_tables`], never
    /// serialized.
    #[serde(skip)]
    pub tables: Vec<Arc<Table>>,
}

fn default_aead_method() -> String {
    "chacha20-poly1305".to_string()
}

fn default_padding_min() -> u8 {
    10
}

fn default_padding_max() -> u8 {
    30
}

fn default_true() -> bool {
    true
}

fn default_handshake_timeout() -> u64 {
    5
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            server_address: String::new(),
            key: String::new(),
            aead_method: default_aead_method(),
            ascii: String::new(),
            custom_table: String::new(),
            custom_tables: Vec::new(),
            padding_min: default_padding_min(),
            padding_max: default_padding_max(),
            enable_pure_downlink: true,
            target_address: String::new(),
            handshake_timeout: default_handshake_timeout(),
            disable_http_mask: false,
            http_mask_mode: String::new(),
            http_mask_strategy: String::new(),
            http_mask_tls: false,
            http_mask_host: String::new(),
            tables: Vec::new(),
        }
    }
}

impl std::fmt::Debug for ProtocolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolConfig")
            .field("server_address", &self.server_address)
            .field("aead_method", &self.aead_method)
            .field("ascii", &self.ascii)
            .field("padding", &(self.padding_min, self.padding_max))
            .field("enable_pure_downlink", &self.enable_pure_downlink)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("disable_http_mask", &self.disable_http_mask)
            .field("http_mask_mode", &self.http_mask_mode)
            .field("tables", &self.tables.len())
            .finish()
    }
}

impl ProtocolConfig {
    /// Field-level validation plus the at-least-one-table invariant.
    /// Everything here fails at construction, never at connection time.
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(Error::Config("key cannot be empty".into()));
        }

        let method = self.parsed_aead()?;

        if self.padding_min > 100 {
            return Err(Error::Config(format!(
                "padding_min must be between 0 and 100, got {}",
                self.padding_min
            )));
        }
        if self.padding_max > 100 {
            return Err(Error::Config(format!(
                "padding_max must be between 0 and 100, got {}",
                self.padding_max
            )));
        }
        if self.padding_max < self.padding_min {
            return Err(Error::Config(format!(
                "padding_max ({}) must be >= padding_min ({})",
                self.padding_max, self.padding_min
            )));
        }

        if !self.enable_pure_downlink && method == AeadMethod::None {
            return Err(Error::Config(
                "bandwidth optimized downlink requires AEAD".into(),
            ));
        }

        if MaskMode::parse(&self.http_mask_mode).is_none() {
            return Err(Error::Config(format!(
                "invalid http_mask_mode: {}, must be one of: legacy, stream, poll, auto",
                self.http_mask_mode
            )));
        }
        if MaskStrategy::parse(&self.http_mask_strategy).is_none() {
            return Err(Error::Config(format!(
                "invalid http_mask_strategy: {}, must be one of: random, post, websocket",
                self.http_mask_strategy
            )));
        }

        if self.tables.is_empty() {
            return Err(Error::Config(
                "no tables built (call build_tables first)".into(),
            ));
        }

        Ok(())
    }

    /// Client-side validation adds the dial and relay targets.
    pub fn validate_client(&self) -> Result<()> {
        self.validate()?;
        if self.server_address.is_empty() {
            return Err(Error::Config("server address cannot be empty".into()));
        }
        if self.target_address.is_empty() {
            return Err(Error::Config("target address cannot be empty".into()));
        }
        Ok(())
    }

    /// Build (or fetch cached) candidate tables from the key material.
    /// Clients fold private key material onto its public form first so both
    /// ends derive identical tables.
    pub fn build_tables(&mut self, client_side: bool) -> Result<()> {
        let secret = self.effective_key(client_side)?;
        let custom = if self.custom_table.trim().is_empty() {
            None
        } else {
            Some(self.custom_table.as_str())
        };
        self.tables = Table::build_set(&secret, &self.ascii, custom, &self.custom_tables)?;
        Ok(())
    }

    /// The secret actually used for tables, AEAD keys and the handshake tag.
    pub fn effective_key(&self, client_side: bool) -> Result<String> {
        if client_side {
            client_key_seed(&self.key)
        } else {
            Ok(self.key.clone())
        }
    }

    pub fn parsed_aead(&self) -> Result<AeadMethod> {
        AeadMethod::parse(&self.aead_method).ok_or_else(|| {
            Error::Config(format!(
                "invalid aead: {}, must be one of: aes-128-gcm, chacha20-poly1305, none",
                self.aead_method
            ))
        })
    }

    pub fn mask_mode(&self) -> MaskMode {
        MaskMode::parse(&self.http_mask_mode).unwrap_or_default()
    }

    pub fn mask_strategy(&self) -> MaskStrategy {
        MaskStrategy::parse(&self.http_mask_strategy).unwrap_or_default()
    }

    pub fn handshake_timeout(&self) -> std::time::Duration {
        let secs = if self.handshake_timeout == 0 {
            default_handshake_timeout()
        } else {
            self.handshake_timeout
        };
        std::time::Duration::from_secs(secs)
    }

    /// Per-connection derived copy for handshakes that already ride inside
    /// an HTTP tunnel: the camouflage header must not be written again.
    pub fn derived_without_mask(&self) -> Self {
        let mut derived = self.clone();
        derived.disable_http_mask = true;
        derived
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn built(mut cfg: ProtocolConfig) -> ProtocolConfig {
        cfg.build_tables(false).unwrap();
        cfg
    }

    fn base() -> ProtocolConfig {
        ProtocolConfig {
            key: "config test key".into(),
            ..ProtocolConfig::default()
        }
    }

    #[test]
    fn test_default_config_validates() {
        assert!(built(base()).validate().is_ok());
    }

    #[test]
    fn test_empty_key_rejected() {
        let mut cfg = ProtocolConfig::default();
        assert!(cfg.build_tables(false).is_ok()); // empty secret still builds
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_aead_rejected() {
        let mut cfg = base();
        cfg.aead_method = "zero".into();
        assert!(built(cfg).validate().is_err());
    }

    #[test]
    fn test_padding_bounds() {
        let mut cfg = base();
        cfg.padding_min = 101;
        assert!(built(cfg).validate().is_err());

        let mut cfg = base();
        cfg.padding_min = 40;
        cfg.padding_max = 20;
        assert!(built(cfg).validate().is_err());
    }

    #[test]
    fn test_packed_downlink_requires_aead() {
        let mut cfg = base();
        cfg.enable_pure_downlink = false;
        cfg.aead_method = "none".into();
        assert!(built(cfg).validate().is_err());

        let mut cfg = base();
        cfg.enable_pure_downlink = true;
        cfg.aead_method = "none".into();
        assert!(built(cfg).validate().is_ok());
    }

    #[test]
    fn test_mask_mode_strings() {
        for mode in ["", "legacy", "stream", "poll", "auto"] {
            let mut cfg = base();
            cfg.http_mask_mode = mode.into();
            assert!(built(cfg).validate().is_ok(), "mode {mode:?}");
        }
        let mut cfg = base();
        cfg.http_mask_mode = "h2-only".into();
        assert!(built(cfg).validate().is_err());
    }

    #[test]
    fn test_validate_client_needs_addresses() {
        let cfg = built(base());
        assert!(cfg.validate_client().is_err());

        let mut cfg = built(base());
        cfg.server_address = "127.0.0.1:443".into();
        cfg.target_address = "example.com:80".into();
        assert!(cfg.validate_client().is_ok());
    }

    #[test]
    fn test_rotation_builds_multiple_tables() {
        let mut cfg = base();
        cfg.custom_tables = vec!["xpxvvpvv".into(), "xxppvvvv".into()];
        cfg.build_tables(false).unwrap();
        assert_eq!(cfg.tables.len(), 2);
    }

    #[test]
    fn test_json_roundtrip_skips_tables() {
        let cfg = built(base());
        let json = serde_json::to_string(&cfg).unwrap();
        let parsed: ProtocolConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.key, cfg.key);
        assert!(parsed.tables.is_empty());
    }
}
