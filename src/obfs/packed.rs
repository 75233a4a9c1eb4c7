//! Packed-mode codec (bandwidth-optimized downlink)
//!
//! Plaintext is split into 6-bit groups (3 bytes -> 4 groups) and each
//! group is serialized as a single wire byte through the layout. A partial
//! trailing group is closed with the layout's pad marker, which also resets
//! the decoder's bit accumulator and therefore doubles as a
//! resynchronization signal.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{Error, Result};
use crate::table::Table;

use super::hint::draw_padding_rate;

/// Encodes plaintext into packed 6-bit group bytes.
pub struct PackedEncoder {
    table: Arc<Table>,
    rng: StdRng,
    padding_rate: f32,
    pad_marker: u8,
    pad_pool: Vec<u8>,
}

impl PackedEncoder {
    /// `rng` must be freshly seeded from a secure source per connection.
    pub fn new(table: Arc<Table>, mut rng: StdRng, padding_min: u8, padding_max: u8) -> Self {
        let padding_rate = draw_padding_rate(&mut rng, padding_min, padding_max);
        let pad_marker = table.layout().pad_marker();
        // The marker must stay out of the random pool: it is a control byte.
        let mut pad_pool: Vec<u8> = table
            .padding_pool()
            .iter()
            .copied()
            .filter(|&b| b != pad_marker)
            .collect();
        if pad_pool.is_empty() {
            pad_pool.push(pad_marker);
        }
        Self {
            table,
            rng,
            padding_rate,
            pad_marker,
            pad_pool,
        }
    }

    fn maybe_pad(&mut self, out: &mut Vec<u8>) {
        if self.rng.gen::<f32>() < self.padding_rate {
            out.push(self.pad_pool[self.rng.gen_range(0..self.pad_pool.len())]);
        }
    }

    fn push_group(&mut self, group: u8, out: &mut Vec<u8>) {
        self.maybe_pad(out);
        out.push(self.table.layout().encode_group(group & 0x3F));
    }

    /// Encode one write's worth of plaintext. Each call is self-contained:
    /// a partial trailing group is closed with the pad marker.
    pub fn encode(&mut self, data: &[u8], out: &mut Vec<u8>) {
        out.reserve(data.len() * 3 / 2 + 8);

        let mut chunks = data.chunks_exact(3);
        for chunk in &mut chunks {
            let (b1, b2, b3) = (chunk[0], chunk[1], chunk[2]);
            self.push_group((b1 >> 2) & 0x3F, out);
            self.push_group(((b1 & 0x03) << 4) | ((b2 >> 4) & 0x0F), out);
            self.push_group(((b2 & 0x0F) << 2) | ((b3 >> 6) & 0x03), out);
            self.push_group(b3 & 0x3F, out);
        }

        let tail = chunks.remainder();
        if !tail.is_empty() {
            let mut bit_buf: u32 = 0;
            let mut bit_count: u32 = 0;
            for &b in tail {
                bit_buf = (bit_buf << 8) | u32::from(b);
                bit_count += 8;
                while bit_count >= 6 {
                    bit_count -= 6;
                    self.push_group((bit_buf >> bit_count) as u8, out);
                    bit_buf &= (1 << bit_count) - 1;
                }
            }
            if bit_count > 0 {
                self.maybe_pad(out);
                let group = (bit_buf << (6 - bit_count)) as u8;
                out.push(self.table.layout().encode_group(group & 0x3F));
                out.push(self.pad_marker);
            }
        }

        self.maybe_pad(out);
    }
}

/// Decodes packed 6-bit group bytes back into plaintext.
pub struct PackedDecoder {
    table: Arc<Table>,
    pad_marker: u8,
    bit_buf: u64,
    bit_count: u32,
}

impl PackedDecoder {
    pub fn new(table: Arc<Table>) -> Self {
        let pad_marker = table.layout().pad_marker();
        Self {
            table,
            pad_marker,
            bit_buf: 0,
            bit_count: 0,
        }
    }

    /// Drop accumulated bits. Called on pad marker and on EOF.
    pub fn reset(&mut self) {
        self.bit_buf = 0;
        self.bit_count = 0;
    }

    /// Feed raw wire bytes; decoded plaintext is appended to `out`.
    pub fn feed(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        for &b in data {
            if !self.table.layout().is_hint(b) {
                if b == self.pad_marker {
                    self.reset();
                }
                continue;
            }

            let group = self
                .table
                .layout()
                .decode_group(b)
                .ok_or(Error::DecodeMapMiss)?;

            self.bit_buf = (self.bit_buf << 6) | u64::from(group);
            self.bit_count += 6;
            if self.bit_count >= 8 {
                self.bit_count -= 8;
                out.push((self.bit_buf >> self.bit_count) as u8);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table;
    use rand::SeedableRng;

    fn test_table(mode: &str) -> Arc<Table> {
        table::cached("packed codec secret", mode, None).unwrap()
    }

    fn roundtrip(table: &Arc<Table>, data: &[u8], pmin: u8, pmax: u8) -> Vec<u8> {
        let mut enc = PackedEncoder::new(Arc::clone(table), StdRng::from_entropy(), pmin, pmax);
        let mut wire = Vec::new();
        enc.encode(data, &mut wire);

        let mut dec = PackedDecoder::new(Arc::clone(table));
        let mut out = Vec::new();
        dec.feed(&wire, &mut out).unwrap();
        out
    }

    #[test]
    fn test_roundtrip_every_length_mod_three() {
        let table = test_table("entropy");
        let base: Vec<u8> = (0..64).map(|i| (i * 37) as u8).collect();
        for len in 0..=base.len() {
            assert_eq!(roundtrip(&table, &base[..len], 15, 45), &base[..len], "len={len}");
        }
    }

    #[test]
    fn test_roundtrip_ascii_and_custom() {
        let ascii = test_table("ascii");
        let custom = table::cached("packed codec secret", "entropy", Some("xxppvvvv")).unwrap();
        let data = b"binary \x00\x01\xfe\xff payload".to_vec();
        assert_eq!(roundtrip(&ascii, &data, 0, 100), data);
        assert_eq!(roundtrip(&custom, &data, 0, 100), data);
    }

    #[test]
    fn test_separate_writes_stay_aligned() {
        // Each encode call closes its partial group, so independently
        // encoded writes concatenate cleanly on the wire.
        let table = test_table("entropy");
        let mut enc = PackedEncoder::new(Arc::clone(&table), StdRng::from_entropy(), 10, 20);
        let mut wire = Vec::new();
        enc.encode(b"first", &mut wire); // 5 bytes: partial group + marker
        enc.encode(b"second write", &mut wire);
        enc.encode(b"x", &mut wire);

        let mut dec = PackedDecoder::new(Arc::clone(&table));
        let mut out = Vec::new();
        dec.feed(&wire, &mut out).unwrap();
        assert_eq!(out, b"firstsecond writex");
    }

    #[test]
    fn test_pad_marker_resyncs_after_corruption() {
        let table = test_table("entropy");
        let layout = table.layout().clone();

        // A stray group byte desyncs the accumulator; the next marker must
        // clear it so following self-contained writes decode intact.
        let mut wire = vec![layout.encode_group(0x2A)];
        wire.push(layout.pad_marker());

        let mut enc = PackedEncoder::new(Arc::clone(&table), StdRng::from_entropy(), 0, 0);
        enc.encode(b"clean", &mut wire);

        let mut dec = PackedDecoder::new(Arc::clone(&table));
        let mut out = Vec::new();
        dec.feed(&wire, &mut out).unwrap();
        assert_eq!(out, b"clean");
    }

    #[test]
    fn test_chunked_feed_matches_single_feed() {
        let table = test_table("entropy");
        let data: Vec<u8> = (0..=255).collect();
        let mut enc = PackedEncoder::new(Arc::clone(&table), StdRng::from_entropy(), 30, 60);
        let mut wire = Vec::new();
        enc.encode(&data, &mut wire);

        let mut dec = PackedDecoder::new(Arc::clone(&table));
        let mut out = Vec::new();
        for chunk in wire.chunks(7) {
            dec.feed(chunk, &mut out).unwrap();
        }
        assert_eq!(out, data);
    }
}
