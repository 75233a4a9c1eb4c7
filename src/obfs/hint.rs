//! Hint-mode codec
//!
//! Every plaintext byte becomes one 4-byte puzzle drawn at random from the
//! byte value's candidate list, emitted in a random permutation of its four
//! hint bytes, with Bernoulli-padding interleaved. The decoder classifies
//! wire bytes with the layout's hint predicate, discards padding, and maps
//! each accumulated quadruple back through the decode map.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{Error, Result};
use crate::table::Table;

/// The 24 permutations of four positions.
pub(crate) const PERM4: [[usize; 4]; 24] = [
    [0, 1, 2, 3],
    [0, 1, 3, 2],
    [0, 2, 1, 3],
    [0, 2, 3, 1],
    [0, 3, 1, 2],
    [0, 3, 2, 1],
    [1, 0, 2, 3],
    [1, 0, 3, 2],
    [1, 2, 0, 3],
    [1, 2, 3, 0],
    [1, 3, 0, 2],
    [1, 3, 2, 0],
    [2, 0, 1, 3],
    [2, 0, 3, 1],
    [2, 1, 0, 3],
    [2, 1, 3, 0],
    [2, 3, 0, 1],
    [2, 3, 1, 0],
    [3, 0, 1, 2],
    [3, 0, 2, 1],
    [3, 1, 0, 2],
    [3, 1, 2, 0],
    [3, 2, 0, 1],
    [3, 2, 1, 0],
];

/// Draw the per-connection padding rate uniformly inside [min,max]%.
pub(crate) fn draw_padding_rate(rng: &mut StdRng, padding_min: u8, padding_max: u8) -> f32 {
    let min = f32::from(padding_min) / 100.0;
    let span = f32::from(padding_max.saturating_sub(padding_min)) / 100.0;
    min + rng.gen::<f32>() * span
}

/// Encodes plaintext bytes into puzzle-hint wire bytes.
pub struct HintEncoder {
    table: Arc<Table>,
    rng: StdRng,
    padding_rate: f32,
}

impl HintEncoder {
    /// `rng` must be freshly seeded from a secure source per connection.
    pub fn new(table: Arc<Table>, mut rng: StdRng, padding_min: u8, padding_max: u8) -> Self {
        let padding_rate = draw_padding_rate(&mut rng, padding_min, padding_max);
        Self {
            table,
            rng,
            padding_rate,
        }
    }

    fn maybe_pad(&mut self, out: &mut Vec<u8>) {
        let pool = self.table.padding_pool();
        if !pool.is_empty() && self.rng.gen::<f32>() < self.padding_rate {
            out.push(pool[self.rng.gen_range(0..pool.len())]);
        }
    }

    /// Encode one write's worth of plaintext.
    pub fn encode(&mut self, data: &[u8], out: &mut Vec<u8>) {
        out.reserve(data.len() * 6);
        for &b in data {
            self.maybe_pad(out);

            let puzzles = self.table.puzzles_for(b);
            let puzzle = puzzles[self.rng.gen_range(0..puzzles.len())];
            let perm = PERM4[self.rng.gen_range(0..PERM4.len())];
            for &idx in &perm {
                self.maybe_pad(out);
                out.push(puzzle[idx]);
            }
        }
        self.maybe_pad(out);
    }
}

/// Decodes puzzle-hint wire bytes back into plaintext.
pub struct HintDecoder {
    table: Arc<Table>,
    hint_buf: [u8; 4],
    hint_len: usize,
}

impl HintDecoder {
    pub fn new(table: Arc<Table>) -> Self {
        Self {
            table,
            hint_buf: [0; 4],
            hint_len: 0,
        }
    }

    /// Feed raw wire bytes; decoded plaintext is appended to `out`.
    /// An accumulated quadruple with no table entry is a hard decode error.
    pub fn feed(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<()> {
        for &b in data {
            if !self.table.layout().is_hint(b) {
                continue;
            }
            self.hint_buf[self.hint_len] = b;
            self.hint_len += 1;
            if self.hint_len == 4 {
                self.hint_len = 0;
                match self.table.decode_hints(self.hint_buf) {
                    Some(value) => out.push(value),
                    None => return Err(Error::DecodeMapMiss),
                }
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
        table::cached("hint codec secret", mode, None).unwrap()
    }

    fn roundtrip(table: &Arc<Table>, data: &[u8], pmin: u8, pmax: u8) -> Vec<u8> {
        let rng = StdRng::from_entropy();
        let mut enc = HintEncoder::new(Arc::clone(table), rng, pmin, pmax);
        let mut wire = Vec::new();
        enc.encode(data, &mut wire);

        let mut dec = HintDecoder::new(Arc::clone(table));
        let mut out = Vec::new();
        dec.feed(&wire, &mut out).unwrap();
        out
    }

    #[test]
    fn test_roundtrip_all_padding_ratios() {
        let table = test_table("entropy");
        let data: Vec<u8> = (0..=255).collect();
        for (pmin, pmax) in [(0, 0), (10, 30), (100, 100)] {
            assert_eq!(roundtrip(&table, &data, pmin, pmax), data);
        }
    }

    #[test]
    fn test_roundtrip_ascii_layout() {
        let table = test_table("ascii");
        let data = b"The quick brown fox \x00\xff\x80 jumps".to_vec();
        assert_eq!(roundtrip(&table, &data, 25, 75), data);

        // ASCII layout keeps the whole wire printable-range.
        let mut enc = HintEncoder::new(Arc::clone(&table), StdRng::from_entropy(), 50, 50);
        let mut wire = Vec::new();
        enc.encode(&data, &mut wire);
        assert!(wire.iter().all(|&b| (0x20..0x80).contains(&b)));
    }

    #[test]
    fn test_arbitrary_padding_injection_is_invisible() {
        let table = test_table("entropy");
        let data = b"payload under test".to_vec();

        let mut enc = HintEncoder::new(Arc::clone(&table), StdRng::from_entropy(), 0, 0);
        let mut wire = Vec::new();
        enc.encode(&data, &mut wire);

        // Inject pool bytes between every wire byte.
        let pool = table.padding_pool().to_vec();
        let mut rng = StdRng::seed_from_u64(7);
        let mut noisy = Vec::with_capacity(wire.len() * 3);
        for b in wire {
            noisy.push(pool[rng.gen_range(0..pool.len())]);
            noisy.push(b);
            noisy.push(pool[rng.gen_range(0..pool.len())]);
        }

        let mut dec = HintDecoder::new(Arc::clone(&table));
        let mut out = Vec::new();
        dec.feed(&noisy, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_split_feed_preserves_state() {
        let table = test_table("entropy");
        let data = b"split across feeds".to_vec();
        let mut enc = HintEncoder::new(Arc::clone(&table), StdRng::from_entropy(), 20, 40);
        let mut wire = Vec::new();
        enc.encode(&data, &mut wire);

        let mut dec = HintDecoder::new(Arc::clone(&table));
        let mut out = Vec::new();
        for chunk in wire.chunks(3) {
            dec.feed(chunk, &mut out).unwrap();
        }
        assert_eq!(out, data);
    }

    #[test]
    fn test_unknown_quadruple_is_fatal() {
        let table = test_table("entropy");

        // Four identical hint bytes repeat a position, which no valid puzzle
        // does, so the canonical key cannot exist in the decode map.
        let hint = table.layout().encode_hint(0, 0);
        let mut dec = HintDecoder::new(table);
        let mut out = Vec::new();
        assert!(matches!(
            dec.feed(&[hint, hint, hint, hint], &mut out),
            Err(Error::DecodeMapMiss)
        ));
    }
}
