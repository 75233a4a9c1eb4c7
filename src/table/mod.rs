//! Obfuscation tables
//!
//! A table maps every byte value to the set of 4-hint puzzles that uniquely
//! identify its assigned grid, plus the inverse decode map. Tables are
//! deterministic in (secret, layout, pattern) and expensive to build, so
//! they are memoized process-wide and shared across connections.

mod grid;
mod layout;

pub use grid::{Grid, GRIDS, GRID_COUNT};
pub use layout::{ByteLayout, CustomLayout};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};

/// One byte-to-puzzles obfuscation table plus its inverse decode map.
pub struct Table {
    layout: ByteLayout,
    encode_table: Vec<Vec<[u8; 4]>>,
    decode_map: HashMap<u32, u8>,
    padding_pool: Vec<u8>,
}

impl Table {
    /// Build a table from a shared secret and a resolved layout.
    ///
    /// The secret seeds a deterministic shuffle of the 288-grid list; byte
    /// value `b` is assigned the grid at shuffled index `b`. For each byte
    /// value, every 4-position subset that pins down the assigned grid
    /// uniquely among all 288 becomes one candidate puzzle.
    pub fn build(secret: &str, layout: ByteLayout) -> Result<Self> {
        let mut order: Vec<usize> = (0..GRID_COUNT).collect();
        let mut rng = StdRng::seed_from_u64(table_seed(secret));
        order.shuffle(&mut rng);

        let subsets = position_subsets();

        // For each subset, count how often each 4-value reveal occurs across
        // all grids. A reveal with count 1 identifies its grid uniquely.
        let mut reveal_counts: Vec<HashMap<[u8; 4], u16>> = Vec::with_capacity(subsets.len());
        for subset in &subsets {
            let mut counts: HashMap<[u8; 4], u16> = HashMap::with_capacity(GRID_COUNT);
            for g in GRIDS.iter() {
                let reveal = [
                    g.value_at(subset[0] as usize),
                    g.value_at(subset[1] as usize),
                    g.value_at(subset[2] as usize),
                    g.value_at(subset[3] as usize),
                ];
                *counts.entry(reveal).or_insert(0) += 1;
            }
            reveal_counts.push(counts);
        }

        let mut encode_table: Vec<Vec<[u8; 4]>> = vec![Vec::new(); 256];
        let mut decode_map: HashMap<u32, u8> = HashMap::new();

        for byte_value in 0..256usize {
            let g = &GRIDS[order[byte_value]];
            for (subset, counts) in subsets.iter().zip(&reveal_counts) {
                let reveal = [
                    g.value_at(subset[0] as usize),
                    g.value_at(subset[1] as usize),
                    g.value_at(subset[2] as usize),
                    g.value_at(subset[3] as usize),
                ];
                if counts[&reveal] != 1 {
                    continue;
                }
                let mut puzzle = [0u8; 4];
                for (i, &pos) in subset.iter().enumerate() {
                    puzzle[i] = layout.encode_hint(reveal[i] - 1, pos);
                }
                let key = pack_hint_key(puzzle);
                if let Some(&existing) = decode_map.get(&key) {
                    if existing != byte_value as u8 {
                        return Err(Error::Config(format!(
                            "table build collision: key {key:#010x} maps to both {existing} and {byte_value}"
                        )));
                    }
                }
                decode_map.insert(key, byte_value as u8);
                encode_table[byte_value].push(puzzle);
            }
            if encode_table[byte_value].is_empty() {
                return Err(Error::Config(format!(
                    "table build produced no puzzles for byte value {byte_value}"
                )));
            }
        }

        debug!(
            layout = %layout.name(),
            entries = decode_map.len(),
            "built sudoku table"
        );

        let padding_pool = layout.padding_pool();
        Ok(Table {
            layout,
            encode_table,
            decode_map,
            padding_pool,
        })
    }

    /// Build the candidate table set for a configuration: one table per
    /// custom pattern when rotation patterns are given, otherwise a single
    /// table from the mode and optional single pattern.
    pub fn build_set(
        secret: &str,
        mode: &str,
        custom_pattern: Option<&str>,
        custom_patterns: &[String],
    ) -> Result<Vec<Arc<Table>>> {
        if !custom_patterns.is_empty() {
            let mut seen = std::collections::HashSet::new();
            let mut tables = Vec::with_capacity(custom_patterns.len());
            for pattern in custom_patterns {
                if !seen.insert(pattern.trim().to_lowercase()) {
                    return Err(Error::Config(format!(
                        "duplicate custom table pattern: {pattern:?}"
                    )));
                }
                tables.push(cached(secret, mode, Some(pattern))?);
            }
            return Ok(tables);
        }
        Ok(vec![cached(secret, mode, custom_pattern)?])
    }

    #[inline]
    pub fn layout(&self) -> &ByteLayout {
        &self.layout
    }

    /// Candidate puzzles for one byte value. Never empty.
    #[inline]
    pub fn puzzles_for(&self, byte_value: u8) -> &[[u8; 4]] {
        &self.encode_table[byte_value as usize]
    }

    /// Look up the byte value for a canonicalized hint quadruple.
    #[inline]
    pub fn decode_hints(&self, hints: [u8; 4]) -> Option<u8> {
        self.decode_map.get(&pack_hint_key(hints)).copied()
    }

    #[inline]
    pub fn padding_pool(&self) -> &[u8] {
        &self.padding_pool
    }
}

/// Canonical key for a hint quadruple: sort the four bytes, pack big-endian.
/// Sorting makes the key independent of the permutation the encoder chose.
#[inline]
pub fn pack_hint_key(mut hints: [u8; 4]) -> u32 {
    hints.sort_unstable();
    u32::from_be_bytes(hints)
}

/// 64-bit table seed: leading bytes of SHA-256 over the secret.
fn table_seed(secret: &str) -> u64 {
    let digest = Sha256::digest(secret.as_bytes());
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(seed)
}

/// All C(16,4) = 1820 subsets of cell positions, ascending.
fn position_subsets() -> Vec<[u8; 4]> {
    let mut subsets = Vec::with_capacity(1820);
    for a in 0..16u8 {
        for b in (a + 1)..16 {
            for c in (b + 1)..16 {
                for d in (c + 1)..16 {
                    subsets.push([a, b, c, d]);
                }
            }
        }
    }
    subsets
}

type CacheKey = (String, String, Option<String>);

lazy_static! {
    static ref TABLE_CACHE: Mutex<HashMap<CacheKey, Arc<Table>>> = Mutex::new(HashMap::new());
}

/// Memoized table lookup keyed by (secret, mode, pattern).
pub fn cached(secret: &str, mode: &str, custom_pattern: Option<&str>) -> Result<Arc<Table>> {
    let key: CacheKey = (
        secret.to_string(),
        mode.trim().to_lowercase(),
        custom_pattern.map(|p| p.trim().to_lowercase()),
    );
    if let Some(table) = TABLE_CACHE
        .lock()
        .expect("table cache poisoned")
        .get(&key)
        .cloned()
    {
        return Ok(table);
    }

    // Built outside the lock: construction takes a moment and concurrent
    // connections with the same key can tolerate a duplicate build.
    let layout = ByteLayout::resolve(mode, custom_pattern)?;
    let table = Arc::new(Table::build(secret, layout)?);
    TABLE_CACHE
        .lock()
        .expect("table cache poisoned")
        .insert(key, Arc::clone(&table));
    Ok(table)
}
