//! 4x4 grid enumeration
//!
//! A grid is a 16-cell array of values 1..=4 where every row, column and
//! 2x2 box contains each value exactly once. There are exactly 288 such
//! grids; the full set is generated once per process and shared read-only.

use lazy_static::lazy_static;

/// One solved 4x4 grid, row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid(pub [u8; 16]);

impl Grid {
    /// Value at cell index 0..16.
    #[inline]
    pub fn value_at(&self, pos: usize) -> u8 {
        self.0[pos]
    }
}

lazy_static! {
    /// All 288 valid grids.
    pub static ref GRIDS: Vec<Grid> = enumerate_grids();
}

/// Number of valid grids. Anything else out of the enumeration is a bug.
pub const GRID_COUNT: usize = 288;

fn enumerate_grids() -> Vec<Grid> {
    let perms = value_permutations();
    let mut grids = Vec::with_capacity(GRID_COUNT);

    for r0 in &perms {
        for r1 in &perms {
            if !rows_compatible(r0, r1, true) {
                continue;
            }
            for r2 in &perms {
                if !rows_compatible(r0, r2, false) || !rows_compatible(r1, r2, false) {
                    continue;
                }
                for r3 in &perms {
                    if !rows_compatible(r0, r3, false)
                        || !rows_compatible(r1, r3, false)
                        || !rows_compatible(r2, r3, true)
                    {
                        continue;
                    }
                    let mut cells = [0u8; 16];
                    cells[0..4].copy_from_slice(r0);
                    cells[4..8].copy_from_slice(r1);
                    cells[8..12].copy_from_slice(r2);
                    cells[12..16].copy_from_slice(r3);
                    grids.push(Grid(cells));
                }
            }
        }
    }

    debug_assert_eq!(grids.len(), GRID_COUNT);
    grids
}

/// The 24 permutations of [1,2,3,4], in lexicographic order.
fn value_permutations() -> Vec<[u8; 4]> {
    let mut out = Vec::with_capacity(24);
    for a in 1..=4u8 {
        for b in 1..=4u8 {
            for c in 1..=4u8 {
                for d in 1..=4u8 {
                    if a != b && a != c && a != d && b != c && b != d && c != d {
                        out.push([a, b, c, d]);
                    }
                }
            }
        }
    }
    out
}

/// Column disjointness between two rows, plus 2x2 box disjointness when the
/// rows share a box band (rows 0/1 and rows 2/3).
fn rows_compatible(upper: &[u8; 4], lower: &[u8; 4], same_band: bool) -> bool {
    for c in 0..4 {
        if upper[c] == lower[c] {
            return false;
        }
    }
    if same_band {
        // Left box: columns 0-1, right box: columns 2-3.
        if upper[0] == lower[1] || upper[1] == lower[0] {
            return false;
        }
        if upper[2] == lower[3] || upper[3] == lower[2] {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_is_valid(g: &Grid) -> bool {
        for i in 0..4 {
            let row: Vec<u8> = (0..4).map(|c| g.value_at(i * 4 + c)).collect();
            let col: Vec<u8> = (0..4).map(|r| g.value_at(r * 4 + i)).collect();
            let boxed: Vec<u8> = {
                let base = (i / 2) * 8 + (i % 2) * 2;
                vec![
                    g.value_at(base),
                    g.value_at(base + 1),
                    g.value_at(base + 4),
                    g.value_at(base + 5),
                ]
            };
            for group in [row, col, boxed] {
                let mut seen = [false; 5];
                for v in group {
                    if v < 1 || v > 4 || seen[v as usize] {
                        return false;
                    }
                    seen[v as usize] = true;
                }
            }
        }
        true
    }

    #[test]
    fn test_exactly_288_grids() {
        assert_eq!(GRIDS.len(), GRID_COUNT);
    }

    #[test]
    fn test_all_grids_valid_and_distinct() {
        for g in GRIDS.iter() {
            assert!(grid_is_valid(g));
        }
        let mut sorted: Vec<[u8; 16]> = GRIDS.iter().map(|g| g.0).collect();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), GRID_COUNT);
    }
}
