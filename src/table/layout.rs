//! Byte layout strategies
//!
//! A layout decides how hint reveals and 6-bit groups are serialized into
//! output bytes, which bytes count as padding, and which single byte acts
//! as the packed-mode pad marker.

use crate::error::{Error, Result};

/// Pluggable bit-pattern policy for the obfuscated wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ByteLayout {
    /// Keeps every output byte in the printable ASCII range.
    Ascii,
    /// Spreads hint bits across the full byte range. Default.
    Entropy,
    /// Derived from an 8-symbol pattern of `x` (type marker), `p` (value)
    /// and `v` (position) bits.
    Custom(CustomLayout),
}

/// Layout derived from a user pattern string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomLayout {
    pattern: String,
    x_mask: u8,
    x_bits: [u8; 2],
    p_bits: [u8; 2],
    v_bits: [u8; 4],
    pad_marker: u8,
    padding_pool: Vec<u8>,
}

impl ByteLayout {
    /// Pick the layout from the ASCII-preference mode string and an optional
    /// custom pattern. ASCII always wins if requested; custom patterns are
    /// ignored when ASCII is preferred.
    pub fn resolve(mode: &str, custom_pattern: Option<&str>) -> Result<Self> {
        match mode.trim().to_lowercase().as_str() {
            "ascii" | "prefer_ascii" => return Ok(ByteLayout::Ascii),
            "" | "entropy" | "prefer_entropy" => {}
            other => return Err(Error::Config(format!("invalid ascii mode: {other}"))),
        }
        match custom_pattern.map(str::trim).filter(|p| !p.is_empty()) {
            Some(pattern) => Ok(ByteLayout::Custom(CustomLayout::parse(pattern)?)),
            None => Ok(ByteLayout::Entropy),
        }
    }

    pub fn name(&self) -> String {
        match self {
            ByteLayout::Ascii => "ascii".to_string(),
            ByteLayout::Entropy => "entropy".to_string(),
            ByteLayout::Custom(c) => format!("custom({})", c.pattern),
        }
    }

    /// Whether a wire byte carries hint/group payload (vs padding).
    #[inline]
    pub fn is_hint(&self, b: u8) -> bool {
        match self {
            ByteLayout::Ascii => (b & 0x40) == 0x40,
            ByteLayout::Entropy => (b & 0x90) == 0x00,
            ByteLayout::Custom(c) => (b & c.x_mask) == c.x_mask,
        }
    }

    /// Serialize one (value 0..3, position 0..15) reveal.
    #[inline]
    pub fn encode_hint(&self, val: u8, pos: u8) -> u8 {
        match self {
            ByteLayout::Ascii => 0x40 | ((val & 0x03) << 4) | (pos & 0x0F),
            ByteLayout::Entropy => ((val & 0x03) << 5) | (pos & 0x0F),
            ByteLayout::Custom(c) => c.encode_bits(val, pos, None),
        }
    }

    /// Serialize one packed 6-bit group.
    #[inline]
    pub fn encode_group(&self, group: u8) -> u8 {
        match self {
            ByteLayout::Ascii => 0x40 | (group & 0x3F),
            ByteLayout::Entropy => {
                let v = group & 0x3F;
                ((v & 0x30) << 1) | (v & 0x0F)
            }
            ByteLayout::Custom(c) => {
                let val = (group >> 4) & 0x03;
                let pos = group & 0x0F;
                c.encode_bits(val, pos, None)
            }
        }
    }

    /// Recover a packed 6-bit group, or None when the byte is not a group.
    #[inline]
    pub fn decode_group(&self, b: u8) -> Option<u8> {
        match self {
            ByteLayout::Ascii => {
                if (b & 0x40) == 0 {
                    None
                } else {
                    Some(b & 0x3F)
                }
            }
            ByteLayout::Entropy => {
                if (b & 0x90) != 0 {
                    None
                } else {
                    Some(((b >> 1) & 0x30) | (b & 0x0F))
                }
            }
            ByteLayout::Custom(c) => c.decode_group(b),
        }
    }

    /// Byte that terminates a partial packed group and resets the decoder.
    pub fn pad_marker(&self) -> u8 {
        match self {
            ByteLayout::Ascii => 0x3F,
            ByteLayout::Entropy => 0x80,
            ByteLayout::Custom(c) => c.pad_marker,
        }
    }

    /// Non-hint filler bytes the encoder may draw from.
    pub fn padding_pool(&self) -> Vec<u8> {
        match self {
            ByteLayout::Ascii => (0..32).map(|i| 0x20 + i).collect(),
            ByteLayout::Entropy => {
                let mut pool = Vec::with_capacity(16);
                for i in 0..8u8 {
                    pool.push(0x80 + i);
                    pool.push(0x10 + i);
                }
                pool
            }
            ByteLayout::Custom(c) => c.padding_pool.clone(),
        }
    }
}

impl CustomLayout {
    /// Parse an 8-symbol pattern assigning each bit (MSB first) a role:
    /// `x` marks the 2 type bits, `p` the 2 value bits, `v` the 4 position
    /// bits.
    pub fn parse(pattern: &str) -> Result<Self> {
        let cleaned: String = pattern
            .trim()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        if cleaned.len() != 8 {
            return Err(Error::Config(format!(
                "custom table must have 8 symbols, got {}",
                cleaned.len()
            )));
        }

        let mut x_bits = Vec::new();
        let mut p_bits = Vec::new();
        let mut v_bits = Vec::new();
        for (i, c) in cleaned.chars().enumerate() {
            let bit = (7 - i) as u8;
            match c {
                'x' => x_bits.push(bit),
                'p' => p_bits.push(bit),
                'v' => v_bits.push(bit),
                other => {
                    return Err(Error::Config(format!(
                        "invalid char {other:?} in custom table"
                    )))
                }
            }
        }
        if x_bits.len() != 2 || p_bits.len() != 2 || v_bits.len() != 4 {
            return Err(Error::Config(
                "custom table must contain exactly 2 x, 2 p, 4 v".into(),
            ));
        }

        let x_mask = (1u8 << x_bits[0]) | (1u8 << x_bits[1]);
        let mut layout = CustomLayout {
            pattern: cleaned,
            x_mask,
            x_bits: [x_bits[0], x_bits[1]],
            p_bits: [p_bits[0], p_bits[1]],
            v_bits: [v_bits[0], v_bits[1], v_bits[2], v_bits[3]],
            pad_marker: 0,
            padding_pool: Vec::new(),
        };

        // Padding bytes drop one x bit (so they never classify as hints) and
        // keep popcount >= 5 to stay far from the hint space.
        let mut pool = Vec::new();
        for drop in 0..2 {
            for val in 0..4u8 {
                for pos in 0..16u8 {
                    let b = layout.encode_bits(val, pos, Some(drop));
                    if b.count_ones() >= 5 && !pool.contains(&b) {
                        pool.push(b);
                    }
                }
            }
        }
        pool.sort_unstable();
        if pool.is_empty() {
            return Err(Error::Config("custom table produced empty padding pool".into()));
        }
        layout.pad_marker = pool[0];
        layout.padding_pool = pool;
        Ok(layout)
    }

    fn encode_bits(&self, val: u8, pos: u8, drop_x: Option<usize>) -> u8 {
        let mut out = self.x_mask;
        if let Some(drop) = drop_x {
            out &= !(1 << self.x_bits[drop]);
        }
        if (val & 0x02) != 0 {
            out |= 1 << self.p_bits[0];
        }
        if (val & 0x01) != 0 {
            out |= 1 << self.p_bits[1];
        }
        for (i, bit) in self.v_bits.iter().enumerate() {
            if (pos >> (3 - i)) & 0x01 == 1 {
                out |= 1 << bit;
            }
        }
        out
    }

    fn decode_group(&self, b: u8) -> Option<u8> {
        if (b & self.x_mask) != self.x_mask {
            return None;
        }
        let mut val = 0u8;
        let mut pos = 0u8;
        if b & (1 << self.p_bits[0]) != 0 {
            val |= 0x02;
        }
        if b & (1 << self.p_bits[1]) != 0 {
            val |= 0x01;
        }
        for (i, bit) in self.v_bits.iter().enumerate() {
            if b & (1 << bit) != 0 {
                pos |= 1 << (3 - i);
            }
        }
        Some((val << 4) | (pos & 0x0F))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_layouts() -> Vec<ByteLayout> {
        vec![
            ByteLayout::Ascii,
            ByteLayout::Entropy,
            ByteLayout::Custom(CustomLayout::parse("xpxvvpvv").unwrap()),
            ByteLayout::Custom(CustomLayout::parse("xxppvvvv").unwrap()),
        ]
    }

    #[test]
    fn test_resolve_modes() {
        assert_eq!(ByteLayout::resolve("ascii", None).unwrap(), ByteLayout::Ascii);
        assert_eq!(
            ByteLayout::resolve("prefer_ascii", Some("xpxvvpvv")).unwrap(),
            ByteLayout::Ascii
        );
        assert_eq!(ByteLayout::resolve("", None).unwrap(), ByteLayout::Entropy);
        assert!(matches!(
            ByteLayout::resolve("prefer_entropy", Some("xpxvvpvv")).unwrap(),
            ByteLayout::Custom(_)
        ));
        assert!(ByteLayout::resolve("bogus", None).is_err());
    }

    #[test]
    fn test_custom_pattern_validation() {
        assert!(CustomLayout::parse("xpxvvpv").is_err()); // too short
        assert!(CustomLayout::parse("xxxxvvvv").is_err()); // wrong counts
        assert!(CustomLayout::parse("xpzvvpvv").is_err()); // bad symbol
        assert!(CustomLayout::parse(" XP XV VP VV ").is_ok()); // spacing and case are cleaned up
    }

    #[test]
    fn test_group_roundtrip_all_layouts() {
        for layout in all_layouts() {
            for group in 0..64u8 {
                let b = layout.encode_group(group);
                assert!(layout.is_hint(b), "{}: group byte must be a hint", layout.name());
                assert_eq!(layout.decode_group(b), Some(group), "{}", layout.name());
            }
        }
    }

    #[test]
    fn test_hint_bytes_are_hints() {
        for layout in all_layouts() {
            for val in 0..4u8 {
                for pos in 0..16u8 {
                    assert!(layout.is_hint(layout.encode_hint(val, pos)));
                }
            }
        }
    }

    #[test]
    fn test_padding_disjoint_from_hints() {
        for layout in all_layouts() {
            let pool = layout.padding_pool();
            assert!(!pool.is_empty());
            for b in pool {
                assert!(
                    !layout.is_hint(b),
                    "{}: padding byte {b:#04x} classifies as hint",
                    layout.name()
                );
            }
            assert!(!layout.is_hint(layout.pad_marker()));
        }
    }

    #[test]
    fn test_hint_encoding_injective() {
        for layout in all_layouts() {
            let mut seen = std::collections::HashSet::new();
            for val in 0..4u8 {
                for pos in 0..16u8 {
                    assert!(seen.insert(layout.encode_hint(val, pos)));
                }
            }
        }
    }
}
