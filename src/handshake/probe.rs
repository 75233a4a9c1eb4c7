//! Blind table probing
//!
//! With several candidate tables configured, the server has to discover
//! which one the client used without any negotiation message. Each
//! candidate is evaluated by a pure function over the buffered connection
//! prefix: decode the hint stream, open AEAD frames, and check the
//! handshake block. No candidate ever touches the live socket, so the
//! winning table's decoder can replay the same bytes afterwards.

use std::sync::Arc;

use crate::crypto::{open_frame, AeadCipher, FrameParse};
use crate::error::Error;
use crate::obfs::HintDecoder;
use crate::table::Table;

use super::{validate_timestamp, HANDSHAKE_LEN};

/// Result of one candidate evaluation.
#[derive(Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The candidate decodes a fresh, well-formed handshake.
    Selected {
        /// Low byte of the handshake block; doubles as the client's
        /// informational table-index hint when several tables are in play.
        embedded_hint: u8,
    },
    /// The buffered prefix ends before a verdict is possible.
    NeedMore,
    /// The candidate cannot have produced these bytes. Never retried.
    Failed,
}

/// Evaluate one candidate table against the buffered prefix.
///
/// `cipher` is None for the pass-through AEAD method; then the identity
/// tag carries the whole burden of rejecting wrong candidates.
pub fn probe_candidate(
    buffered: &[u8],
    table: &Arc<Table>,
    cipher: Option<&AeadCipher>,
    secret_tag: &[u8; 8],
    expected_mode: u8,
    now_unix: i64,
) -> ProbeOutcome {
    // Uplink bytes are always hint-encoded.
    let mut decoder = HintDecoder::new(Arc::clone(table));
    let mut decoded = Vec::with_capacity(buffered.len() / 4);
    if decoder.feed(buffered, &mut decoded).is_err() {
        return ProbeOutcome::Failed;
    }

    // Collect handshake plaintext: 16-byte block plus the mode byte.
    let mut plaintext = Vec::with_capacity(HANDSHAKE_LEN + 1);
    match cipher {
        Some(cipher) => {
            let mut offset = 0;
            while plaintext.len() < HANDSHAKE_LEN + 1 {
                match open_frame(cipher, &decoded[offset..]) {
                    Ok(FrameParse::Complete {
                        plaintext: chunk,
                        consumed,
                    }) => {
                        offset += consumed;
                        plaintext.extend_from_slice(&chunk);
                    }
                    Ok(FrameParse::NeedMore) => return ProbeOutcome::NeedMore,
                    // Authentication failure or malformed frame: wrong table.
                    Err(_) => return ProbeOutcome::Failed,
                }
            }
        }
        None => plaintext = decoded,
    }

    if plaintext.len() < HANDSHAKE_LEN + 1 {
        return ProbeOutcome::NeedMore;
    }

    let mut ts_bytes = [0u8; 8];
    ts_bytes.copy_from_slice(&plaintext[..8]);
    let ts = u64::from_be_bytes(ts_bytes) as i64;
    if !validate_timestamp(ts, now_unix) {
        return ProbeOutcome::Failed;
    }

    // The low tag byte may be overwritten by the table-index hint, so only
    // the first seven bytes authenticate the key.
    if plaintext[8..15] != secret_tag[..7] {
        return ProbeOutcome::Failed;
    }

    if plaintext[HANDSHAKE_LEN] != expected_mode {
        return ProbeOutcome::Failed;
    }

    ProbeOutcome::Selected {
        embedded_hint: plaintext[15],
    }
}

/// One server-side probe pass over every still-live candidate.
///
/// Returns the selected index, or None while at least one candidate still
/// needs more data. `Err(TableProbeFailed)` once every candidate is dead.
pub fn probe_all(
    buffered: &[u8],
    tables: &[Arc<Table>],
    ciphers: &[Option<AeadCipher>],
    alive: &mut [bool],
    secret_tag: &[u8; 8],
    expected_mode: u8,
    now_unix: i64,
) -> crate::error::Result<Option<(usize, u8)>> {
    let mut any_waiting = false;
    for (idx, table) in tables.iter().enumerate() {
        if !alive[idx] {
            continue;
        }
        match probe_candidate(
            buffered,
            table,
            ciphers[idx].as_ref(),
            secret_tag,
            expected_mode,
            now_unix,
        ) {
            ProbeOutcome::Selected { embedded_hint } => return Ok(Some((idx, embedded_hint))),
            ProbeOutcome::NeedMore => any_waiting = true,
            ProbeOutcome::Failed => alive[idx] = false,
        }
    }
    if any_waiting {
        Ok(None)
    } else {
        Err(Error::TableProbeFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_aead_key, handshake_tag, seal_frame, AeadMethod};
    use crate::obfs::HintEncoder;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const MODE_PURE: u8 = 0x01;

    fn encode_client_hello(
        table: &Arc<Table>,
        secret: &str,
        table_hint: Option<u8>,
        now: i64,
    ) -> Vec<u8> {
        let mut block = [0u8; HANDSHAKE_LEN];
        block[..8].copy_from_slice(&(now as u64).to_be_bytes());
        block[8..].copy_from_slice(&handshake_tag(secret));
        if let Some(hint) = table_hint {
            block[15] = hint;
        }

        let key = derive_aead_key(secret, AeadMethod::ChaCha20Poly1305).unwrap();
        let cipher = AeadCipher::new(AeadMethod::ChaCha20Poly1305, &key).unwrap();
        let mut frames = Vec::new();
        seal_frame(&cipher, &block, &mut frames).unwrap();
        seal_frame(&cipher, &[MODE_PURE], &mut frames).unwrap();

        let mut enc = HintEncoder::new(Arc::clone(table), StdRng::from_entropy(), 10, 30);
        let mut wire = Vec::new();
        enc.encode(&frames, &mut wire);
        wire
    }

    fn candidates(secret: &str) -> (Vec<Arc<Table>>, Vec<Option<AeadCipher>>) {
        let patterns = vec!["xpxvvpvv".to_string(), "xxppvvvv".to_string(), "vvppxvxv".to_string()];
        let tables = Table::build_set(secret, "entropy", None, &patterns).unwrap();
        let key = derive_aead_key(secret, AeadMethod::ChaCha20Poly1305).unwrap();
        let ciphers = tables
            .iter()
            .map(|_| Some(AeadCipher::new(AeadMethod::ChaCha20Poly1305, &key).unwrap()))
            .collect();
        (tables, ciphers)
    }

    #[test]
    fn test_probe_selects_used_table() {
        let secret = "probe secret";
        let (tables, ciphers) = candidates(secret);
        let tag = handshake_tag(secret);
        let now = 1_700_000_000i64;

        for used in 0..tables.len() {
            let wire = encode_client_hello(&tables[used], secret, Some(used as u8), now);
            let mut alive = vec![true; tables.len()];
            let selected = probe_all(&wire, &tables, &ciphers, &mut alive, &tag, MODE_PURE, now)
                .unwrap()
                .expect("full hello must select");
            assert_eq!(selected.0, used);
            assert_eq!(selected.1, used as u8);
        }
    }

    #[test]
    fn test_probe_ignores_corrupted_index_hint() {
        let secret = "probe hint secret";
        let (tables, ciphers) = candidates(secret);
        let tag = handshake_tag(secret);
        let now = 1_700_000_000i64;

        // Client lies about its table index; selection must still follow
        // the bytes, not the hint.
        let wire = encode_client_hello(&tables[2], secret, Some(0), now);
        let mut alive = vec![true; tables.len()];
        let (selected, hint) =
            probe_all(&wire, &tables, &ciphers, &mut alive, &tag, MODE_PURE, now)
                .unwrap()
                .expect("must select despite bad hint");
        assert_eq!(selected, 2);
        assert_eq!(hint, 0);
    }

    #[test]
    fn test_probe_needs_more_on_truncated_prefix() {
        let secret = "probe trunc secret";
        let (tables, ciphers) = candidates(secret);
        let tag = handshake_tag(secret);
        let now = 1_700_000_000i64;

        let wire = encode_client_hello(&tables[1], secret, None, now);
        let mut alive = vec![true; tables.len()];
        // A short prefix must not select nor kill every candidate.
        let result = probe_all(
            &wire[..8],
            &tables,
            &ciphers,
            &mut alive,
            &tag,
            MODE_PURE,
            now,
        )
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_probe_rejects_stale_timestamp() {
        let secret = "probe stale secret";
        let (tables, ciphers) = candidates(secret);
        let tag = handshake_tag(secret);
        let now = 1_700_000_000i64;

        // Single candidate so the outcome is a deterministic failure: a
        // wrong-layout candidate can legitimately sit in NeedMore instead.
        let wire = encode_client_hello(&tables[0], secret, None, now - 61);
        let mut alive = vec![true];
        assert!(matches!(
            probe_all(
                &wire,
                &tables[..1],
                &ciphers[..1],
                &mut alive,
                &tag,
                MODE_PURE,
                now
            ),
            Err(Error::TableProbeFailed)
        ));

        // At exactly 60 seconds of skew the candidate still passes.
        let wire = encode_client_hello(&tables[0], secret, None, now - 60);
        let mut alive = vec![true];
        assert!(probe_all(
            &wire,
            &tables[..1],
            &ciphers[..1],
            &mut alive,
            &tag,
            MODE_PURE,
            now
        )
        .unwrap()
        .is_some());
    }

    #[test]
    fn test_probe_rejects_wrong_key() {
        let secret = "probe key secret";
        let (tables, ciphers) = candidates(secret);
        let now = 1_700_000_000i64;

        let wire = encode_client_hello(&tables[0], secret, None, now);
        let wrong_tag = handshake_tag("someone else");
        let mut alive = vec![true];
        // Same table but a different expected tag: AEAD still opens, the
        // tag comparison kills it.
        let result = probe_all(
            &wire,
            &tables[..1],
            &ciphers[..1],
            &mut alive,
            &wrong_tag,
            MODE_PURE,
            now,
        );
        assert!(matches!(result, Err(Error::TableProbeFailed)));
    }
}
