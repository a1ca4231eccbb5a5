//! Pure, side-effect-free payload mutation used to produce the "control"
//! variant of a replay.
//!
//! [`Action`] mirrors the upstream `sModify`/`cModify` dispatch; `apply`
//! and [`mutate_sequence`] are the two entry points other components call.

use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// A half-open byte range `[start, end)` within a payload.
pub type Region = (usize, usize);

/// One mutation, as received over the side channel in step 2 of the
/// side-channel sequence (`[packetIndex, action, params]`).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "PascalCase")]
pub enum Action {
    /// Replace the payload with `N` uniformly random bytes, `N` = original
    /// length.
    Random,
    /// Bit-complement every byte of the payload.
    Invert,
    /// Remove the packet from its flow. If it is the flow's first packet,
    /// it is replaced rather than removed (see [`mutate_sequence`]).
    Delete,
    /// Insert `count` copies of a `len`-byte random payload at the head of
    /// the flow. Deterministic: seeded from the action's name.
    Prepend {
        /// Number of copies to insert.
        count: usize,
        /// Length in bytes of each inserted payload.
        len: usize,
    },
    /// Within each region, substitute random bytes.
    ReplaceR {
        /// Byte ranges to replace.
        regions: Vec<Region>,
    },
    /// Within each region, bit-invert the existing bytes.
    ReplaceI {
        /// Byte ranges to invert.
        regions: Vec<Region>,
    },
    /// Within each region, substitute the given literal text.
    ReplaceW {
        /// Byte ranges to replace.
        regions: Vec<Region>,
        /// Literal bytes written into each region.
        text: Vec<u8>,
    },
}

/// A mutation, targeting a specific zero-based packet index within a flow.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Mutation {
    /// Index, within the flow's client event sequence, that this mutation
    /// targets. `0` means "no mutation" in the wire format this is
    /// deserialized from; callers should treat `packet_index == 0` as a
    /// no-op, matching the upstream convention.
    pub packet_index: usize,
    /// The mutation to apply.
    pub action: Action,
}

/// Applies a single-payload mutation (anything other than [`Action::Delete`]
/// or [`Action::Prepend`], which act on the whole sequence, not one
/// payload) to `payload`, returning the mutated bytes.
///
/// Ranges in `ReplaceR`/`ReplaceI`/`ReplaceW` that fall outside
/// `[0, payload.len())` leave `payload` unchanged for that region.
#[must_use]
pub fn apply(payload: &[u8], action: &Action) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    match action {
        Action::Random => (0..payload.len()).map(|_| rng.gen()).collect(),
        Action::Invert => payload.iter().map(|b| !b).collect(),
        Action::ReplaceR { regions } => {
            let mut out = payload.to_vec();
            for &(l, r) in regions {
                if let Some(slice) = out.get_mut(bounded(l, r, out.len())) {
                    for b in slice {
                        *b = rng.gen();
                    }
                }
            }
            out
        }
        Action::ReplaceI { regions } => {
            let mut out = payload.to_vec();
            for &(l, r) in regions {
                if let Some(slice) = out.get_mut(bounded(l, r, out.len())) {
                    for b in slice {
                        *b = !*b;
                    }
                }
            }
            out
        }
        Action::ReplaceW { regions, text } => {
            let mut out = payload.to_vec();
            for &(l, r) in regions {
                let range = bounded(l, r, out.len());
                if range.end <= out.len() && range.start <= range.end {
                    let width = range.end - range.start;
                    let n = width.min(text.len());
                    out[range.start..range.start + n]
                        .copy_from_slice(&text[..n]);
                }
            }
            out
        }
        Action::Delete | Action::Prepend { .. } => payload.to_vec(),
    }
}

fn bounded(l: usize, r: usize, len: usize) -> std::ops::Range<usize> {
    if l >= r || r > len {
        // Out-of-range: collapse to an empty range so callers leave the
        // payload untouched, per spec.
        0..0
    } else {
        l..r
    }
}

/// A byte-alphabet used for `Delete`'s first-packet substitute and
/// `Prepend`'s inserted filler, matching the upstream's "random
/// alphanumeric character" choice.
const ALPHANUMERIC: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

fn random_alphanumeric(rng: &mut impl Rng, len: usize) -> Vec<u8> {
    (0..len).map(|_| ALPHANUMERIC[rng.gen_range(0..ALPHANUMERIC.len())]).collect()
}

/// Applies a sequence-level mutation (any [`Action`]) to `payloads`, the
/// ordered payload bytes of one flow's client events.
///
/// `Random`/`Invert`/`ReplaceR`/`ReplaceI`/`ReplaceW` mutate the payload at
/// `mutation.packet_index` in place. `Delete` removes that payload, unless
/// it is index `0` (the flow's first packet), in which case it is replaced
/// with a single random alphanumeric byte so the flow still has something
/// to open with. `Prepend` inserts `count` copies of a `len`-byte
/// deterministically-seeded random payload at the head of the sequence,
/// leaving `packet_index` unused.
pub fn mutate_sequence(payloads: &mut Vec<Vec<u8>>, mutation: &Mutation) {
    match &mutation.action {
        Action::Delete => {
            if mutation.packet_index == 0 {
                if let Some(first) = payloads.first_mut() {
                    *first = random_alphanumeric(&mut rand::thread_rng(), 1);
                }
            } else if mutation.packet_index < payloads.len() {
                payloads.remove(mutation.packet_index);
            }
        }
        Action::Prepend { count, len } => {
            let mut rng = seeded_rng("Prepend");
            let filler = random_alphanumeric(&mut rng, *len);
            for _ in 0..*count {
                payloads.insert(0, filler.clone());
            }
        }
        other => {
            if let Some(p) = payloads.get_mut(mutation.packet_index) {
                *p = apply(p, other);
            }
        }
    }
}

/// Deterministic RNG seeded from an action's name, matching the upstream's
/// `random.seed(self.action)` call for `Prepend`.
fn seeded_rng(action_name: &str) -> StdRng {
    let mut seed = [0_u8; 32];
    for (i, b) in action_name.bytes().enumerate().take(32) {
        seed[i] = b;
    }
    StdRng::from_seed(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invert_twice_is_identity() {
        let payload = b"hello world".to_vec();
        let once = apply(&payload, &Action::Invert);
        let twice = apply(&once, &Action::Invert);
        assert_eq!(twice, payload);
    }

    #[test]
    fn replace_w_with_original_bytes_is_identity() {
        let payload = b"0123456789".to_vec();
        let action = Action::ReplaceW {
            regions: vec![(2, 5)],
            text: payload[2..5].to_vec(),
        };
        assert_eq!(apply(&payload, &action), payload);
    }

    #[test]
    fn out_of_range_region_leaves_payload_unchanged() {
        let payload = b"short".to_vec();
        let action = Action::ReplaceR {
            regions: vec![(10, 20)],
        };
        assert_eq!(apply(&payload, &action), payload);
    }

    #[test]
    fn random_preserves_length() {
        let payload = vec![0_u8; 64];
        let mutated = apply(&payload, &Action::Random);
        assert_eq!(mutated.len(), payload.len());
    }

    #[test]
    fn delete_removes_non_first_packet() {
        let mut payloads = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
        mutate_sequence(
            &mut payloads,
            &Mutation { packet_index: 1, action: Action::Delete },
        );
        assert_eq!(payloads, vec![b"a".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn delete_first_packet_substitutes_one_byte() {
        let mut payloads = vec![b"hello".to_vec(), b"world".to_vec()];
        mutate_sequence(
            &mut payloads,
            &Mutation { packet_index: 0, action: Action::Delete },
        );
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0].len(), 1);
        assert!(payloads[0][0].is_ascii_alphanumeric());
    }

    #[test]
    fn prepend_is_deterministic() {
        let mut a = vec![b"x".to_vec()];
        let mut b = vec![b"x".to_vec()];
        let action = Action::Prepend { count: 2, len: 8 };
        mutate_sequence(&mut a, &Mutation { packet_index: 0, action: action.clone() });
        mutate_sequence(&mut b, &Mutation { packet_index: 0, action });
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
    }
}
