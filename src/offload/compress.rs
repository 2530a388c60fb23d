//! Satellite-link payload compression.
//!
//! Container: the 4-byte magic `QCMP`, a 32-bit little-endian original
//! size, then a stream of tagged records. `0x00` introduces one literal
//! byte; `0x01` introduces a back-reference of 2-byte little-endian
//! distance (1-4096) and 1-byte length. References may overlap their own
//! output, so copies proceed byte by byte.
//!
//! The accelerator implements the same format in gateware; this module is
//! its software twin and the reference for the round-trip guarantee:
//! `decompress(compress(b)) == b` for every byte sequence `b`.

use rustc_hash::FxHashMap;
use thiserror::Error;

pub const MAGIC: [u8; 4] = *b"QCMP";
const HEADER_LEN: usize = 8;

/// Sliding dictionary size; distances never exceed it.
const WINDOW: usize = 4096;
/// Shortest back-reference worth a 4-byte record.
const MIN_MATCH: usize = 4;
/// Longest length a one-byte field can carry.
const MAX_MATCH: usize = 255;
/// Hash-chain probes per position; bounds worst-case compress time.
const MAX_PROBES: usize = 32;

const FLAG_LITERAL: u8 = 0x00;
const FLAG_MATCH: u8 = 0x01;

#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum CompressError {
    #[error("missing or wrong container magic")]
    BadMagic,
    #[error("record extends past the end of the container")]
    Truncated,
    #[error("back-reference distance outside the produced output")]
    BadDistance,
    #[error("unknown record flag {0:#04x}")]
    BadFlag(u8),
    #[error("output does not match the declared original size")]
    SizeMismatch,
}

fn hash4(window: &[u8]) -> u32 {
    u32::from_le_bytes([window[0], window[1], window[2], window[3]])
        .wrapping_mul(0x9e37_79b1)
}

/// Compress `input` into a fresh container.
///
/// Greedy longest-match over hash chains; any strategy is acceptable as
/// long as decompression inverts it exactly.
pub fn compress(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + input.len() + input.len() / 8);
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&(input.len() as u32).to_le_bytes());

    let mut head: FxHashMap<u32, usize> = FxHashMap::default();
    let mut prev = vec![usize::MAX; input.len()];
    let mut pos = 0;

    let mut insert = |head: &mut FxHashMap<u32, usize>, prev: &mut Vec<usize>, at: usize| {
        if at + MIN_MATCH <= input.len() {
            let h = hash4(&input[at..]);
            prev[at] = head.insert(h, at).unwrap_or(usize::MAX);
        }
    };

    while pos < input.len() {
        let mut best_len = 0;
        let mut best_dist = 0;
        if pos + MIN_MATCH <= input.len() {
            let h = hash4(&input[pos..]);
            let floor = pos.saturating_sub(WINDOW);
            let mut candidate = head.get(&h).copied().unwrap_or(usize::MAX);
            let mut probes = 0;
            while candidate != usize::MAX && candidate >= floor && probes < MAX_PROBES {
                let limit = MAX_MATCH.min(input.len() - pos);
                let mut len = 0;
                while len < limit && input[candidate + len] == input[pos + len] {
                    len += 1;
                }
                if len > best_len {
                    best_len = len;
                    best_dist = pos - candidate;
                }
                candidate = prev[candidate];
                probes += 1;
            }
        }

        if best_len >= MIN_MATCH {
            out.push(FLAG_MATCH);
            out.extend_from_slice(&(best_dist as u16).to_le_bytes());
            out.push(best_len as u8);
            for at in pos..pos + best_len {
                insert(&mut head, &mut prev, at);
            }
            pos += best_len;
        } else {
            out.push(FLAG_LITERAL);
            out.push(input[pos]);
            insert(&mut head, &mut prev, pos);
            pos += 1;
        }
    }
    out
}

/// Expand a container produced by [`compress`] (or the accelerator).
pub fn decompress(input: &[u8]) -> Result<Vec<u8>, CompressError> {
    if input.len() < HEADER_LEN || input[..4] != MAGIC {
        return Err(CompressError::BadMagic);
    }
    let declared = u32::from_le_bytes([input[4], input[5], input[6], input[7]]) as usize;
    let mut out = Vec::with_capacity(declared.min(1 << 20));

    let mut pos = HEADER_LEN;
    while pos < input.len() {
        match input[pos] {
            FLAG_LITERAL => {
                let byte = *input.get(pos + 1).ok_or(CompressError::Truncated)?;
                out.push(byte);
                pos += 2;
            }
            FLAG_MATCH => {
                let record = input.get(pos + 1..pos + 4).ok_or(CompressError::Truncated)?;
                let dist = u16::from_le_bytes([record[0], record[1]]) as usize;
                let len = record[2] as usize;
                if dist == 0 || dist > WINDOW || dist > out.len() || len == 0 {
                    return Err(CompressError::BadDistance);
                }
                for _ in 0..len {
                    out.push(out[out.len() - dist]);
                }
                pos += 4;
            }
            flag => return Err(CompressError::BadFlag(flag)),
        }
    }

    if out.len() != declared {
        return Err(CompressError::SizeMismatch);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore, SeedableRng};

    fn round_trip(input: &[u8]) {
        let packed = compress(input);
        assert_eq!(decompress(&packed).unwrap(), input);
    }

    #[test]
    fn empty_input() {
        let packed = compress(&[]);
        assert_eq!(packed.len(), 8);
        assert_eq!(decompress(&packed).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn short_inputs() {
        round_trip(b"a");
        round_trip(b"abc");
        round_trip(b"abcd");
        round_trip(&[0; 7]);
    }

    #[test]
    fn repetitive_input_shrinks() {
        let input = b"satellite ".repeat(500);
        let packed = compress(&input);
        assert!(packed.len() < input.len() / 2);
        assert_eq!(decompress(&packed).unwrap(), input);
    }

    #[test]
    fn random_input_round_trips() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for len in [1, 63, 4096, 70_000] {
            let mut input = vec![0u8; len];
            rng.fill_bytes(&mut input);
            round_trip(&input);
        }
    }

    #[test]
    fn mixed_megabyte_round_trips() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(13);
        let mut input = Vec::with_capacity(1 << 20);
        while input.len() < 1 << 20 {
            if rng.gen_bool(0.5) {
                let run = vec![rng.gen::<u8>(); rng.gen_range(1..2000)];
                input.extend_from_slice(&run);
            } else {
                let mut noise = vec![0u8; rng.gen_range(1..2000)];
                rng.fill_bytes(&mut noise);
                input.extend_from_slice(&noise);
            }
        }
        input.truncate(1 << 20);
        round_trip(&input);
    }

    #[test]
    fn matches_beyond_the_window_are_not_used() {
        // Identical blocks far enough apart that the second cannot
        // reference the first.
        let mut input = vec![0xabu8; 100];
        input.extend((0..WINDOW).map(|i| (i * 7 + 1) as u8));
        input.extend_from_slice(&[0xabu8; 100]);
        round_trip(&input);
    }

    #[test]
    fn bad_magic_rejected() {
        assert_eq!(decompress(b"QCMQ\0\0\0\0"), Err(CompressError::BadMagic));
        assert_eq!(decompress(b"QC"), Err(CompressError::BadMagic));
    }

    #[test]
    fn truncated_record_rejected() {
        let mut packed = compress(b"xyz");
        packed.truncate(packed.len() - 1);
        assert_eq!(decompress(&packed), Err(CompressError::Truncated));
    }

    #[test]
    fn forward_reference_rejected() {
        let mut packed = Vec::new();
        packed.extend_from_slice(&MAGIC);
        packed.extend_from_slice(&4u32.to_le_bytes());
        packed.extend_from_slice(&[FLAG_MATCH, 0x01, 0x00, 0x04]);
        assert_eq!(decompress(&packed), Err(CompressError::BadDistance));
    }

    #[test]
    fn unknown_flag_rejected() {
        let mut packed = Vec::new();
        packed.extend_from_slice(&MAGIC);
        packed.extend_from_slice(&1u32.to_le_bytes());
        packed.push(0x02);
        assert_eq!(decompress(&packed), Err(CompressError::BadFlag(0x02)));
    }

    #[test]
    fn size_mismatch_rejected() {
        let mut packed = Vec::new();
        packed.extend_from_slice(&MAGIC);
        packed.extend_from_slice(&9u32.to_le_bytes());
        packed.extend_from_slice(&[FLAG_LITERAL, 0x41]);
        assert_eq!(decompress(&packed), Err(CompressError::SizeMismatch));
    }

    #[test]
    fn overlapping_reference_expands() {
        // A single literal followed by a long self-overlapping match is the
        // classic RLE-via-LZ case.
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let byte = rng.gen::<u8>();
        let input = vec![byte; 300];
        let packed = compress(&input);
        assert!(packed.len() < 24);
        assert_eq!(decompress(&packed).unwrap(), input);
    }
}
