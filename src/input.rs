use rand::Rng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha12Rng;
use std::path::Path;

use crate::error::{Error, Result};

/// Read a cleartext input file of whitespace-separated non-negative integers.
pub fn read_input<P: AsRef<Path>>(path: P) -> Result<Vec<u64>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Input(format!("cannot read {}: {e}", path.display())))?;

    let mut values = Vec::new();
    for token in content.split_whitespace() {
        if token.starts_with('-') {
            return Err(Error::Input(format!(
                "negative integer '{token}' in {}",
                path.display()
            )));
        }
        let value: u64 = token.parse().map_err(|_| {
            Error::Input(format!("invalid token '{token}' in {}", path.display()))
        })?;
        values.push(value);
    }

    if values.is_empty() {
        return Err(Error::Input(format!("empty input file {}", path.display())));
    }
    Ok(values)
}

/// Number of bits needed to represent `value`, at least 1.
pub fn bit_length(value: u64) -> usize {
    (64 - value.leading_zeros()).max(1) as usize
}

/// Cardinality offered during negotiation: the true length scaled by a
/// uniform factor in `[1, length]` so the peer cannot recover it.
pub fn scaled_length(length: usize, rng: &mut ChaCha12Rng) -> usize {
    length * rng.random_range(1..=length)
}

/// Pad `values` with zeros up to `target_len` and shuffle.
///
/// Zero is neutral for `max` over non-negative integers. If the list is
/// already long enough it is returned untouched.
pub fn expand_and_shuffle(values: &[u64], target_len: usize, rng: &mut ChaCha12Rng) -> Vec<u64> {
    let mut padded = values.to_vec();
    if target_len <= padded.len() {
        return padded;
    }
    padded.resize(target_len, 0);
    padded.shuffle(rng);
    padded
}

/// MSB-first bits of `value`, `width` bits wide.
pub fn bits(value: u64, width: usize) -> Vec<u8> {
    (0..width).rev().map(|i| ((value >> i) & 1) as u8).collect()
}

/// Concatenated MSB-first encodings of all `values` at `width` bits each.
pub fn encode_values(values: &[u64], width: usize) -> Vec<u8> {
    values.iter().flat_map(|&v| bits(v, width)).collect()
}

/// Reassemble an integer from MSB-first bits.
pub fn value_from_bits(bits: &[u8]) -> u64 {
    bits.iter().fold(0, |acc, &b| (acc << 1) | u64::from(b))
}
