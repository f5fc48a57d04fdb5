//! Prompt fingerprinting.
//!
//! A prompt is identified by the xxHash64 (seed 0) of the little-endian
//! byte representation of its 32-bit token IDs. Uploaders and readers must
//! agree on this exact byte layout: it is the registry key that makes a
//! worker's lookup land on the tree a trainer uploaded.

use xxhash_rust::xxh64::xxh64;

use crate::suffix_tree::Token;

/// Compute the registry fingerprint for a prompt.
pub fn prompt_fingerprint(tokens: &[Token]) -> u64 {
    let mut bytes = Vec::with_capacity(tokens.len() * 4);
    for t in tokens {
        bytes.extend_from_slice(&t.to_le_bytes());
    }
    xxh64(&bytes, 0)
}
