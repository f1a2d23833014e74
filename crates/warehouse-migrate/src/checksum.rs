//! Checksums and order-independent hash aggregates.
//!
//! Two distinct mechanisms live here:
//!
//! - [`PartitionDigest`]: a streaming SHA-256 over canonical row bytes,
//!   computed by the extractor as it writes a staged partition. Order
//!   dependent by design — it fingerprints the staged files themselves.
//! - [`value_hash`] / [`combine`]: the per-value hash and its commutative
//!   aggregate used for validation. Aggregates are sums modulo a Mersenne
//!   prime, so row order never affects the result and source/target can
//!   scan in whatever order their planners prefer.

use sha2::{Digest, Sha256};

use crate::value::{write_row_canonical, Row, Value};

/// Modulus for column hash aggregates (2^61 - 1, prime).
pub const HASH_PRIME: u64 = (1 << 61) - 1;

/// Hash a single value into the aggregate domain `[0, HASH_PRIME)`.
pub fn value_hash(value: &Value) -> u64 {
    let digest = Sha256::digest(value.canonical_bytes());
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(word) % HASH_PRIME
}

/// Fold one value hash into a running column aggregate.
///
/// Commutative and associative; both operands must already be reduced
/// modulo [`HASH_PRIME`], which keeps the sum within u64 range.
pub fn combine(acc: u64, hash: u64) -> u64 {
    (acc + hash) % HASH_PRIME
}

/// Streaming digest over the rows of one staged partition.
#[derive(Debug)]
pub struct PartitionDigest {
    hasher: Sha256,
    rows: u64,
    buf: Vec<u8>,
}

impl PartitionDigest {
    /// Create an empty digest.
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
            rows: 0,
            buf: Vec::new(),
        }
    }

    /// Fold one row into the digest.
    pub fn update(&mut self, row: &Row) {
        self.buf.clear();
        write_row_canonical(row, &mut self.buf);
        self.hasher.update(&self.buf);
        self.rows += 1;
    }

    /// Finish, returning the hex checksum and the row count.
    pub fn finalize(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.rows)
    }
}

impl Default for PartitionDigest {
    fn default() -> Self {
        Self::new()
    }
}
