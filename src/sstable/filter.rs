//! Bloom-filter meta-block.
//!
//! One filter covers the whole table, keyed by **user** keys, so a point
//! lookup can skip the table without touching any data block. The block
//! stores the `bloomfilter` crate's serialized form verbatim; the
//! surrounding trailer CRC (like every block) detects corruption.

use bloomfilter::Bloom;

use super::SstError;

/// Default false-positive rate for table filters.
pub const BLOOM_FP_RATE: f64 = 0.01;

/// A table-level bloom filter over user keys.
pub struct TableFilter {
    bloom: Bloom<Vec<u8>>,
}

impl std::fmt::Debug for TableFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableFilter").finish_non_exhaustive()
    }
}

impl TableFilter {
    /// Build a filter sized for `keys.len()` user keys.
    pub fn build(keys: &[Vec<u8>]) -> Result<Self, SstError> {
        let mut bloom = Bloom::new_for_fp_rate(keys.len().max(1), BLOOM_FP_RATE)
            .map_err(|e| SstError::InvalidArgument(format!("bloom sizing failed: {e}")))?;
        for key in keys {
            bloom.set(key);
        }
        Ok(Self { bloom })
    }

    /// Reconstruct a filter from its serialized block contents.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SstError> {
        let bloom = Bloom::from_slice(bytes)
            .map_err(|e| SstError::Corruption(format!("undecodable bloom filter: {e}")))?;
        Ok(Self { bloom })
    }

    /// Serialized form stored in the filter block.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bloom.as_slice().to_vec()
    }

    /// Whether the table may contain `user_key`. False means definitely
    /// absent.
    pub fn may_contain(&self, user_key: &[u8]) -> bool {
        self.bloom.check(&user_key.to_vec())
    }
}
