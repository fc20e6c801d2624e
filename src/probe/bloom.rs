// Partitioned bloom filter over the persisted bit array
//
// Three coprime partitions, one bit set per partition per key. With ~1M
// bits the false-positive rate stays low for the intended population
// (URLs marked as private, quorum votes already cast).

use crate::digest::md5_bytes;
use crate::error::Result;
use crate::probe::bitarray::PersistedBitarray;
use crate::storage::KvStorage;
use std::sync::Arc;

/// Coprime partition sizes; the array length is their sum.
pub const PARTITION_SIZES: [usize; 3] = [333_323, 333_331, 333_337];

pub struct PersistedBloomFilter {
    bits: PersistedBitarray,
}

impl PersistedBloomFilter {
    pub fn new(
        name: impl Into<String>,
        version: u32,
        storage: Arc<dyn KvStorage>,
    ) -> Result<Self> {
        let n_bits = PARTITION_SIZES.iter().sum();
        Ok(Self {
            bits: PersistedBitarray::new(name, version, n_bits, storage)?,
        })
    }

    /// One position per partition, derived from the md5 of the key.
    fn positions(key: &str) -> [usize; 3] {
        let digest = md5_bytes(key);
        let h1 = u64::from_be_bytes(digest[0..8].try_into().unwrap());
        let h2 = u64::from_be_bytes(digest[8..16].try_into().unwrap());
        let hashes = [h1, h2, h1.wrapping_add(h2)];

        let mut positions = [0usize; 3];
        let mut offset = 0;
        for (i, (hash, size)) in hashes.iter().zip(PARTITION_SIZES.iter()).enumerate() {
            positions[i] = offset + (*hash % *size as u64) as usize;
            offset += size;
        }
        positions
    }

    pub async fn add(&self, key: &str) -> Result<()> {
        for pos in Self::positions(key) {
            self.bits.set(pos).await?;
        }
        Ok(())
    }

    /// `false` is definitive; `true` may be a false positive.
    pub async fn test(&self, key: &str) -> Result<bool> {
        for pos in Self::positions(key) {
            if !self.bits.test(pos).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn flush(&self) -> Result<()> {
        self.bits.flush().await
    }

    pub async fn clear(&self) -> Result<()> {
        self.bits.clear().await
    }
}
