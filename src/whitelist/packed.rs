// Packed bloom filter wire format
//
// The server ships the query-string whitelist as one contiguous blob:
//
//   [uint32_be n_buckets][uint8 n_hashes][uint32_be bucket_0]...
//
// Buckets are 32-bit words; positions are derived by double hashing the
// md5 of the key. One-day diffs use the same layout and merge by OR-ing
// the words.

use crate::digest::md5_bytes;
use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct PackedBloomFilter {
    n_buckets: u32,
    n_hashes: u8,
    buckets: Vec<u32>,
}

impl PackedBloomFilter {
    /// Empty filter, mainly for building fixtures and diffs.
    pub fn empty(n_buckets: u32, n_hashes: u8) -> Result<Self> {
        if n_buckets == 0 || n_hashes == 0 {
            return Err(Error::Corruption("degenerate bloom dimensions".into()));
        }
        Ok(Self {
            n_buckets,
            n_hashes,
            buckets: vec![0; n_buckets as usize],
        })
    }

    /// Parse the packed wire format.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Corruption("bloom blob shorter than header".into()));
        }
        let n_buckets = u32::from_be_bytes(data[0..4].try_into().unwrap());
        let n_hashes = data[4];
        if n_buckets == 0 || n_hashes == 0 {
            return Err(Error::Corruption("degenerate bloom dimensions".into()));
        }
        let expected = HEADER_LEN + n_buckets as usize * 4;
        if data.len() != expected {
            return Err(Error::Corruption(format!(
                "bloom blob length {} != expected {expected}",
                data.len()
            )));
        }

        let buckets = data[HEADER_LEN..]
            .chunks_exact(4)
            .map(|chunk| u32::from_be_bytes(chunk.try_into().unwrap()))
            .collect();
        Ok(Self {
            n_buckets,
            n_hashes,
            buckets,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.buckets.len() * 4);
        out.extend_from_slice(&self.n_buckets.to_be_bytes());
        out.push(self.n_hashes);
        for bucket in &self.buckets {
            out.extend_from_slice(&bucket.to_be_bytes());
        }
        out
    }

    fn bit_count(&self) -> u64 {
        u64::from(self.n_buckets) * 32
    }

    fn bit_positions(&self, key: &str) -> impl Iterator<Item = u64> + '_ {
        let digest = md5_bytes(key);
        let h1 = u64::from_be_bytes(digest[0..8].try_into().unwrap());
        let h2 = u64::from_be_bytes(digest[8..16].try_into().unwrap());
        let bits = self.bit_count();
        (0..u64::from(self.n_hashes)).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % bits)
    }

    pub fn contains(&self, key: &str) -> bool {
        let positions: Vec<u64> = self.bit_positions(key).collect();
        positions.into_iter().all(|pos| {
            let word = (pos / 32) as usize;
            self.buckets[word] & (1u32 << (pos % 32)) != 0
        })
    }

    pub fn insert(&mut self, key: &str) {
        let positions: Vec<u64> = self.bit_positions(key).collect();
        for pos in positions {
            let word = (pos / 32) as usize;
            self.buckets[word] |= 1u32 << (pos % 32);
        }
    }

    /// OR-merge a diff blob of identical dimensions.
    pub fn merge(&mut self, diff: &PackedBloomFilter) -> Result<()> {
        if self.n_buckets != diff.n_buckets || self.n_hashes != diff.n_hashes {
            return Err(Error::Corruption("bloom diff dimensions mismatch".into()));
        }
        for (word, diff_word) in self.buckets.iter_mut().zip(diff.buckets.iter()) {
            *word |= diff_word;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_roundtrip() {
        let mut filter = PackedBloomFilter::empty(64, 7).unwrap();
        filter.insert("example.com");
        filter.insert("tracker.example");

        let parsed = PackedBloomFilter::from_bytes(&filter.to_bytes()).unwrap();
        assert_eq!(parsed, filter);
        assert!(parsed.contains("example.com"));
        assert!(parsed.contains("tracker.example"));
        assert!(!parsed.contains("other.example"));
    }

    #[test]
    fn rejects_truncated_and_oversized_blobs() {
        assert!(PackedBloomFilter::from_bytes(&[]).is_err());
        assert!(PackedBloomFilter::from_bytes(&[0, 0, 0, 1]).is_err());

        let filter = PackedBloomFilter::empty(4, 2).unwrap();
        let mut bytes = filter.to_bytes();
        bytes.push(0);
        assert!(PackedBloomFilter::from_bytes(&bytes).is_err());
        bytes.truncate(bytes.len() - 3);
        assert!(PackedBloomFilter::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_degenerate_dimensions() {
        assert!(PackedBloomFilter::from_bytes(&[0, 0, 0, 0, 3]).is_err());
        let empty_hashes = [0u8, 0, 0, 1, 0, 0, 0, 0, 0];
        assert!(PackedBloomFilter::from_bytes(&empty_hashes).is_err());
    }

    #[test]
    fn merge_is_a_bitwise_or() {
        let mut base = PackedBloomFilter::empty(64, 7).unwrap();
        base.insert("already-known.example");

        let mut diff = PackedBloomFilter::empty(64, 7).unwrap();
        diff.insert("new-today.example");

        base.merge(&diff).unwrap();
        assert!(base.contains("already-known.example"));
        assert!(base.contains("new-today.example"));
    }

    #[test]
    fn merge_rejects_dimension_mismatch() {
        let mut base = PackedBloomFilter::empty(64, 7).unwrap();
        let diff = PackedBloomFilter::empty(32, 7).unwrap();
        assert!(base.merge(&diff).is_err());
    }
}
