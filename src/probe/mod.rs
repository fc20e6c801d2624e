// Persisted probabilistic structures
//
// Fast membership probes over KV-backed state: the sharded bit array,
// the partitioned bloom filter built on it, the exact truncated-hash
// store, and the new-page approver that answers "did we already mark
// this URL as private?".

pub mod approver;
pub mod bitarray;
pub mod bloom;
pub mod hashes;

pub use approver::NewPageApprover;
pub use bitarray::PersistedBitarray;
pub use bloom::PersistedBloomFilter;
pub use hashes::{parse_persisted_key, to_persisted_key, PersistedHashes};
