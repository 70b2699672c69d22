//! Bloom filter used to skip sorted runs that certainly lack a key.
//!
//! Sized from the expected entry count `n` and target false-positive rate
//! `p`: `m = ⌈-n·ln(p)/(ln 2)²⌉` bits and `k = max(1, round(m/n·ln 2))`
//! probes. Probing uses double hashing, `h_i = h1 + i·h2`, over a
//! MurmurHash-style byte mixer, so no false negatives are possible: a key
//! that was added always finds all of its bits set.

use crate::codec::{self, BloomFilterData};
use crate::error::Result;

pub struct BloomFilter {
    bits: Vec<u8>,
    bit_size: usize,
    num_hashes: u32,
}

impl BloomFilter {
    /// Creates a filter sized for `expected_entries` at the given
    /// false-positive rate.
    pub fn new(expected_entries: usize, false_positive_rate: f64) -> Self {
        let n = expected_entries.max(1) as f64;
        let p = false_positive_rate.clamp(1e-9, 0.5);

        let ln2 = std::f64::consts::LN_2;
        let bit_size = ((-n * p.ln()) / (ln2 * ln2)).ceil() as usize;
        let bit_size = bit_size.max(64);
        let num_hashes = ((bit_size as f64 / n) * ln2).round() as u32;
        let num_hashes = num_hashes.max(1);

        Self {
            bits: vec![0u8; bit_size.div_ceil(8)],
            bit_size,
            num_hashes,
        }
    }

    /// Rebuilds a filter from its serialized parameters.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let decoded = codec::decode_bloom_filter(data)?;
        let bit_size = decoded.bit_size as usize;
        if decoded.bits.len() * 8 < bit_size {
            return crate::errcorrupt!(
                "bloom filter bit array of {} bytes cannot hold {bit_size} bits",
                decoded.bits.len()
            );
        }
        Ok(Self {
            bits: decoded.bits,
            bit_size,
            num_hashes: decoded.num_hashes,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        codec::encode_bloom_filter(&BloomFilterData {
            bit_size: self.bit_size as u32,
            num_hashes: self.num_hashes,
            bits: self.bits.clone(),
        })
    }

    /// Adds a key to the filter.
    pub fn add(&mut self, key: &[u8]) {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..self.num_hashes {
            let pos = self.position(h1, h2, i);
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
    }

    /// Returns false iff the key is definitely absent.
    pub fn might_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..self.num_hashes {
            let pos = self.position(h1, h2, i);
            if self.bits[pos / 8] & (1 << (pos % 8)) == 0 {
                return false;
            }
        }
        true
    }

    pub fn bit_size(&self) -> usize {
        self.bit_size
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    fn position(&self, h1: u32, h2: u32, i: u32) -> usize {
        let h = h1.wrapping_add(i.wrapping_mul(h2));
        h as usize % self.bit_size
    }

    fn hash_pair(key: &[u8]) -> (u32, u32) {
        let h1 = Self::mix(key, 0);
        let h2 = Self::mix(key, h1);
        (h1, h2)
    }

    fn mix(data: &[u8], seed: u32) -> u32 {
        let mut h = seed;
        for &b in data {
            h ^= b as u32;
            h = h.wrapping_mul(0x5bd1_e995);
            h ^= h >> 15;
        }
        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::new(1000, 0.01);
        for i in 0..1000 {
            filter.add(format!("key{i:03}").as_bytes());
        }
        for i in 0..1000 {
            assert!(
                filter.might_contain(format!("key{i:03}").as_bytes()),
                "false negative for key{i:03}"
            );
        }
    }

    #[test]
    fn test_absent_keys_mostly_rejected() {
        let mut filter = BloomFilter::new(1000, 0.01);
        for i in 0..1000 {
            filter.add(format!("key{i:03}").as_bytes());
        }

        let mut false_positives = 0;
        for i in 0..1000 {
            if filter.might_contain(format!("other{i:03}").as_bytes()) {
                false_positives += 1;
            }
        }
        // 1% target; allow generous slack to keep the test deterministic
        // across hash behavior changes.
        assert!(
            false_positives < 50,
            "false positive rate too high: {false_positives}/1000"
        );
    }

    #[test]
    fn test_sizing() {
        let filter = BloomFilter::new(1000, 0.01);
        // ~9.585 bits per entry at 1%.
        assert!(filter.bit_size() >= 9000 && filter.bit_size() <= 10500);
        assert!(filter.num_hashes() >= 5 && filter.num_hashes() <= 9);

        // Degenerate inputs still produce a usable filter.
        let tiny = BloomFilter::new(0, 0.01);
        assert!(tiny.bit_size() >= 64);
        assert!(tiny.num_hashes() >= 1);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut filter = BloomFilter::new(100, 0.01);
        for i in 0..100 {
            filter.add(format!("entry-{i}").as_bytes());
        }

        let bytes = filter.to_bytes().unwrap();
        let restored = BloomFilter::from_bytes(&bytes).unwrap();
        assert_eq!(restored.bit_size(), filter.bit_size());
        assert_eq!(restored.num_hashes(), filter.num_hashes());
        for i in 0..100 {
            assert!(restored.might_contain(format!("entry-{i}").as_bytes()));
        }
    }
}
