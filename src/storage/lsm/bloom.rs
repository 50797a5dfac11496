//! Bloom filter for fast negative block lookups
//!
//! ## Performance
//! - False positive rate: ~1% (10 bits/key)
//! - Lookup: O(k) bit probes, k = bits_per_key * ln(2)
//!
//! Filters are persisted, so probe positions come from CRC32 double hashing
//! (`h1 + i * h2`) rather than `DefaultHasher`, whose output may change
//! between toolchains.

use crate::storage::checksum::Checksum;

/// Smallest bit array, keeps tiny blocks from degenerating
const MIN_BITS: usize = 64;

const SEED_PRIMARY: u32 = 0;
const SEED_SECONDARY: u32 = 0x9E37_79B9;

/// Serialized header: num_hashes (u32) + num_bits (u64)
const HEADER_LEN: usize = 12;

#[derive(Clone, Debug)]
pub struct BloomFilter {
    /// Bit array
    bits: Vec<u8>,

    /// Number of hash functions
    num_hashes: u32,

    /// Number of bits
    num_bits: usize,
}

impl BloomFilter {
    /// Create an empty filter sized for `num_keys` keys
    pub fn new(num_keys: usize, bits_per_key: usize) -> Self {
        let num_bits = (num_keys * bits_per_key).max(MIN_BITS);
        let num_bytes = num_bits.div_ceil(8);

        // Optimal number of hash functions: k = (m/n) * ln(2)
        let num_hashes = ((bits_per_key as f64) * 0.693).ceil() as u32;
        let num_hashes = num_hashes.clamp(1, 30);

        Self {
            bits: vec![0u8; num_bytes],
            num_hashes,
            num_bits: num_bytes * 8,
        }
    }

    /// Build a filter over `keys`
    pub fn build<'a, I>(keys: I, num_keys: usize, bits_per_key: usize) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut filter = Self::new(num_keys, bits_per_key);
        for key in keys {
            filter.insert(key);
        }
        filter
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..self.num_hashes {
            let bit_pos = self.probe(h1, h2, i);
            self.set_bit(bit_pos);
        }
    }

    /// Check if key might exist (false positives possible, false negatives not)
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hash_pair(key);
        for i in 0..self.num_hashes {
            let bit_pos = self.probe(h1, h2, i);
            if !self.get_bit(bit_pos) {
                return false;
            }
        }
        true
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.byte_size());
        buf.extend_from_slice(&self.num_hashes.to_le_bytes());
        buf.extend_from_slice(&(self.num_bits as u64).to_le_bytes());
        buf.extend_from_slice(&self.bits);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }

        let num_hashes = u32::from_le_bytes(data[0..4].try_into().ok()?);
        let num_bits = u64::from_le_bytes(data[4..12].try_into().ok()?) as usize;
        let bits = data[HEADER_LEN..].to_vec();

        if num_hashes == 0 || num_bits == 0 || bits.len() * 8 < num_bits {
            return None;
        }

        Some(Self {
            bits,
            num_hashes,
            num_bits,
        })
    }

    pub fn byte_size(&self) -> usize {
        HEADER_LEN + self.bits.len()
    }

    // Internal helpers

    fn hash_pair(key: &[u8]) -> (u64, u64) {
        let h1 = Checksum::seeded(SEED_PRIMARY, key) as u64;
        // Odd step so successive probes never collapse onto one bit
        let h2 = (Checksum::seeded(SEED_SECONDARY, key) as u64) | 1;
        (h1, h2)
    }

    fn probe(&self, h1: u64, h2: u64, i: u32) -> usize {
        (h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits as u64) as usize
    }

    fn set_bit(&mut self, pos: usize) {
        self.bits[pos / 8] |= 1 << (pos % 8);
    }

    fn get_bit(&self, pos: usize) -> bool {
        (self.bits[pos / 8] & (1 << (pos % 8))) != 0
    }
}
