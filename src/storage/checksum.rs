//! CRC32 integrity checks
//!
//! Used by WAL records, SSTable data blocks and the SSTable index section.
//! Trailer format for sealed buffers: `[data][crc32(data): u32 LE]`.

use crate::{Result, StorageError};
use crc32fast::Hasher;

/// Size of a sealed-buffer trailer
pub const CHECKSUM_LEN: usize = 4;

pub struct Checksum;

impl Checksum {
    pub fn compute(data: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// CRC32 continued from `seed`; used for stable, seedable hashing
    pub fn seeded(seed: u32, data: &[u8]) -> u32 {
        let mut hasher = Hasher::new_with_initial(seed);
        hasher.update(data);
        hasher.finalize()
    }

    /// Fails with `Corruption` when `data` does not hash to `expected`
    pub fn verify(data: &[u8], expected: u32, what: &str) -> Result<()> {
        let actual = Self::compute(data);
        if actual != expected {
            return Err(StorageError::Corruption(format!(
                "{} checksum mismatch: expected {:#010x}, got {:#010x} ({} bytes)",
                what,
                expected,
                actual,
                data.len()
            )));
        }
        Ok(())
    }

    /// Append the CRC32 of `buf` to `buf`
    pub fn seal(buf: &mut Vec<u8>) {
        let checksum = Self::compute(buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
    }

    /// Split off and verify the trailer written by [`Checksum::seal`]
    pub fn unseal<'a>(sealed: &'a [u8], what: &str) -> Result<&'a [u8]> {
        if sealed.len() < CHECKSUM_LEN {
            return Err(StorageError::Corruption(format!(
                "{} too short for checksum ({} bytes)",
                what,
                sealed.len()
            )));
        }
        let (data, trailer) = sealed.split_at(sealed.len() - CHECKSUM_LEN);
        let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        Self::verify(data, expected, what)?;
        Ok(data)
    }
}
