//! Archive configuration
//!
//! Sizes, alignments and platform limits used while dumping. None of these are
//! hardcoded in the dumper itself so embedders and tests can shrink the
//! reservation or the compressed-offset limit.

use crate::error::{ArchiveError, ArchiveResult};
use crate::WORD_SIZE;

const K: usize = 1024;
const M: usize = 1024 * K;

/// Default dump-time base address of the archive.
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_BASE_ADDRESS: usize = 0x8_0000_0000;
/// Default dump-time base address of the archive.
#[cfg(not(target_pointer_width = "64"))]
pub const DEFAULT_BASE_ADDRESS: usize = 0x4000_0000;

/// Largest distance from the archive base that fits a compressed offset.
pub const DEFAULT_MAX_SHARED_DELTA: usize = 0x7FFF_F000;

/// Archive configuration
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    /// Address the archive is laid out at during the dump (default: 0x8_0000_0000)
    pub base_address: usize,
    /// Bytes reserved for all regions together (default: 256MB)
    pub reserve_size: usize,
    /// Alignment of every allocated block (default: 8)
    pub object_alignment: usize,
    /// Granularity regions are packed to (default: 64KB)
    pub reserved_space_alignment: usize,
    /// Granularity memory is committed in (default: 4KB)
    pub commit_granularity: usize,
    /// Largest allowed distance from the base for a shared reservation
    pub max_shared_delta: usize,
    /// Initial guess of the archive size, used to size the pointer bitmap
    /// (default: 6MB in debug builds so bitmap growth is exercised, 12MB otherwise)
    pub estimated_archive_size: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_address: DEFAULT_BASE_ADDRESS,
            reserve_size: 256 * M,
            object_alignment: 8,
            reserved_space_alignment: 64 * K,
            commit_granularity: 4 * K,
            max_shared_delta: DEFAULT_MAX_SHARED_DELTA,
            estimated_archive_size: if cfg!(debug_assertions) { 6 * M } else { 12 * M },
        }
    }
}

impl ArchiveConfig {
    /// Create a config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the reserved size.
    pub fn with_reserve_size(mut self, reserve_size: usize) -> Self {
        self.reserve_size = reserve_size;
        self
    }

    /// Set the dump-time base address.
    pub fn with_base_address(mut self, base_address: usize) -> Self {
        self.base_address = base_address;
        self
    }

    /// Set the largest distance from the base a shared reservation may reach.
    pub fn with_max_shared_delta(mut self, max_shared_delta: usize) -> Self {
        self.max_shared_delta = max_shared_delta;
        self
    }

    /// Set the initial pointer bitmap estimate.
    pub fn with_estimated_archive_size(mut self, estimated_archive_size: usize) -> Self {
        self.estimated_archive_size = estimated_archive_size;
        self
    }

    /// Set the packing alignment.
    pub fn with_reserved_space_alignment(mut self, alignment: usize) -> Self {
        self.reserved_space_alignment = alignment;
        self
    }

    /// Set the commit granularity.
    pub fn with_commit_granularity(mut self, granularity: usize) -> Self {
        self.commit_granularity = granularity;
        self
    }

    /// Small reservation suited to tests: 1MB at the default base, packed to
    /// 4KB boundaries.
    pub fn small() -> Self {
        Self::default()
            .with_reserve_size(M)
            .with_reserved_space_alignment(4 * K)
            .with_estimated_archive_size(4 * K)
    }

    /// Check that the configuration describes a usable reservation.
    pub fn validate(&self) -> ArchiveResult<()> {
        let pow2 = [
            ("object_alignment", self.object_alignment),
            ("reserved_space_alignment", self.reserved_space_alignment),
            ("commit_granularity", self.commit_granularity),
        ];
        for (name, value) in pow2 {
            if !value.is_power_of_two() {
                return Err(ArchiveError::InvalidConfig(format!(
                    "{name} must be a power of two, got {value}"
                )));
            }
        }
        if self.object_alignment < WORD_SIZE {
            return Err(ArchiveError::InvalidConfig(format!(
                "object_alignment {} is smaller than a word",
                self.object_alignment
            )));
        }
        if self.reserve_size == 0 || !self.reserve_size.is_multiple_of(self.reserved_space_alignment) {
            return Err(ArchiveError::InvalidConfig(format!(
                "reserve_size {:#x} must be a non-zero multiple of {:#x}",
                self.reserve_size, self.reserved_space_alignment
            )));
        }
        if self.base_address == 0 || !self.base_address.is_multiple_of(self.reserved_space_alignment) {
            return Err(ArchiveError::InvalidConfig(format!(
                "base_address {:#x} must be non-zero and aligned to {:#x}",
                self.base_address, self.reserved_space_alignment
            )));
        }
        if self.base_address.checked_add(self.reserve_size).is_none() {
            return Err(ArchiveError::InvalidConfig(
                "reservation wraps the address space".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ArchiveConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.object_alignment, 8);
        assert_eq!(config.max_shared_delta, DEFAULT_MAX_SHARED_DELTA);
    }

    #[test]
    fn test_small_config_is_valid() {
        let config = ArchiveConfig::small();
        assert!(config.validate().is_ok());
        assert_eq!(config.reserve_size, M);
    }

    #[test]
    fn test_rejects_unaligned_reserve() {
        let config = ArchiveConfig::small().with_reserve_size(M + 1);
        assert!(matches!(config.validate(), Err(ArchiveError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_null_base() {
        let config = ArchiveConfig::small().with_base_address(0);
        assert!(matches!(config.validate(), Err(ArchiveError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_non_power_of_two_alignment() {
        let mut config = ArchiveConfig::small();
        config.object_alignment = 12;
        assert!(config.validate().is_err());
    }
}
