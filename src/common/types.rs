//!
//! Blockfs default type declare
//!
use once_cell::sync::Lazy;

// Magic represents a marker value to indicate that a file is a blockfs
// mount map.
pub(crate) const MOUNT_MAP_MAGIC: u32 = 0x0087_3F2A;

// These two status bytes are bitwise "smart" - so it is possible to go on
// a wild chase through a binary stream and look for them.
pub(crate) const NODE_IN_USE_BYTE: u8 = 0x55; // Binary 01010101
pub(crate) const NODE_FREE_BYTE: u8 = 0xAA; // Binary 10101010

// End tag terminating every well formed node region.
pub(crate) const NODE_END_TAG: u32 = 0x00FF_00FF;

// Markers bracketing a node region while a write is in progress. Neither
// may appear in a cleanly shut down data file.
pub(crate) const NODE_WRITE_ACTIVE_START: u32 = 77_162;
pub(crate) const NODE_WRITE_ACTIVE_END: u32 = 776_512;

// DefaultBlockSize is the default allocation quantum, set to the OS page
// size.
pub(crate) static DEFAULT_BLOCK_SIZE: Lazy<usize> = Lazy::new(|| page_size::get());

// DefaultMaxCacheSize is the largest payload kept in memory per node if
// not set in an Options instance.
pub(crate) const DEFAULT_MAX_CACHE_SIZE: usize = 16 * 1024 * 1024;

// DefaultFragmentationLimit matches the pinned limit applied at mount.
pub(crate) const DEFAULT_FRAGMENTATION_LIMIT: f64 = 1.0;

///
/// 单元测试
/// #[cfg(test)]
///
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_size() {
        let block_size = *DEFAULT_BLOCK_SIZE;

        println!("system page size:{}", block_size);
        assert!(block_size > 0);
        assert_eq!(block_size % 512, 0);
    }

    #[test]
    fn test_status_bytes() {
        // The status words are the status bytes repeated over all four
        // byte positions.
        assert_eq!(u32::from_ne_bytes([NODE_IN_USE_BYTE; 4]), 0x5555_5555);
        assert_eq!(u32::from_ne_bytes([NODE_FREE_BYTE; 4]), 0xAAAA_AAAA);
        assert_ne!(NODE_END_TAG, NODE_WRITE_ACTIVE_START);
        assert_ne!(NODE_END_TAG, NODE_WRITE_ACTIVE_END);
    }
}
