//! Block storage for kcore.
//!
//! This module provides the block layer, including:
//! - Block identity ([`BlockId`])
//! - The disk-transfer primitive and two devices ([`disk`])
//! - The bucketed buffer cache ([`buffer_cache`])

mod block_id;

pub mod buffer_cache;
pub mod disk;

pub use block_id::BlockId;
pub use buffer_cache::{
    BlockData, Buf, BucketSnapshot, BufferCache, BufferInfo, CacheConfig, CacheStats,
};
pub use disk::{BlockDevice, FileDisk, MemDisk};

/// Size of a disk block in bytes.
pub const BLOCK_SIZE: usize = 1024;
