//! Buffer cache configuration.

use crate::error::{KernelError, Result};

/// Maximum number of blocks any one filesystem operation writes.
pub const MAXOPBLOCKS: usize = 10;

/// Default number of buffers in the pool.
pub const NBUF: usize = MAXOPBLOCKS * 3;

/// Default number of hash buckets.
pub const NBUCKET: usize = 13;

/// Size and partitioning of the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Total buffers, fixed for the life of the cache.
    pub nbuf: usize,
    /// Number of independently locked buckets.
    pub nbucket: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            nbuf: NBUF,
            nbucket: NBUCKET,
        }
    }
}

impl CacheConfig {
    /// Sets the number of buffers.
    #[must_use]
    pub fn with_nbuf(mut self, nbuf: usize) -> Self {
        self.nbuf = nbuf;
        self
    }

    /// Sets the number of buckets.
    #[must_use]
    pub fn with_nbucket(mut self, nbucket: usize) -> Self {
        self.nbucket = nbucket;
        self
    }

    /// Checks the geometry.
    ///
    /// # Errors
    ///
    /// Returns an error if either count is zero.
    pub fn validate(&self) -> Result<()> {
        if self.nbuf == 0 {
            return Err(KernelError::ConfigError(
                "nbuf must be greater than 0".into(),
            ));
        }
        if self.nbucket == 0 {
            return Err(KernelError::ConfigError(
                "nbucket must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.nbuf, 30);
        assert_eq!(config.nbucket, 13);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = CacheConfig::default().with_nbuf(8).with_nbucket(4);
        assert_eq!(config, CacheConfig { nbuf: 8, nbucket: 4 });
    }

    #[test]
    fn test_validation() {
        assert!(CacheConfig::default().with_nbuf(0).validate().is_err());
        assert!(CacheConfig::default().with_nbucket(0).validate().is_err());
    }
}
