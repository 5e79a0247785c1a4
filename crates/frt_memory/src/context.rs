//! Allocators bundled for the engine
//!
//! Subsystems receive a `&MemoryContext` instead of reaching for globals; the
//! handles they create borrow from it.

use std::sync::Arc;

use crate::config::MemoryConfig;
use crate::error::Result;
use crate::pool::MemoryPool;
use crate::ref_counting::RefCountingAllocator;

/// The general-purpose pool and the handle allocator, built from one config
pub struct MemoryContext {
    pool: Arc<MemoryPool>,
    ref_counting: RefCountingAllocator,
}

impl MemoryContext {
    pub fn from_config(config: &MemoryConfig) -> Result<Self> {
        let pool = MemoryPool::from_config(config)?;
        let ref_counting = RefCountingAllocator::new(config.ref_counting_size)?;

        log::info!(
            "Memory context ready: pool {} bytes, ref counting {} bytes",
            config.pool_size,
            config.ref_counting_size
        );
        Ok(Self { pool, ref_counting })
    }

    /// Parse a TOML config and build from it
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Self::from_config(&MemoryConfig::from_toml_str(text)?)
    }

    #[inline]
    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    #[inline]
    pub fn ref_counting(&self) -> &RefCountingAllocator {
        &self.ref_counting
    }
}

impl std::fmt::Debug for MemoryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryContext")
            .field("pool", &self.pool.stats())
            .field("ref_counting", &self.ref_counting.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Allocator, MemoryError, MemoryHandle};

    #[test]
    fn test_context_from_config() {
        let ctx = MemoryContext::from_config(&MemoryConfig::minimal()).unwrap();
        assert!(ctx.pool().capacity() > 200 * 1024);
        assert_eq!(ctx.ref_counting().capacity(), 64 * 1024);
        assert!(!ctx.pool().is_primary());

        let shared = ctx.pool().new_shared(3u64).unwrap();
        let handle = MemoryHandle::new_in(ctx.ref_counting(), 4u64).unwrap();
        assert_eq!(*shared + *handle.get().unwrap(), 7);
    }

    #[test]
    fn test_context_from_toml() {
        let ctx = MemoryContext::from_toml_str(
            "pool_size = 131072\nref_counting_size = 8192\nbacking = \"heap\"",
        )
        .unwrap();
        assert_eq!(ctx.ref_counting().capacity(), 8192);

        assert!(matches!(
            MemoryContext::from_toml_str("pool_size = 8"),
            Err(MemoryError::Config(_))
        ));
    }
}
