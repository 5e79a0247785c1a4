//! Memory subsystem configuration
//!
//! # Example Config File
//!
//! ```toml
//! pool_size = 67108864          # bytes for the general-purpose pool
//! ref_counting_size = 4194304   # bytes for the handle allocator
//! backing = "virtual"           # virtual, heap
//! make_primary = true
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::literals::{KIB, MIB};
use crate::os::Backing;
use crate::tlsf::{BLOCK_SIZE_MAX, BLOCK_SIZE_MIN, POOL_OVERHEAD};

/// Sizes and placement of the engine's allocators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Bytes reserved for the TLSF pool
    pub pool_size: usize,

    /// Bytes reserved for the reference-counting allocator
    pub ref_counting_size: usize,

    /// Where the pool region comes from
    pub backing: Backing,

    /// Register the pool as the process-wide default
    pub make_primary: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            pool_size: 64 * MIB,
            ref_counting_size: 4 * MIB,
            backing: Backing::Virtual,
            make_primary: false,
        }
    }
}

impl MemoryConfig {
    /// Small allocators for tests and tools
    pub fn minimal() -> Self {
        Self {
            pool_size: 256 * KIB,
            ref_counting_size: 64 * KIB,
            backing: Backing::Heap,
            ..Default::default()
        }
    }

    /// Parse from TOML text, filling missing keys with defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| MemoryError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| MemoryError::Config(e.to_string()))
    }

    pub fn with_pool_size(mut self, bytes: usize) -> Self {
        self.pool_size = bytes;
        self
    }

    pub fn with_ref_counting_size(mut self, bytes: usize) -> Self {
        self.ref_counting_size = bytes;
        self
    }

    /// Reject sizes no allocator can be built from
    pub fn validate(&self) -> Result<()> {
        let minimum = BLOCK_SIZE_MIN + POOL_OVERHEAD;
        if self.pool_size < minimum {
            return Err(MemoryError::Config(format!(
                "pool_size {} is below the {}-byte minimum",
                self.pool_size, minimum
            )));
        }
        if self.pool_size - POOL_OVERHEAD >= BLOCK_SIZE_MAX {
            return Err(MemoryError::Config(format!(
                "pool_size {} exceeds the maximum block size",
                self.pool_size
            )));
        }
        if self.ref_counting_size == 0 {
            return Err(MemoryError::Config("ref_counting_size must be non-zero".into()));
        }
        if self.ref_counting_size > isize::MAX as usize {
            return Err(MemoryError::Config(format!(
                "ref_counting_size {} exceeds the address space",
                self.ref_counting_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_defaults() {
        let config =
            MemoryConfig::from_toml_str("pool_size = 1048576\nbacking = \"heap\"").unwrap();
        assert_eq!(config.pool_size, MIB);
        assert_eq!(config.backing, Backing::Heap);
        assert_eq!(config.ref_counting_size, MemoryConfig::default().ref_counting_size);
        assert!(!config.make_primary);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = MemoryConfig::minimal().with_pool_size(MIB);
        let text = config.to_toml_string().unwrap();
        assert_eq!(MemoryConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_validation() {
        assert!(MemoryConfig::default().validate().is_ok());
        assert!(matches!(
            MemoryConfig::default().with_pool_size(16).validate(),
            Err(MemoryError::Config(_))
        ));
        assert!(matches!(
            MemoryConfig::default().with_ref_counting_size(0).validate(),
            Err(MemoryError::Config(_))
        ));
        assert!(matches!(
            MemoryConfig::default().with_ref_counting_size(usize::MAX - 10).validate(),
            Err(MemoryError::Config(_))
        ));
        assert!(matches!(
            MemoryConfig::from_toml_str("backing = \"tape\""),
            Err(MemoryError::Config(_))
        ));
    }
}
