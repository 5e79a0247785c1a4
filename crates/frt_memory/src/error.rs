//! Error types for the memory subsystem

use frt_core::HandleError;
use thiserror::Error;

/// Memory subsystem errors
///
/// Allocation never panics; exhaustion and misuse both come back through
/// this type so callers decide whether a failure is fatal.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Out of memory: no free block for {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("Invalid allocation size: {0}")]
    InvalidSize(usize),

    #[error("Alignment {0} is not a power of two")]
    InvalidAlignment(usize),

    #[error("Pool memory at {0:#x} is not {1}-byte aligned")]
    Misaligned(usize, usize),

    #[error("Pool of {usable} usable bytes is below the {minimum}-byte minimum")]
    PoolTooSmall { usable: usize, minimum: usize },

    #[error("Pool of {usable} usable bytes exceeds the {maximum}-byte maximum")]
    PoolTooLarge { usable: usize, maximum: usize },

    #[error("Pool at {0:#x} still has live allocations")]
    PoolInUse(usize),

    #[error("No pool registered at {0:#x}")]
    UnknownPool(usize),

    #[error("Pointer {0:#x} was not allocated by this allocator")]
    ForeignPointer(usize),

    #[error("Double free of {0:#x}")]
    DoubleFree(usize),

    #[error("Allocation at {0:#x} is still referenced by {1} handle(s)")]
    StillReferenced(usize, usize),

    #[error("Allocation is currently borrowed")]
    Borrowed,

    #[error("Handle error: {0}")]
    Handle(#[from] HandleError),

    #[error("OS memory mapping failed: {0}")]
    Os(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias
pub type Result<T> = core::result::Result<T, MemoryError>;
