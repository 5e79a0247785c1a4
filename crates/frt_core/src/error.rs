//! Errors raised by core primitives

use core::fmt;

/// Why a [`Handle`](crate::Handle) could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleError {
    /// The null handle
    Null,
    /// The slot was freed and possibly reused since the handle was issued
    Stale,
    /// The index was never issued by this map
    OutOfBounds,
}

impl fmt::Display for HandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleError::Null => f.write_str("null handle"),
            HandleError::Stale => f.write_str("stale handle: the slot has been released"),
            HandleError::OutOfBounds => f.write_str("handle index was never issued"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for HandleError {}
