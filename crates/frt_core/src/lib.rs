//! # frt_core - Frt Engine Core
//!
//! Zero-dependency primitives shared by the engine crates. Currently this is
//! the generational handle slab that backs ownership tracking in
//! `frt_memory`.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(not(feature = "std"))]
extern crate alloc;

#[cfg(feature = "std")]
extern crate std as alloc;

pub mod error;
pub mod handle;

pub use error::*;
pub use handle::*;

pub mod prelude {
    pub use crate::error::HandleError;
    pub use crate::handle::{Handle, HandleMap};
}
