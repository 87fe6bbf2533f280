#![forbid(unsafe_code)]
//! Public API facade.
//!
//! Re-exports the repair subsystem, its value types and the storage
//! capability through one crate, so the owning data node depends on `rfix`
//! alone.

pub use rfix_error::{Result, RfixError};
pub use rfix_extent::{ExtentStore, MemExtentStore, WriteMode};
pub use rfix_repair::*;
pub use rfix_types::*;
