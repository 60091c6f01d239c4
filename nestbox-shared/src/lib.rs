//! Nestbox shared types - common code for the runtime core and its helpers.
//!
//! This crate contains the error hierarchy, compile-time constants, and the
//! sync-socket wire protocol spoken between the runtime and the container
//! bootstrapper.

pub mod constants;
pub mod errors;
pub mod sync;

pub use errors::{NestboxError, NestboxResult};
pub use sync::{SyncMsg, SyncType};
