//! # spate-core
//! Foundation types for the Spate transaction synchronization protocol.

pub mod constants;
pub mod error;
pub mod types;
