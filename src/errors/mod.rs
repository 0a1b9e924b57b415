//! # Error Handling
//!
//! Error handling for the Forge data access layer.

pub mod types;

pub use types::{ForgeError, Result};
