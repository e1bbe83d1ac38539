//! Shared error helpers and small text utilities used across the mender crates.

pub mod error;
pub mod text;

pub use error::{Error, FromMessage, Result};
