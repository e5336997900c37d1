//! Common utilities shared across the VRRP workspace crates.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
