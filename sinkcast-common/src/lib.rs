//! # sinkcast Common Library
//!
//! Shared code for the sinkcast workspace:
//! - Error type and `Result` alias
//! - TOML configuration, file discovery, and compiled defaults

pub mod config;
pub mod error;

pub use error::{Error, Result};
