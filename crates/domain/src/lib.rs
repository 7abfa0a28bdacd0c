//! Shared configuration model and error type for EdgeLink crates.

pub mod config;
pub mod error;

pub use error::{Error, Result};
