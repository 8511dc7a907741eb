//! Core types, error taxonomy, and configuration shared across the
//! greenroom workspace.

pub mod config;
pub mod error;
pub mod types;

pub use error::{Error, Result};
