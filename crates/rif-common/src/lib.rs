//! RIF Pipeline Common Library
//!
//! Shared types, logging, and error handling for the RIF pipeline workspace.
//!
//! # Overview
//!
//! This crate provides functionality used across all workspace members:
//!
//! - **Error Handling**: the shared [`CommonError`] and result alias
//! - **Logging**: centralized `tracing` subscriber initialization
//! - **Types**: RIF domain types shared between extraction and loading

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use types::RifFileType;
