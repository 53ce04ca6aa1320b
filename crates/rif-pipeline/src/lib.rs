//! CCW RIF load pipeline.
//!
//! Discovers data set manifests deposited in S3 by the Chronic
//! Conditions Warehouse, waits for their data files to finish uploading,
//! and loads the RIF records into PostgreSQL one data set at a time, in
//! `(timestamp, sequence id)` order. State lives in tracking tables so
//! restarts resume cleanly.

pub mod app;
pub mod config;
pub mod error;
pub mod job;
pub mod loader;
pub mod manifest;
pub mod prevalidate;
pub mod queue;
pub mod rif;
pub mod s3;
pub mod schema;
pub mod status;
pub mod store;

pub use error::{PipelineError, PipelineResult};
