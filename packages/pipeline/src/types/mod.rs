//! Domain types for jobs, batches, rows, and configuration.

pub mod batch;
pub mod config;
pub mod job;
pub mod row;
