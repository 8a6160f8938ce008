//! service-core: Shared infrastructure for the recurring billing jobs.
pub mod config;
pub mod error;
pub mod observability;
