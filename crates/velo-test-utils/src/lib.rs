//! Shared test utilities for velo integration tests.
//!
//! This crate provides:
//! - Seeded record generators and trip archive builders
//! - The reference model manifest and in-memory evaluators for its models
//! - [`FaultyWarehouse`]: A warehouse that fails on command
//! - [`SourceServer`]: A local HTTP stand-in for the trip bucket and weather API
//! - Custom assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use velo_test_utils::{TripFactory, reference_manifest, register_reference_models};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let warehouse = InMemoryWarehouse::new();
//!     register_reference_models(&warehouse).unwrap();
//!     let trips = TripFactory::new(PartitionKey::new(2025, 1).unwrap(), 42).trips(100);
//!     // ... run test ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;
pub mod http_sources;
pub mod models;
pub mod warehouse;

pub use assertions::*;
pub use fixtures::*;
pub use http_sources::*;
pub use models::*;
pub use warehouse::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("velo_flow=debug".parse().expect("valid directive"))
                .add_directive("velo_core=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
