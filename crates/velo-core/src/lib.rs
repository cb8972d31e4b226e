//! # velo-core
//!
//! Shared primitives for the velo monthly load orchestrator.
//!
//! This crate provides the foundational types used across all velo components:
//!
//! - **Partitions**: Monthly partition keys and their date ranges
//! - **Identifiers**: Strongly-typed run IDs
//! - **Locks**: Mutual exclusion over partitions
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Crate Boundary
//!
//! `velo-core` knows nothing about trips, weather, or warehouses. Those live
//! in `velo-flow`, which builds on the primitives defined here.
//!
//! ## Example
//!
//! ```rust
//! use velo_core::prelude::*;
//!
//! let partition = PartitionKey::new(2025, 1).unwrap();
//! let run_id = RunId::generate();
//! assert_eq!(partition.compact(), "202501");
//! assert!(!run_id.to_string().is_empty());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod lock;
pub mod observability;
pub mod partition;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use velo_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::RunId;
    pub use crate::lock::{
        FilePartitionLock, InMemoryPartitionLock, LockAttempt, LockInfo, PartitionLock,
    };
    pub use crate::partition::PartitionKey;
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::RunId;
pub use lock::{FilePartitionLock, InMemoryPartitionLock, LockAttempt, LockInfo, PartitionLock};
pub use observability::{LogFormat, init_logging, pipeline_span};
pub use partition::PartitionKey;
