//! # claimq
//!
//! Lease-based claim coordination for a shared pool of work items.
//!
//! Many independent clients draw items from one pool, hold each under a
//! time-bounded lease while working on it, and commit answers exactly once.
//! Two interchangeable stores provide the per-item atomic transitions: lock
//! files on a shared filesystem, or rows in PostgreSQL.

pub mod config;
pub mod error;
pub mod lease;
pub mod model;
pub mod store;
pub mod sweep;
pub mod telemetry;

pub use error::{Error, Result};
pub use lease::{LeaseManager, LeasePolicy};
pub use store::Store;
