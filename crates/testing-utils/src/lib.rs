//! # Check-in Testing Utils
//!
//! Shared testing utilities for the check-in workspace: an in-memory
//! transactional database with fault injection, cache and clock doubles, and
//! builders for tasks and verification payloads.
//!
//! ```toml
//! [dev-dependencies]
//! checkin-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod mocks;

pub use builders::*;
pub use mocks::*;
