//! Test utilities for the claim-check crates.
//!
//! See the modules for all available utilities.

pub mod tracing;
