//! Common utilities and types shared across the SPIRE testbed crates.

#![warn(clippy::pedantic)]

/// Module for SPIFFE identity types
pub mod types;

/// Module for common configuration
pub mod config;

/// Module for secret types that prevent accidental logging
pub mod secret;
