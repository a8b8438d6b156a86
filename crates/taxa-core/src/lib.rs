//! # taxa-core
//!
//! Core types, traits, and abstractions for taxonomic identity resolution and
//! occurrence harvesting.
//!
//! This crate provides the data model (taxa, sites, occurrences, registry
//! payloads, jobs) and the repository/registry traits the other taxa crates
//! implement or depend on.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use traits::*;
