//! # taxa-engine
//!
//! Taxonomic identity resolution and occurrence harvesting.
//!
//! This crate provides:
//! - [`MergeEngine`]: collapses duplicate taxon rows into one survivor
//! - [`Resolver`]: reconciles local taxa with the external registry,
//!   including parent chains, children and synonym redirects
//! - [`HarvestPipeline`]: pages occurrences into sites and records
//!
//! Everything is written against the repository and registry traits in
//! `taxa-core`; Postgres and GBIF implementations live in `taxa-db` and
//! `taxa-registry`.
//!
//! # Feature Flags
//!
//! - `mock`: in-memory repositories and a scripted registry client
//!
//! # Example
//!
//! ```rust,ignore
//! use taxa_engine::{ResolveRequest, Resolver, ResolverConfig};
//!
//! let resolver = Resolver::new(taxa, registry, ResolverConfig::from_env());
//! let tiger = resolver
//!     .resolve(ResolveRequest::by_name("Panthera tigris", Rank::Species).with_vernacular())
//!     .await;
//! ```

pub mod config;
pub mod harvest;
pub mod merge;
pub mod resolver;

// Test doubles, also exported for downstream crates' tests
#[cfg(any(test, feature = "mock"))]
pub mod memory;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use config::{HarvestConfig, ResolverConfig};
pub use harvest::{HarvestPipeline, HarvestRequest};
pub use merge::MergeEngine;
pub use resolver::{ResolveRequest, Resolver};
