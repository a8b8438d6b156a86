//! # taxa-registry
//!
//! Client for the external taxonomic registry and occurrence archive,
//! speaking the GBIF v1 REST API.
//!
//! ```rust,ignore
//! use taxa_core::{Rank, RegistryClient};
//! use taxa_registry::{GbifClient, RegistryConfig};
//!
//! let client = GbifClient::new(RegistryConfig::default())?;
//! let tiger = client.search_by_name("Panthera tigris", Some(Rank::Species)).await?;
//! ```

pub mod config;
pub mod gbif;
pub mod types;

pub use config::RegistryConfig;
pub use gbif::GbifClient;
