//! Runtime adapters for bundlelab (configuration, credentials, datasets, persisted artifacts).

pub mod cache;
pub mod config;
pub mod dataset;
pub mod keyring;
