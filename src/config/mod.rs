// src/config/mod.rs

//! Configuration loading and validation for droidflow.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate it into a [`Catalog`](crate::catalog::Catalog), device list and
//!   [`ExecutionPolicy`] (`validate.rs`).

pub mod loader;
pub mod model;
pub mod policy;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{ConfigFile, RawConfigFile};
pub use policy::{parse_duration, ExecutionPolicy};
