//! Configuration records for the Wavecast streaming server.
//!
//! This crate only describes configuration; resolving an [`AuthBlock`] into
//! a running authenticator, or a [`MountConfig`] into admission policy, is
//! the core crate's business.

pub mod loader;
pub mod models;

pub use loader::{ConfigError, load};
pub use models::{AuthBlock, AuthOption, MountConfig, ServerConfig};
