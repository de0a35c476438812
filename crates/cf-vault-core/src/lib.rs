//! cf-vault core - shared functionality for the cf-vault tool
//!
//! Non-secret state only: where things live on disk, what a profile looks
//! like, and how the profile config file is read and written. Secrets never
//! pass through this crate.

pub mod config;
pub mod paths;
pub mod profile;

pub use config::{Config, ConfigError, ProfileStore};
pub use paths::Paths;
pub use profile::{AuthType, Effect, PermissionGroup, Policy, Profile};
