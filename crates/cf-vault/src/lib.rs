//! cf-vault - Cloudflare credentials without the plaintext
//!
//! "Credentials belong in a vault, not in your shell history."
//!
//! Long lived API keys and tokens live in a secret store (the OS keychain
//! or age-encrypted files). Each `exec` builds a session environment for
//! one profile, either the stored credential itself or a freshly minted
//! token scoped to the profile's policies, and replaces the current process
//! with the requested command.

pub mod api;
pub mod catalog;
pub mod launch;
pub mod provision;
pub mod session;
pub mod store;
pub mod template;

pub use api::{ApiError, CloudflareApi, Connector, Credentials, HttpConnector};
pub use launch::{LaunchError, Launcher, Target};
pub use provision::{NewProfile, ProvisionError, Provisioner};
pub use session::{Materializer, SessionEnv, SessionError};
pub use store::{Backend, SecretStore, SecretStoreError};
pub use template::{PolicyError, Template};
