//! Adding profiles
//!
//! Turns what the user typed into a stored secret plus a profile entry in
//! the config file. Policies for short lived sessions are generated here,
//! once, against the live catalog and then frozen into the profile.

use cf_vault_core::{AuthType, ConfigError, Profile, ProfileStore};
use thiserror::Error;
use tracing::{debug, info};

use crate::api::{ApiError, Connector, Credentials};
use crate::session::{self, SessionError};
use crate::store::{secret_key, SecretStore, SecretStoreError};
use crate::template::{self, PolicyError, Template};

/// Errors while adding a profile
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("invalid profile name {0:?}, use ASCII letters, digits, '-', '_' or '.'")]
    InvalidName(String),

    #[error("--session-duration needs --profile-template so short lived tokens have policies to use")]
    DurationWithoutTemplate,

    #[error("failed to connect to the Cloudflare API: {0}")]
    Connect(#[source] ApiError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Store(#[from] SecretStoreError),
}

/// Everything needed to add one profile
#[derive(Debug, Clone, Default)]
pub struct NewProfile {
    pub name: String,
    pub email: String,
    pub secret: String,
    pub session_duration: Option<String>,
    pub template: Option<Template>,
}

/// Profile names end up in secret keys and file names
fn validate_name(name: &str) -> Result<(), ProvisionError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');

    if valid {
        Ok(())
    } else {
        Err(ProvisionError::InvalidName(name.to_string()))
    }
}

/// Adds profiles to a config file and secret store
pub struct Provisioner<'a> {
    profiles: &'a ProfileStore,
    secrets: &'a dyn SecretStore,
    connector: &'a dyn Connector,
}

impl<'a> Provisioner<'a> {
    pub fn new(
        profiles: &'a ProfileStore,
        secrets: &'a dyn SecretStore,
        connector: &'a dyn Connector,
    ) -> Self {
        Self {
            profiles,
            secrets,
            connector,
        }
    }

    /// Validate, generate policies, then store the secret and the profile.
    ///
    /// The secret is written before the config file. Any failure before the
    /// config write leaves the existing config as it was.
    pub fn add(&self, request: NewProfile) -> Result<Profile, ProvisionError> {
        let name = request.name.trim();
        validate_name(name)?;

        let secret = request.secret.trim();
        let auth_type = AuthType::detect(secret).ok_or(ConfigError::UnrecognisedCredential)?;
        debug!("detected {} credential for {}", auth_type, name);

        let email = request.email.trim();
        let mut profile = Profile::new(auth_type, email);
        profile.validate(name)?;

        let duration = request
            .session_duration
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty());
        if let Some(duration) = duration {
            session::parse_duration(duration)?;
            if request.template.is_none() {
                return Err(ProvisionError::DurationWithoutTemplate);
            }
            profile = profile.with_session_duration(duration);
        }

        // Surface a broken config file before anything is written
        let mut config = self.profiles.load()?;

        if let Some(template) = request.template {
            let credentials = Credentials::new(auth_type, secret.to_string(), email);
            let api = self
                .connector
                .connect(credentials)
                .map_err(ProvisionError::Connect)?;
            profile = profile.with_policies(template::generate(api.as_ref(), template)?);
        }

        self.secrets
            .set(&secret_key(name, auth_type), secret.as_bytes())?;

        config.upsert(name, profile.clone());
        self.profiles.save(&config)?;

        info!("added profile {} ({})", name, auth_type);
        Ok(profile)
    }
}
