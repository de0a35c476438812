//! Session materialization
//!
//! Turns a profile plus its stored secret into the environment variables
//! that make a child process "logged in" as that profile. Profiles without
//! a session duration export the stored credential as-is. Profiles with one
//! exchange it for a freshly minted token scoped to the profile's policies
//! and valid for exactly that long; the long lived secret never reaches the
//! child in that case.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use cf_vault_core::{AuthType, Profile};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

use crate::api::{ApiError, Connector, Credentials, TokenRequest};
use crate::store::{secret_key, SecretStore, SecretStoreError};

/// Marker proving a session is active, set to the profile name
pub const SESSION_MARKER: &str = "CLOUDFLARE_VAULT_SESSION";

/// Expiry of a minted token, in epoch seconds
pub const SESSION_EXPIRY: &str = "CLOUDFLARE_SESSION_EXPIRY";

/// Variable prefixes understood by Cloudflare tooling (long and short form)
pub const ENV_PREFIXES: [&str; 2] = ["CLOUDFLARE", "CF"];

/// Prefix of minted token names, followed by the expiry epoch
pub const TOKEN_NAME_PREFIX: &str = "cf-vault";

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("profile {0:?} has no stored credentials, run `cf-vault add {0}` again")]
    ProfileNotConfigured(String),

    #[error("invalid session duration {0:?}, expected values like 15m, 1h or 1h30m")]
    InvalidDuration(String),

    #[error("profile {0:?} has a session duration but no policies to scope tokens to, re-add it with --profile-template")]
    MissingPolicies(String),

    #[error("profile {name:?} is invalid: {reason}")]
    InvalidProfile { name: String, reason: String },

    #[error("stored credential for {0:?} is not valid UTF-8")]
    MalformedSecret(String),

    #[error("failed to create a short lived token: {0}")]
    TokenMintFailed(#[source] ApiError),

    #[error(transparent)]
    Store(SecretStoreError),
}

/// Environment assignments for one session, in a stable order
pub type SessionEnv = BTreeMap<String, String>;

/// Parse a session duration such as `15m`, `1h` or `1h30m`
pub fn parse_duration(value: &str) -> Result<Duration, SessionError> {
    let invalid = || SessionError::InvalidDuration(value.to_string());
    let s = value.trim();
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::zero();
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }

        if digits.is_empty() {
            return Err(invalid());
        }
        let amount: i64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();

        let segment = match c {
            'h' => Duration::try_hours(amount),
            'm' => Duration::try_minutes(amount),
            's' => Duration::try_seconds(amount),
            _ => None,
        }
        .ok_or_else(invalid)?;

        total = total.checked_add(&segment).ok_or_else(invalid)?;
    }

    // Trailing number without a unit
    if !digits.is_empty() || total <= Duration::zero() {
        return Err(invalid());
    }

    Ok(total)
}

/// Builds session environments from profiles
pub struct Materializer<'a> {
    store: &'a dyn SecretStore,
    connector: &'a dyn Connector,
}

impl<'a> Materializer<'a> {
    pub fn new(store: &'a dyn SecretStore, connector: &'a dyn Connector) -> Self {
        Self { store, connector }
    }

    /// Produce the environment for profile `name`.
    ///
    /// Everything that can be checked locally is checked before the secret
    /// is read, and the secret is read before any network call.
    pub fn materialize(
        &self,
        name: &str,
        profile: &Profile,
        now: DateTime<Utc>,
    ) -> Result<SessionEnv, SessionError> {
        profile
            .validate(name)
            .map_err(|e| SessionError::InvalidProfile {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let lifetime = match profile.session_duration.as_deref() {
            Some(d) if profile.is_dynamic() => Some(parse_duration(d)?),
            _ => None,
        };
        if lifetime.is_some() && profile.policies.is_empty() {
            return Err(SessionError::MissingPolicies(name.to_string()));
        }

        let secret = self.read_secret(name, profile.auth_type)?;

        let mut env = match lifetime {
            None => {
                debug!("session-duration not set for {}, using stored credential", name);
                static_env(profile, &secret)
            }
            Some(lifetime) => self.mint(profile, secret, now, lifetime)?,
        };

        env.insert(SESSION_MARKER.to_string(), name.to_string());
        Ok(env)
    }

    fn read_secret(&self, name: &str, auth_type: AuthType) -> Result<String, SessionError> {
        let key = secret_key(name, auth_type);
        let bytes = self.store.get(&key).map_err(|e| match e {
            SecretStoreError::NotFound(_) => SessionError::ProfileNotConfigured(name.to_string()),
            other => SessionError::Store(other),
        })?;

        String::from_utf8(bytes).map_err(|_| SessionError::MalformedSecret(key))
    }

    fn mint(
        &self,
        profile: &Profile,
        secret: String,
        now: DateTime<Utc>,
        lifetime: Duration,
    ) -> Result<SessionEnv, SessionError> {
        let credentials = Credentials::new(profile.auth_type, secret, &profile.email);
        let request = token_request(profile, now, lifetime);
        let api = self
            .connector
            .connect(credentials)
            .map_err(SessionError::TokenMintFailed)?;
        let token = api
            .create_token(&request)
            .map_err(SessionError::TokenMintFailed)?;

        debug!("minted {} valid until {}", request.name, request.expires_on);

        let mut env = SessionEnv::new();
        for prefix in ENV_PREFIXES {
            env.insert(format!("{}_API_TOKEN", prefix), token.clone());
        }
        env.insert(
            SESSION_EXPIRY.to_string(),
            request.expires_on.timestamp().to_string(),
        );
        Ok(env)
    }
}

/// The request minting a token for `profile`, valid from `now` for `lifetime`.
///
/// `now` is truncated to whole seconds first, so `not_before` and
/// `expires_on` land on second boundaries and `expires_on - not_before`
/// equals `lifetime` exactly. With a sub-second `now`, `expires_on` is up to
/// one second earlier than `now + lifetime`.
pub fn token_request(profile: &Profile, now: DateTime<Utc>, lifetime: Duration) -> TokenRequest {
    let not_before = now.trunc_subsecs(0);
    let expires_on = not_before + lifetime;

    TokenRequest {
        name: format!("{}-{}", TOKEN_NAME_PREFIX, expires_on.timestamp()),
        not_before,
        expires_on,
        policies: profile.policies.clone(),
    }
}

fn static_env(profile: &Profile, secret: &str) -> SessionEnv {
    let mut env = SessionEnv::new();
    for prefix in ENV_PREFIXES {
        env.insert(
            format!("{}_{}", prefix, profile.auth_type.env_suffix()),
            secret.to_string(),
        );
        if profile.auth_type == AuthType::ApiKey {
            env.insert(format!("{}_EMAIL", prefix), profile.email.clone());
        }
    }
    env
}
