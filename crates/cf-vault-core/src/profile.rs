//! Profile model
//!
//! A profile is the durable, non-secret description of one Cloudflare
//! credential: which auth scheme it uses, whether sessions mint short lived
//! tokens, and the policies those tokens are scoped to.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use crate::config::ConfigError;

/// Resource value used for every policy resource pattern.
pub const WILDCARD: &str = "*";

/// Which credential shape a profile stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    /// Global API key, always paired with the account email
    ApiKey,
    /// Scoped bearer token
    ApiToken,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::ApiToken => "api_token",
        }
    }

    /// Environment variable suffix for the raw credential (`API_KEY`/`API_TOKEN`)
    pub fn env_suffix(&self) -> &'static str {
        match self {
            Self::ApiKey => "API_KEY",
            Self::ApiToken => "API_TOKEN",
        }
    }

    /// Guess the auth type from the shape of a credential.
    ///
    /// Tokens are 40 characters of `[A-Za-z0-9_-]`, global keys are 37
    /// lowercase hex characters. Tokens are checked first.
    pub fn detect(value: &str) -> Option<Self> {
        static TOKEN: OnceLock<Regex> = OnceLock::new();
        static KEY: OnceLock<Regex> = OnceLock::new();

        let token = TOKEN.get_or_init(|| Regex::new("[A-Za-z0-9_-]{40}").expect("valid regex"));
        let key = KEY.get_or_init(|| Regex::new("[0-9a-f]{37}").expect("valid regex"));

        let value = value.trim();
        if token.is_match(value) {
            Some(Self::ApiToken)
        } else if key.is_match(value) {
            Some(Self::ApiKey)
        } else {
            None
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy effect. The API only grants, so there is a single variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    #[default]
    Allow,
}

/// Reference to a grantable permission group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionGroup {
    /// Stable identifier, the only field the API looks at
    pub id: String,

    /// Human label, kept for readability of the config file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Keys this version doesn't know about, written back untouched
    #[serde(flatten)]
    pub extra: toml::Table,
}

impl PermissionGroup {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: Some(name.to_string()),
            extra: toml::Table::new(),
        }
    }
}

/// A single token policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub effect: Effect,

    /// Server-assigned policy ID (only present on policies copied from the API)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Resource patterns this policy applies to, each mapped to `*`
    pub resources: BTreeMap<String, String>,

    #[serde(default)]
    pub permission_groups: Vec<PermissionGroup>,

    /// Keys this version doesn't know about, written back untouched
    #[serde(flatten)]
    pub extra: toml::Table,
}

impl Policy {
    /// Allow `groups` on a single resource pattern. Groups repeating an
    /// earlier ID are dropped.
    pub fn allow(resource: &str, groups: impl IntoIterator<Item = PermissionGroup>) -> Self {
        let mut permission_groups: Vec<PermissionGroup> = Vec::new();
        for group in groups {
            if !permission_groups.iter().any(|g| g.id == group.id) {
                permission_groups.push(group);
            }
        }

        let mut resources = BTreeMap::new();
        resources.insert(resource.to_string(), WILDCARD.to_string());

        Self {
            effect: Effect::Allow,
            id: None,
            resources,
            permission_groups,
            extra: toml::Table::new(),
        }
    }
}

/// A named credential identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Account email, required for `api_key` profiles
    #[serde(default)]
    pub email: String,

    pub auth_type: AuthType,

    /// Lifetime of minted tokens (e.g. "15m"). Unset means the stored
    /// credential is used directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_duration: Option<String>,

    /// Policies minted tokens are scoped to, frozen when the profile is added
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<Policy>,

    /// Keys this version doesn't know about, written back untouched
    #[serde(flatten)]
    pub extra: toml::Table,
}

impl Profile {
    pub fn new(auth_type: AuthType, email: &str) -> Self {
        Self {
            email: email.trim().to_string(),
            auth_type,
            session_duration: None,
            policies: Vec::new(),
            extra: toml::Table::new(),
        }
    }

    pub fn with_session_duration(mut self, duration: &str) -> Self {
        self.session_duration = Some(duration.trim().to_string());
        self
    }

    pub fn with_policies(mut self, policies: Vec<Policy>) -> Self {
        self.policies = policies;
        self
    }

    /// Whether sessions for this profile mint short lived tokens
    pub fn is_dynamic(&self) -> bool {
        self.session_duration
            .as_deref()
            .is_some_and(|d| !d.trim().is_empty())
    }

    /// Check the invariants that don't need the network
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.auth_type == AuthType::ApiKey && self.email.trim().is_empty() {
            return Err(ConfigError::InvalidProfile {
                name: name.to_string(),
                reason: "api_key profiles require an email address".to_string(),
            });
        }
        Ok(())
    }
}
