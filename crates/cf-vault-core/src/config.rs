//! Profile store
//!
//! All profiles live in a single TOML document (`~/.cf-vault/config.toml`):
//!
//! ```toml
//! [profiles.staging]
//! email = "jane@example.com"
//! auth_type = "api_key"
//! session_duration = "15m"
//!
//! [[profiles.staging.policies]]
//! effect = "allow"
//! resources = { "com.cloudflare.api.account.*" = "*" }
//! permission_groups = [{ id = "c8fed203ed3043cba015a93ad1616f1f", name = "Zone Read" }]
//! ```
//!
//! Writes go through a temp file in the same directory and a rename, so a
//! crash never leaves a truncated config behind.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::profile::Profile;

/// Config-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write config file {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no profile matching {name:?} found in the configuration file at {}", path.display())]
    ProfileNotFound { name: String, path: PathBuf },

    #[error("profile {name:?} is invalid: {reason}")]
    InvalidProfile { name: String, reason: String },

    #[error("unrecognised credential format, expected an API token or a global API key")]
    UnrecognisedCredential,
}

/// The whole config document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub profiles: BTreeMap<String, Profile>,

    /// Top-level keys this version doesn't know about
    #[serde(flatten)]
    pub extra: toml::Table,
}

impl Config {
    /// Look up a profile by name
    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    /// Add or replace a profile
    pub fn upsert(&mut self, name: &str, profile: Profile) {
        self.profiles.insert(name.to_string(), profile);
    }
}

/// File-backed profile store
#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the config. A missing file is an empty config.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no config at {}, starting empty", self.path.display());
                return Ok(Config::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Fetch a single profile, failing if it doesn't exist
    pub fn get(&self, name: &str) -> Result<Profile, ConfigError> {
        self.load()?
            .profiles
            .remove(name)
            .ok_or_else(|| ConfigError::ProfileNotFound {
                name: name.to_string(),
                path: self.path.clone(),
            })
    }

    /// Atomically replace the config file
    pub fn save(&self, config: &Config) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(config)?;
        self.write_atomic(content.as_bytes())
            .map_err(|source| ConfigError::Write {
                path: self.path.clone(),
                source,
            })?;

        debug!(
            "wrote {} profile(s) to {}",
            config.profiles.len(),
            self.path.display()
        );
        Ok(())
    }

    fn write_atomic(&self, content: &[u8]) -> io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            fs::set_permissions(&dir, Permissions::from_mode(0o700))?;
        }

        let mut file = tempfile::NamedTempFile::new_in(&dir)?;
        file.write_all(content)?;
        file.as_file().sync_all()?;
        fs::set_permissions(file.path(), Permissions::from_mode(0o600))?;
        file.persist(&self.path).map_err(|e| e.error)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{AuthType, PermissionGroup, Policy};
    use tempfile::tempdir;

    fn sample_config() -> Config {
        let mut config = Config::default();
        config.upsert("plain", Profile::new(AuthType::ApiToken, ""));
        config.upsert(
            "staging",
            Profile::new(AuthType::ApiKey, "a@b.com")
                .with_session_duration("1h")
                .with_policies(vec![
                    Policy::allow(
                        "com.cloudflare.api.account.*",
                        vec![PermissionGroup::new("c8fed203", "Zone Read")],
                    ),
                    Policy::allow("com.cloudflare.api.account.zone.*", vec![]),
                    Policy::allow("com.cloudflare.api.user.1234", vec![]),
                ]),
        );
        config
    }

    #[test]
    fn test_missing_file_is_empty() -> Result<(), ConfigError> {
        let dir = tempdir().unwrap();
        let store = ProfileStore::new(&dir.path().join("config.toml"));

        let config = store.load()?;
        assert!(config.profiles.is_empty());
        Ok(())
    }

    #[test]
    fn test_round_trip() -> Result<(), ConfigError> {
        let dir = tempdir().unwrap();
        let store = ProfileStore::new(&dir.path().join("nested").join("config.toml"));

        let config = sample_config();
        store.save(&config)?;

        let loaded = store.load()?;
        assert_eq!(loaded, config);

        let staging = store.get("staging")?;
        assert_eq!(staging.policies.len(), 3);
        assert!(staging.policies[1].permission_groups.is_empty());
        Ok(())
    }

    #[test]
    fn test_unknown_fields_survive() -> Result<(), ConfigError> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
default_profile = "prod"

[profiles.prod]
email = "ops@example.com"
auth_type = "api_key"
session_duration = "15m"
region = "eu"

[[profiles.prod.policies]]
effect = "allow"
note = "keep me"

[profiles.prod.policies.resources]
"com.cloudflare.api.account.*" = "*"

[[profiles.prod.policies.permission_groups]]
id = "c8fed203"
name = "Zone Read"
meta = "keep me too"
"#,
        )
        .unwrap();

        let store = ProfileStore::new(&path);
        let config = store.load()?;
        store.save(&config)?;

        let reloaded = store.load()?;
        assert_eq!(reloaded, config);
        assert_eq!(
            reloaded.extra.get("default_profile").and_then(|v| v.as_str()),
            Some("prod")
        );
        let prod = reloaded.profile("prod").unwrap();
        assert_eq!(prod.email, "ops@example.com");
        assert_eq!(prod.extra.get("region").and_then(|v| v.as_str()), Some("eu"));

        let policy = &prod.policies[0];
        assert_eq!(policy.extra.get("note").and_then(|v| v.as_str()), Some("keep me"));
        let group = &policy.permission_groups[0];
        assert_eq!(group.id, "c8fed203");
        assert_eq!(
            group.extra.get("meta").and_then(|v| v.as_str()),
            Some("keep me too")
        );

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("keep me"));
        assert!(written.contains("keep me too"));
        Ok(())
    }

    #[test]
    fn test_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[profiles.broken\nemail = ").unwrap();

        let result = ProfileStore::new(&path).load();
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_profile_not_found() {
        let dir = tempdir().unwrap();
        let store = ProfileStore::new(&dir.path().join("config.toml"));

        let result = store.get("nope");
        assert!(matches!(result, Err(ConfigError::ProfileNotFound { .. })));
    }

    #[test]
    fn test_save_sets_private_mode() -> Result<(), ConfigError> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let store = ProfileStore::new(&path);
        store.save(&sample_config())?;

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        Ok(())
    }
}
