//! Standard paths used by cf-vault

use std::path::{Path, PathBuf};

/// Environment variable that relocates the whole cf-vault directory.
pub const HOME_ENV: &str = "CF_VAULT_HOME";

/// Standard cf-vault paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Root directory (~/.cf-vault)
    pub root: PathBuf,
    /// Profile config file (~/.cf-vault/config.toml)
    pub config: PathBuf,
    /// File-backed secret store (~/.cf-vault/keys)
    pub keys: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    /// Resolve paths from `CF_VAULT_HOME`, falling back to `~/.cf-vault`.
    pub fn new() -> Self {
        Self::resolve(std::env::var_os(HOME_ENV).map(PathBuf::from))
    }

    fn resolve(override_root: Option<PathBuf>) -> Self {
        let root = override_root.filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join(".cf-vault")
        });
        Self::from_root(&root)
    }

    /// Lay out the standard files under an explicit root.
    pub fn from_root(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            config: root.join("config.toml"),
            keys: root.join("keys"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_root_layout() {
        let paths = Paths::from_root(Path::new("/tmp/vault"));
        assert_eq!(paths.config, PathBuf::from("/tmp/vault/config.toml"));
        assert_eq!(paths.keys, PathBuf::from("/tmp/vault/keys"));
    }

    #[test]
    fn test_override_root() {
        let paths = Paths::resolve(Some(PathBuf::from("/srv/cf")));
        assert_eq!(paths.root, PathBuf::from("/srv/cf"));

        // An empty override is ignored
        let paths = Paths::resolve(Some(PathBuf::new()));
        assert!(paths.root.ends_with(".cf-vault"));
    }
}
