//! Secret store - where long lived credentials live
//!
//! Secrets are opaque bytes addressed by `"{profile}-{auth_type}"`. Two real
//! backends exist: the OS keychain (via `keyring`) and an age-encrypted file
//! store under `~/.cf-vault/keys/` unlocked with a passphrase. The backend is
//! picked explicitly; a failing backend is an error, never a reason to try
//! another one.

use age::secrecy::SecretString;
use cf_vault_core::{AuthType, Paths};
use std::cell::{Cell, OnceCell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

/// Service name used for keychain entries
pub const SERVICE_NAME: &str = "cf-vault";

/// Passphrase override for unattended use of the file store
pub const PASSPHRASE_ENV: &str = "CF_VAULT_FILE_PASSPHRASE";

/// Backend selection override
pub const BACKEND_ENV: &str = "CF_VAULT_BACKEND";

/// Secret store errors
#[derive(Error, Debug)]
pub enum SecretStoreError {
    #[error("no credentials stored for {0:?}, add the profile again")]
    NotFound(String),

    #[error("secret store backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("secret store refused the write: {0}")]
    WriteDenied(String),

    #[error("failed to decrypt stored secret: {0}")]
    DecryptionFailed(String),

    #[error("invalid secret key: {0}")]
    InvalidKey(String),

    #[error("unknown secret store backend {0:?}, valid backends: [keychain, file]")]
    UnknownBackend(String),
}

/// Composite key a profile's secret is stored under
pub fn secret_key(profile: &str, auth_type: AuthType) -> String {
    format!("{}-{}", profile, auth_type.as_str())
}

/// Set/get of opaque secrets by key
pub trait SecretStore {
    fn set(&self, key: &str, secret: &[u8]) -> Result<(), SecretStoreError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, SecretStoreError>;
}

/// Available secret store backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// OS-native store (Keychain, Credential Manager, kernel keyring)
    Keychain,
    /// Passphrase-encrypted files
    File,
}

impl Backend {
    /// Keychain where the OS store persists across logins, files elsewhere
    pub fn platform_default() -> Self {
        if cfg!(any(target_os = "macos", target_os = "windows")) {
            Self::Keychain
        } else {
            Self::File
        }
    }

    /// Resolve from an optional `CF_VAULT_BACKEND` value
    pub fn from_setting(value: Option<&str>) -> Result<Self, SecretStoreError> {
        match value.map(str::trim).filter(|v| !v.is_empty()) {
            Some(v) => v.parse(),
            None => Ok(Self::platform_default()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keychain => "keychain",
            Self::File => "file",
        }
    }
}

impl FromStr for Backend {
    type Err = SecretStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keychain" | "os" => Ok(Self::Keychain),
            "file" => Ok(Self::File),
            other => Err(SecretStoreError::UnknownBackend(other.to_string())),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open the selected backend
pub fn open(backend: Backend, paths: &Paths) -> Box<dyn SecretStore> {
    debug!("using {} secret store", backend);
    match backend {
        Backend::Keychain => Box::new(KeyringStore::new(SERVICE_NAME)),
        Backend::File => Box::new(FileStore::new(&paths.keys, Box::new(prompt_passphrase))),
    }
}

/// Read the file store passphrase from the environment or the terminal
pub fn prompt_passphrase(prompt: &str) -> io::Result<String> {
    if let Ok(passphrase) = std::env::var(PASSPHRASE_ENV) {
        return Ok(passphrase);
    }
    rpassword::prompt_password(format!("{}: ", prompt))
}

/// OS-native secret store
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry, SecretStoreError> {
        keyring::Entry::new(&self.service, key)
            .map_err(|e| SecretStoreError::BackendUnavailable(e.to_string()))
    }
}

impl SecretStore for KeyringStore {
    fn set(&self, key: &str, secret: &[u8]) -> Result<(), SecretStoreError> {
        self.entry(key)?.set_secret(secret).map_err(|e| match e {
            keyring::Error::NoStorageAccess(_) | keyring::Error::PlatformFailure(_) => {
                SecretStoreError::BackendUnavailable(e.to_string())
            }
            other => SecretStoreError::WriteDenied(other.to_string()),
        })
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, SecretStoreError> {
        self.entry(key)?.get_secret().map_err(|e| match e {
            keyring::Error::NoEntry => SecretStoreError::NotFound(key.to_string()),
            keyring::Error::BadEncoding(_) => SecretStoreError::DecryptionFailed(e.to_string()),
            other => SecretStoreError::BackendUnavailable(other.to_string()),
        })
    }
}

/// Prompt used to obtain the file store passphrase
pub type PassphrasePrompt = Box<dyn Fn(&str) -> io::Result<String>>;

/// Age-encrypted file store
///
/// Each secret is a separate passphrase-encrypted `.age` file. The
/// passphrase is asked for at most once per process.
pub struct FileStore {
    dir: PathBuf,
    prompt: PassphrasePrompt,
    passphrase: OnceCell<SecretString>,
}

impl FileStore {
    pub fn new(dir: &Path, prompt: PassphrasePrompt) -> Self {
        Self {
            dir: dir.to_path_buf(),
            prompt,
            passphrase: OnceCell::new(),
        }
    }

    fn passphrase(&self) -> Result<&SecretString, SecretStoreError> {
        if let Some(passphrase) = self.passphrase.get() {
            return Ok(passphrase);
        }

        let entered = (self.prompt)(&format!(
            "Passphrase to unlock {}",
            self.dir.display()
        ))
        .map_err(|e| SecretStoreError::BackendUnavailable(format!("failed to read passphrase: {}", e)))?;

        if entered.is_empty() {
            return Err(SecretStoreError::BackendUnavailable(
                "empty passphrase not allowed".to_string(),
            ));
        }

        Ok(self.passphrase.get_or_init(|| SecretString::new(entered)))
    }

    fn validate_key(&self, key: &str) -> Result<(), SecretStoreError> {
        if key.is_empty() {
            return Err(SecretStoreError::InvalidKey("key cannot be empty".to_string()));
        }
        if key.contains("..") || key.starts_with('.') {
            return Err(SecretStoreError::InvalidKey(format!("invalid key format: {}", key)));
        }
        for c in key.chars() {
            if !c.is_alphanumeric() && c != '_' && c != '-' && c != '.' {
                return Err(SecretStoreError::InvalidKey(format!(
                    "invalid character '{}' in key",
                    c
                )));
            }
        }
        Ok(())
    }

    fn secret_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.age", key))
    }

    fn ensure_dir(&self) -> io::Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
            fs::set_permissions(&self.dir, Permissions::from_mode(0o700))?;
        }
        Ok(())
    }
}

impl SecretStore for FileStore {
    fn set(&self, key: &str, secret: &[u8]) -> Result<(), SecretStoreError> {
        self.validate_key(key)?;
        let passphrase = self.passphrase()?.clone();

        self.ensure_dir()
            .map_err(|e| SecretStoreError::WriteDenied(e.to_string()))?;

        let encryptor = age::Encryptor::with_user_passphrase(passphrase);

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| SecretStoreError::WriteDenied(e.to_string()))?;
        writer
            .write_all(secret)
            .map_err(|e| SecretStoreError::WriteDenied(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| SecretStoreError::WriteDenied(e.to_string()))?;

        let path = self.secret_path(key);
        let write = || -> io::Result<()> {
            let mut file = File::create(&path)?;
            file.write_all(&encrypted)?;
            fs::set_permissions(&path, Permissions::from_mode(0o600))
        };
        write().map_err(|e| SecretStoreError::WriteDenied(format!("{}: {}", path.display(), e)))?;

        debug!("stored secret {} in {}", key, self.dir.display());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, SecretStoreError> {
        self.validate_key(key)?;

        let path = self.secret_path(key);
        let encrypted = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SecretStoreError::NotFound(key.to_string()))
            }
            Err(e) => return Err(SecretStoreError::BackendUnavailable(e.to_string())),
        };

        let passphrase = self.passphrase()?;

        let decryptor = match age::Decryptor::new(&encrypted[..])
            .map_err(|e| SecretStoreError::DecryptionFailed(e.to_string()))?
        {
            age::Decryptor::Passphrase(d) => d,
            _ => {
                return Err(SecretStoreError::DecryptionFailed(
                    "unexpected recipient encryption".to_string(),
                ))
            }
        };

        let mut decrypted = vec![];
        let mut reader = decryptor
            .decrypt(passphrase, None)
            .map_err(|e| SecretStoreError::DecryptionFailed(e.to_string()))?;
        reader
            .read_to_end(&mut decrypted)
            .map_err(|e| SecretStoreError::DecryptionFailed(e.to_string()))?;

        Ok(decrypted)
    }
}

/// In-process store with no persistence. Backs the unit tests.
#[derive(Default)]
pub struct MemoryStore {
    items: RefCell<HashMap<String, Vec<u8>>>,
    reads: Cell<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls served so far
    pub fn reads(&self) -> usize {
        self.reads.get()
    }
}

impl SecretStore for MemoryStore {
    fn set(&self, key: &str, secret: &[u8]) -> Result<(), SecretStoreError> {
        self.items
            .borrow_mut()
            .insert(key.to_string(), secret.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, SecretStoreError> {
        self.reads.set(self.reads.get() + 1);
        self.items
            .borrow()
            .get(key)
            .cloned()
            .ok_or_else(|| SecretStoreError::NotFound(key.to_string()))
    }
}
