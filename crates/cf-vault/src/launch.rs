//! Environment composition and process launch
//!
//! The session environment is layered over the ambient one and the current
//! process image is replaced by the target command (or the user's shell).
//! Nothing runs after a successful launch, so the session marker is the
//! only thing standing between a user and a nested session.

use cf_vault_core::{ConfigError, ProfileStore};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::debug;

use crate::session::{Materializer, SessionEnv, SessionError, SESSION_MARKER};

/// Shell used when `SHELL` is unset
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Launch errors
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("cf-vault sessions shouldn't be nested, unset CLOUDFLARE_VAULT_SESSION to force (active profile: {0:?})")]
    NestedSession(String),

    #[error("couldn't find the executable {0:?} in PATH")]
    ExecutableNotFound(String),

    #[error("failed to execute {}: {source}", program.display())]
    Exec {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Fail if `ambient` already carries the session marker
pub fn ensure_not_nested<I, K, V>(ambient: I) -> Result<(), LaunchError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    for (key, value) in ambient {
        if key.as_ref() == SESSION_MARKER {
            return Err(LaunchError::NestedSession(
                value.as_ref().to_string_lossy().into_owned(),
            ));
        }
    }
    Ok(())
}

/// Merge the session environment over the ambient one. Session entries win.
pub fn compose<I>(ambient: I, session: &SessionEnv) -> Result<Vec<(OsString, OsString)>, LaunchError>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let ambient: Vec<(OsString, OsString)> = ambient.into_iter().collect();
    ensure_not_nested(ambient.iter().map(|(k, v)| (k, v)))?;

    let mut merged: BTreeMap<OsString, OsString> = ambient.into_iter().collect();
    for (key, value) in session {
        merged.insert(OsString::from(key), OsString::from(value));
    }

    Ok(merged.into_iter().collect())
}

/// What to run once the environment is ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Interactive shell
    Shell(String),
    /// Explicit command and its arguments
    Command { program: String, args: Vec<String> },
}

impl Target {
    /// Interpret trailing CLI arguments; no arguments means a shell.
    pub fn from_args(mut args: Vec<String>, shell: Option<String>) -> Self {
        if args.is_empty() {
            let shell = shell
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SHELL.to_string());
            return Self::Shell(shell);
        }

        let program = args.remove(0);
        Self::Command { program, args }
    }

    fn program(&self) -> &str {
        match self {
            Self::Shell(shell) => shell,
            Self::Command { program, .. } => program,
        }
    }

    fn args(&self) -> &[String] {
        match self {
            Self::Shell(_) => &[],
            Self::Command { args, .. } => args,
        }
    }
}

/// Resolve `program` against a `PATH` value
pub fn resolve(program: &str, path: Option<&OsStr>, cwd: &Path) -> Result<PathBuf, LaunchError> {
    which::which_in(program, path, cwd)
        .map_err(|_| LaunchError::ExecutableNotFound(program.to_string()))
}

/// A fully prepared launch
pub struct Launcher {
    program: PathBuf,
    target: Target,
    env: Vec<(OsString, OsString)>,
}

impl Launcher {
    /// Compose the environment and resolve the target, without launching
    pub fn prepare<I>(target: Target, ambient: I, session: &SessionEnv) -> Result<Self, LaunchError>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let env = compose(ambient, session)?;

        let path = env
            .iter()
            .find(|(k, _)| k == "PATH")
            .map(|(_, v)| v.clone());
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        let program = resolve(target.program(), path.as_deref(), &cwd)?;

        debug!("resolved {} to {}", target.program(), program.display());
        Ok(Self {
            program,
            target,
            env,
        })
    }

    /// Everything `exec` does before replacing the process.
    ///
    /// The nesting guard runs first, so a nested call never reads the
    /// profile's secret or talks to the API.
    pub fn for_profile<I>(
        name: &str,
        target: Target,
        ambient: I,
        profiles: &ProfileStore,
        materializer: &Materializer<'_>,
        now: DateTime<Utc>,
    ) -> Result<Self, LaunchError>
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let ambient: Vec<(OsString, OsString)> = ambient.into_iter().collect();
        ensure_not_nested(ambient.iter().map(|(k, v)| (k, v)))?;

        let profile = profiles.get(name)?;
        let session = materializer.materialize(name, &profile, now)?;

        Self::prepare(target, ambient, &session)
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    #[cfg(test)]
    pub fn env(&self) -> &[(OsString, OsString)] {
        &self.env
    }

    /// Replace the current process. Only returns on failure.
    pub fn exec(self) -> Result<Infallible, LaunchError> {
        debug!("environment is populated with credentials, replacing process");

        let err = Command::new(&self.program)
            .arg0(self.target.program())
            .args(self.target.args())
            .env_clear()
            .envs(self.env)
            .exec();

        Err(LaunchError::Exec {
            program: self.program,
            source: err,
        })
    }
}
