//! Credential providers.
//!
//! The pipeline never stores or persists the API key itself. It asks a [`CredentialProvider`]
//! for the current value each time a stage is about to run, so a key changed mid-session is
//! picked up by the next call.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::debug;

use crate::error::{Error, Result};

/// Supplies the opaque access credential for the generation service.
///
/// An empty (or whitespace-only) value is allowed here; stages reject it with
/// [`Error::MissingCredential`] at call time.
pub trait CredentialProvider: Send + Sync {
    /// Read the current credential.
    fn credential(&self) -> Result<String>;

    /// Replace the current credential. An empty value clears it.
    fn set_credential(&self, credential: &str) -> Result<()>;
}

impl<P: CredentialProvider + ?Sized> CredentialProvider for std::sync::Arc<P> {
    fn credential(&self) -> Result<String> {
        (**self).credential()
    }

    fn set_credential(&self, credential: &str) -> Result<()> {
        (**self).set_credential(credential)
    }
}

/// In-process credential, forgotten when dropped.
#[derive(Debug, Default)]
pub struct MemoryCredential {
    value: RwLock<String>,
}

impl MemoryCredential {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: RwLock::new(value.into()),
        }
    }
}

impl CredentialProvider for MemoryCredential {
    fn credential(&self) -> Result<String> {
        self.value
            .read()
            .map(|v| v.clone())
            .map_err(|_| Error::Credential("credential lock poisoned".to_string()))
    }

    fn set_credential(&self, credential: &str) -> Result<()> {
        let mut guard = self
            .value
            .write()
            .map_err(|_| Error::Credential("credential lock poisoned".to_string()))?;
        *guard = credential.trim().to_string();
        Ok(())
    }
}

/// Reads the credential from an environment variable at call time.
#[derive(Debug, Clone)]
pub struct EnvCredential {
    var: String,
}

impl EnvCredential {
    pub const DEFAULT_VAR: &'static str = "GEMINI_API_KEY";

    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    pub fn var(&self) -> &str {
        &self.var
    }
}

impl Default for EnvCredential {
    fn default() -> Self {
        Self::new(Self::DEFAULT_VAR)
    }
}

impl CredentialProvider for EnvCredential {
    fn credential(&self) -> Result<String> {
        Ok(std::env::var(&self.var).unwrap_or_default())
    }

    fn set_credential(&self, _credential: &str) -> Result<()> {
        Err(Error::Credential(format!(
            "environment variable {} is read-only",
            self.var
        )))
    }
}

/// Remembers the credential in a file across sessions.
///
/// Setting an empty credential removes the file ("forget this key").
#[derive(Debug, Clone)]
pub struct FileCredential {
    path: PathBuf,
}

impl FileCredential {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialProvider for FileCredential {
    fn credential(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(s) => Ok(s.trim().to_string()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn set_credential(&self, credential: &str) -> Result<()> {
        let credential = credential.trim();
        if credential.is_empty() {
            debug!(path = %self.path.display(), "forgetting saved credential");
            return match fs::remove_file(&self.path) {
                Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
                _ => Ok(()),
            };
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, credential)?;
        debug!(path = %self.path.display(), "saved credential");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_credential_trims_on_set() -> anyhow::Result<()> {
        let cred = MemoryCredential::default();
        assert_eq!(cred.credential()?, "");
        cred.set_credential("  abc \n")?;
        assert_eq!(cred.credential()?, "abc");
        Ok(())
    }

    #[test]
    fn env_credential_is_read_only() {
        let cred = EnvCredential::new("SCRIPTCLONE_TEST_UNSET_VAR");
        assert_eq!(cred.credential().unwrap(), "");
        assert!(matches!(
            cred.set_credential("x"),
            Err(Error::Credential(_))
        ));
    }

    #[test]
    fn file_credential_round_trips_and_forgets() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cred = FileCredential::new(dir.path().join("nested").join("key"));

        assert_eq!(cred.credential()?, "");

        cred.set_credential("secret")?;
        assert_eq!(cred.credential()?, "secret");
        assert!(cred.path().exists());

        cred.set_credential("")?;
        assert!(!cred.path().exists());
        assert_eq!(cred.credential()?, "");

        // Forgetting twice is fine.
        cred.set_credential("   ")?;
        Ok(())
    }
}
