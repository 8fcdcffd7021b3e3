use crate::registry::CredentialRef;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("key file {0} not found")]
    NotFound(String),
    #[error("key file {path} is not readable: {source}")]
    Unreadable {
        path: String,
        source: std::io::Error,
    },
}

/// What the session needs to authenticate. Holds a location, not key bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedCredential {
    Agent,
    IdentityFile(PathBuf),
}

pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, reference: &CredentialRef) -> Result<ResolvedCredential, CredentialError>;
}

/// Resolves key file references on the local filesystem, expanding `~/`.
#[derive(Debug, Clone, Default)]
pub struct KeyFileResolver {
    home: Option<PathBuf>,
}

impl KeyFileResolver {
    pub fn from_env() -> Self {
        Self {
            home: std::env::var_os("HOME").map(PathBuf::from),
        }
    }

    #[cfg(test)]
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: Some(home.into()),
        }
    }

    fn expand(&self, path: &Path) -> PathBuf {
        match (path.strip_prefix("~"), &self.home) {
            (Ok(rest), Some(home)) => home.join(rest),
            _ => path.to_path_buf(),
        }
    }
}

impl CredentialResolver for KeyFileResolver {
    fn resolve(&self, reference: &CredentialRef) -> Result<ResolvedCredential, CredentialError> {
        let path = match reference {
            CredentialRef::Agent => return Ok(ResolvedCredential::Agent),
            CredentialRef::KeyFile(path) => self.expand(path),
        };
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(ResolvedCredential::IdentityFile(path)),
            Ok(_) => Err(CredentialError::NotFound(path.display().to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(CredentialError::NotFound(path.display().to_string()))
            }
            Err(source) => Err(CredentialError::Unreadable {
                path: path.display().to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_reference_needs_no_file() {
        let resolver = KeyFileResolver::with_home("/nonexistent");
        assert_eq!(
            resolver.resolve(&CredentialRef::Agent).unwrap(),
            ResolvedCredential::Agent
        );
    }

    #[test]
    fn tilde_is_expanded_against_home() {
        let home = tempfile::tempdir().unwrap();
        let key = home.path().join(".ssh").join("id_ed25519");
        std::fs::create_dir_all(key.parent().unwrap()).unwrap();
        std::fs::write(&key, b"placeholder").unwrap();

        let resolver = KeyFileResolver::with_home(home.path());
        let resolved = resolver
            .resolve(&CredentialRef::KeyFile(PathBuf::from("~/.ssh/id_ed25519")))
            .unwrap();
        assert_eq!(resolved, ResolvedCredential::IdentityFile(key));
    }

    #[test]
    fn missing_key_file_is_reported() {
        let home = tempfile::tempdir().unwrap();
        let resolver = KeyFileResolver::with_home(home.path());
        let err = resolver
            .resolve(&CredentialRef::KeyFile(PathBuf::from("~/missing")))
            .unwrap_err();
        assert!(matches!(err, CredentialError::NotFound(_)));
    }
}
