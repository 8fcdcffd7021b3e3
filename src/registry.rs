use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

/// Reference to the key material used for a host. Only the location is kept,
/// never the key contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialRef {
    Agent,
    KeyFile(PathBuf),
}

impl CredentialRef {
    pub fn kind(&self) -> &'static str {
        match self {
            CredentialRef::Agent => "agent",
            CredentialRef::KeyFile(_) => "key_file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDescriptor {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub username: String,
    pub credential: CredentialRef,
}

impl HostDescriptor {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        credential: CredentialRef,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            username: username.into(),
            credential,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("host name '{0}' is registered more than once")]
    DuplicateName(String),
    #[error("host #{index}: field '{field}' must not be empty")]
    MissingField { index: usize, field: &'static str },
    #[error("host '{0}': port must be in range 1..65535")]
    InvalidPort(String),
}

/// Ordered, immutable list of hosts for one collection cycle.
#[derive(Debug, Clone, Default)]
pub struct HostRegistry {
    hosts: Vec<HostDescriptor>,
}

impl HostRegistry {
    pub fn new(hosts: Vec<HostDescriptor>) -> Result<Self, RegistryError> {
        let mut names = HashSet::new();
        for (index, host) in hosts.iter().enumerate() {
            if host.name.trim().is_empty() {
                return Err(RegistryError::MissingField {
                    index,
                    field: "name",
                });
            }
            if host.address.trim().is_empty() {
                return Err(RegistryError::MissingField {
                    index,
                    field: "host",
                });
            }
            if host.username.trim().is_empty() {
                return Err(RegistryError::MissingField {
                    index,
                    field: "username",
                });
            }
            if host.port == 0 {
                return Err(RegistryError::InvalidPort(host.name.clone()));
            }
            if !names.insert(host.name.as_str()) {
                return Err(RegistryError::DuplicateName(host.name.clone()));
            }
        }
        Ok(Self { hosts })
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostDescriptor> {
        self.hosts.iter()
    }
}
