//! Remote shell transport.
//!
//! A [`Transport`] opens one authenticated [`Session`] per host; the session
//! then runs any number of commands until it is closed. Implementations must
//! release the underlying connection when a session is dropped without an
//! explicit [`Session::close`], since abandoned host tasks are cancelled by
//! dropping their futures.

pub mod credentials;
#[cfg(test)]
pub mod mock;
pub mod openssh;

use crate::registry::HostDescriptor;
use async_trait::async_trait;
use credentials::CredentialError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// Failures of the transport itself. All of them are connection-class: the
/// remote command either never started or its result was lost.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("session lost: {0}")]
    SessionLost(String),
    #[error("failed to start ssh: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        host: &HostDescriptor,
        timeout: Duration,
    ) -> Result<Box<dyn Session>, TransportError>;
}

#[async_trait]
pub trait Session: Send {
    async fn exec(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError>;

    async fn close(self: Box<Self>);
}
