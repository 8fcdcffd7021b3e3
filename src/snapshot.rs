use crate::collectors::suite::DiagnosticSuite;
use crate::registry::HostDescriptor;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeOutcome {
    Success,
    CapabilityAbsent,
    CommandError,
    NotRun,
}

impl ProbeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeOutcome::Success => "success",
            ProbeOutcome::CapabilityAbsent => "capability_absent",
            ProbeOutcome::CommandError => "command_error",
            ProbeOutcome::NotRun => "not_run",
        }
    }

    /// Capability-absent is a normal result, not a failure.
    pub fn is_error(self) -> bool {
        matches!(self, ProbeOutcome::CommandError)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotRunCause {
    ConnectionError,
    HostOffline,
    DeadlineExceeded,
    InternalFault,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub probe: String,
    pub outcome: ProbeOutcome,
    pub output: String,
    pub error_output: String,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<NotRunCause>,
    pub elapsed_ms: u64,
}

impl ProbeResult {
    pub fn not_run(probe: impl Into<String>, cause: NotRunCause) -> Self {
        Self {
            probe: probe.into(),
            outcome: ProbeOutcome::NotRun,
            output: String::new(),
            error_output: String::new(),
            exit_code: None,
            cause: Some(cause),
            elapsed_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Online,
    Offline,
    CompletedWithErrors,
}

impl HostStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HostStatus::Online => "online",
            HostStatus::Offline => "offline",
            HostStatus::CompletedWithErrors => "completed_with_errors",
        }
    }
}

/// Public identity of a host. Carries no credential information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostRef {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub username: String,
}

impl From<&HostDescriptor> for HostRef {
    fn from(value: &HostDescriptor) -> Self {
        Self {
            name: value.name.clone(),
            address: value.address.clone(),
            port: value.port,
            username: value.username.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostSnapshot {
    pub host: HostRef,
    pub status: HostStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offline_reason: Option<String>,
    pub probes: Vec<ProbeResult>,
    pub connect_latency_ms: Option<u64>,
    pub elapsed_ms: u64,
    pub collected_at_ms: i64,
}

impl HostSnapshot {
    /// Builds the snapshot of a host that never got past liveness. The liveness
    /// slot records `cause`, every other probe is marked as skipped.
    pub fn offline(
        host: HostRef,
        suite: &DiagnosticSuite,
        cause: NotRunCause,
        reason: impl Into<String>,
        elapsed_ms: u64,
        collected_at_ms: i64,
    ) -> Self {
        let probes = suite
            .iter()
            .map(|probe| {
                if probe.is_liveness() {
                    ProbeResult::not_run(&probe.name, cause)
                } else {
                    ProbeResult::not_run(&probe.name, NotRunCause::HostOffline)
                }
            })
            .collect();
        Self {
            host,
            status: HostStatus::Offline,
            offline_reason: Some(reason.into()),
            probes,
            connect_latency_ms: None,
            elapsed_ms,
            collected_at_ms,
        }
    }

    pub fn name(&self) -> &str {
        &self.host.name
    }

    #[cfg(test)]
    pub fn probe(&self, name: &str) -> Option<&ProbeResult> {
        self.probes.iter().find(|p| p.probe == name)
    }

    pub fn error_count(&self) -> usize {
        self.probes.iter().filter(|p| p.outcome.is_error()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetSnapshot {
    pub collected_at_ms: i64,
    pub hosts: Vec<HostSnapshot>,
}

impl FleetSnapshot {
    pub fn count_by_status(&self, status: HostStatus) -> usize {
        self.hosts.iter().filter(|h| h.status == status).count()
    }

    pub fn host(&self, name: &str) -> Option<&HostSnapshot> {
        self.hosts.iter().find(|h| h.host.name == name)
    }
}

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
