use crate::transport::CommandOutput;
use std::collections::HashSet;
use thiserror::Error;

pub const LIVENESS: &str = "liveness";

/// Exit status shells use for "command not found".
const EXIT_NOT_FOUND: i32 = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeRole {
    Liveness,
    Diagnostic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sentinel {
    /// Case-insensitive substring of stdout or stderr.
    Text(String),
    ExitStatus(i32),
}

/// Declares what a probe's output looks like when the queried tool or
/// service simply is not present on the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AbsenceMatcher {
    any_of: Vec<Sentinel>,
}

impl AbsenceMatcher {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn text(mut self, needle: &str) -> Self {
        self.any_of.push(Sentinel::Text(needle.to_lowercase()));
        self
    }

    pub fn exit_status(mut self, code: i32) -> Self {
        self.any_of.push(Sentinel::ExitStatus(code));
        self
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.any_of.is_empty()
    }

    pub fn matches(&self, output: &CommandOutput) -> bool {
        if self.any_of.is_empty() {
            return false;
        }
        let stdout = output.stdout.to_lowercase();
        let stderr = output.stderr.to_lowercase();
        self.any_of.iter().any(|sentinel| match sentinel {
            Sentinel::Text(needle) => stdout.contains(needle) || stderr.contains(needle),
            Sentinel::ExitStatus(code) => output.exit_code == Some(*code),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeDefinition {
    pub name: String,
    pub command: String,
    pub absent: AbsenceMatcher,
    pub role: ProbeRole,
}

impl ProbeDefinition {
    pub fn liveness(command: &str) -> Self {
        Self {
            name: LIVENESS.to_string(),
            command: command.to_string(),
            absent: AbsenceMatcher::none(),
            role: ProbeRole::Liveness,
        }
    }

    pub fn diagnostic(name: &str, command: &str, absent: AbsenceMatcher) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            absent,
            role: ProbeRole::Diagnostic,
        }
    }

    pub fn is_liveness(&self) -> bool {
        self.role == ProbeRole::Liveness
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SuiteError {
    #[error("suite has no liveness probe")]
    MissingLiveness,
    #[error("liveness probe must run first")]
    LivenessNotFirst,
    #[error("suite declares more than one liveness probe")]
    MultipleLiveness,
    #[error("probe '{0}' is declared more than once")]
    DuplicateProbe(String),
}

/// Ordered probe table. Pure configuration, performs no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticSuite {
    probes: Vec<ProbeDefinition>,
}

impl DiagnosticSuite {
    pub fn new(probes: Vec<ProbeDefinition>) -> Result<Self, SuiteError> {
        let liveness_count = probes.iter().filter(|p| p.is_liveness()).count();
        match liveness_count {
            0 => return Err(SuiteError::MissingLiveness),
            1 => {}
            _ => return Err(SuiteError::MultipleLiveness),
        }
        if !probes.first().is_some_and(ProbeDefinition::is_liveness) {
            return Err(SuiteError::LivenessNotFirst);
        }
        let mut names = HashSet::new();
        for probe in &probes {
            if !names.insert(probe.name.as_str()) {
                return Err(SuiteError::DuplicateProbe(probe.name.clone()));
            }
        }
        Ok(Self { probes })
    }

    /// liveness, cpu, disk, memory, gpu, containers.
    pub fn standard() -> Result<Self, SuiteError> {
        let not_installed = || {
            AbsenceMatcher::none()
                .text("command not found")
                .exit_status(EXIT_NOT_FOUND)
        };
        Self::new(vec![
            ProbeDefinition::liveness("uptime"),
            ProbeDefinition::diagnostic(
                "cpu",
                "top -bn1 | grep 'Cpu(s)' | head -1",
                not_installed(),
            ),
            ProbeDefinition::diagnostic("disk", "df -h", not_installed()),
            ProbeDefinition::diagnostic("memory", "free -h", not_installed()),
            ProbeDefinition::diagnostic(
                "gpu",
                "nvidia-smi",
                not_installed()
                    .text("nvidia-smi has failed")
                    .text("couldn't communicate with the nvidia driver")
                    .text("no devices were found"),
            ),
            ProbeDefinition::diagnostic(
                "containers",
                "docker ps",
                not_installed().text("cannot connect to the docker daemon"),
            ),
        ])
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProbeDefinition> {
        self.probes.iter()
    }

    pub fn liveness(&self) -> &ProbeDefinition {
        // `new` guarantees a leading liveness probe.
        &self.probes[0]
    }

    pub fn diagnostics(&self) -> impl Iterator<Item = &ProbeDefinition> {
        self.probes.iter().skip(1)
    }

    #[cfg(test)]
    pub fn get(&self, name: &str) -> Option<&ProbeDefinition> {
        self.probes.iter().find(|p| p.name == name)
    }
}
