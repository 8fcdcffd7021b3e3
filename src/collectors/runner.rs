use super::suite::{DiagnosticSuite, ProbeDefinition};
use super::Timeouts;
use crate::registry::HostDescriptor;
use crate::snapshot::{
    now_unix_ms, HostRef, HostSnapshot, HostStatus, NotRunCause, ProbeOutcome, ProbeResult,
};
use crate::transport::{CommandOutput, Session, Transport, TransportError};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

/// Runs a whole [`DiagnosticSuite`] against one host over a single session.
pub struct RemoteCommandRunner {
    transport: Arc<dyn Transport>,
}

impl RemoteCommandRunner {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn run_batch(
        &self,
        host: &HostDescriptor,
        suite: &DiagnosticSuite,
        timeouts: Timeouts,
    ) -> HostSnapshot {
        let started = Instant::now();
        let host_ref = HostRef::from(host);
        let offline = |reason: String| {
            HostSnapshot::offline(
                host_ref.clone(),
                suite,
                NotRunCause::ConnectionError,
                reason,
                elapsed_ms(started),
                now_unix_ms(),
            )
        };

        let connect = time::timeout(
            timeouts.connect,
            self.transport.connect(host, timeouts.connect),
        )
        .await
        .unwrap_or(Err(TransportError::Timeout(timeouts.connect)));
        let mut session = match connect {
            Ok(session) => session,
            Err(err) => {
                warn!(host = %host.name, address = %host.address, error = %err, "host offline");
                return offline(err.to_string());
            }
        };
        let connect_latency_ms = elapsed_ms(started);
        debug!(host = %host.name, connect_ms = connect_latency_ms, "session established");

        let liveness = suite.liveness();
        let probe_started = Instant::now();
        let liveness_result =
            match run_command(session.as_mut(), &liveness.command, timeouts.command).await {
                Ok(output) => classify(liveness, output, elapsed_ms(probe_started)),
                Err(err) => {
                    warn!(host = %host.name, error = %err, "liveness probe failed");
                    session.close().await;
                    return offline(err.to_string());
                }
            };

        let mut probes = Vec::with_capacity(suite.len());
        probes.push(liveness_result);
        for probe in suite.diagnostics() {
            let probe_started = Instant::now();
            // Liveness already answered, so a fault here stays with this probe.
            let attempt = AssertUnwindSafe(run_command(
                session.as_mut(),
                &probe.command,
                timeouts.command,
            ))
            .catch_unwind()
            .await;
            let result = match attempt {
                Ok(Ok(output)) => classify(probe, output, elapsed_ms(probe_started)),
                Ok(Err(err)) => failed(probe, err.to_string(), elapsed_ms(probe_started)),
                Err(payload) => failed(
                    probe,
                    format!("internal fault: {}", panic_message(payload.as_ref())),
                    elapsed_ms(probe_started),
                ),
            };
            if result.outcome.is_error() {
                warn!(
                    host = %host.name,
                    probe = %probe.name,
                    error = %result.error_output.trim(),
                    "probe failed"
                );
            }
            debug!(
                host = %host.name,
                probe = %probe.name,
                outcome = result.outcome.as_str(),
                elapsed_ms = result.elapsed_ms,
                "probe finished"
            );
            probes.push(result);
        }
        session.close().await;

        let status = if probes.iter().any(|p| p.outcome.is_error()) {
            HostStatus::CompletedWithErrors
        } else {
            HostStatus::Online
        };

        HostSnapshot {
            host: host_ref,
            status,
            offline_reason: None,
            probes,
            connect_latency_ms: Some(connect_latency_ms),
            elapsed_ms: elapsed_ms(started),
            collected_at_ms: now_unix_ms(),
        }
    }
}

async fn run_command(
    session: &mut dyn Session,
    command: &str,
    timeout: Duration,
) -> Result<CommandOutput, TransportError> {
    time::timeout(timeout, session.exec(command, timeout))
        .await
        .unwrap_or(Err(TransportError::Timeout(timeout)))
}

/// Sentinel first, then the error stream. A command that wrote nothing to
/// stderr is a success whatever its exit status.
pub fn classify(probe: &ProbeDefinition, output: CommandOutput, elapsed_ms: u64) -> ProbeResult {
    let outcome = if probe.absent.matches(&output) {
        ProbeOutcome::CapabilityAbsent
    } else if !output.stderr.trim().is_empty() {
        ProbeOutcome::CommandError
    } else {
        ProbeOutcome::Success
    };
    ProbeResult {
        probe: probe.name.clone(),
        outcome,
        output: output.stdout,
        error_output: output.stderr,
        exit_code: output.exit_code,
        cause: None,
        elapsed_ms,
    }
}

fn failed(probe: &ProbeDefinition, error_output: String, elapsed_ms: u64) -> ProbeResult {
    ProbeResult {
        probe: probe.name.clone(),
        outcome: ProbeOutcome::CommandError,
        output: String::new(),
        error_output,
        exit_code: None,
        cause: None,
        elapsed_ms,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
