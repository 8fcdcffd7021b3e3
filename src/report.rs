use crate::snapshot::{FleetSnapshot, HostSnapshot, HostStatus, ProbeOutcome};
use serde::Serialize;
use std::fmt::Write as _;
use std::time::{Duration, UNIX_EPOCH};

const SLOWEST_SHOWN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Fast,
    Normal,
    Slow,
    VerySlow,
}

impl Verdict {
    pub fn from_average(avg: Duration) -> Self {
        if avg > Duration::from_secs(10) {
            Verdict::VerySlow
        } else if avg > Duration::from_secs(5) {
            Verdict::Slow
        } else if avg > Duration::from_secs(2) {
            Verdict::Normal
        } else {
            Verdict::Fast
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Fast => "fast",
            Verdict::Normal => "normal",
            Verdict::Slow => "slow",
            Verdict::VerySlow => "very slow",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostTiming {
    pub name: String,
    pub status: HostStatus,
    pub elapsed_ms: u64,
    pub connect_latency_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedHost {
    pub name: String,
    pub reason: String,
}

/// Timing summary of one collection cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LatencyReport {
    pub collected_at: String,
    pub total_hosts: usize,
    pub cycle_elapsed_ms: u64,
    pub average_host_ms: u64,
    /// Lower bound for the cycle with unlimited parallelism: the slowest host.
    pub expected_parallel_ms: u64,
    pub slowest: Vec<HostTiming>,
    pub failed: Vec<FailedHost>,
    pub verdict: Verdict,
}

impl LatencyReport {
    pub fn from_snapshot(snapshot: &FleetSnapshot, cycle_elapsed: Duration) -> Self {
        let total_hosts = snapshot.hosts.len();
        let sum: u64 = snapshot.hosts.iter().map(|h| h.elapsed_ms).sum();
        let average_host_ms = if total_hosts > 0 {
            sum / total_hosts as u64
        } else {
            0
        };

        let mut slowest: Vec<HostTiming> = snapshot
            .hosts
            .iter()
            .map(|h| HostTiming {
                name: h.name().to_string(),
                status: h.status,
                elapsed_ms: h.elapsed_ms,
                connect_latency_ms: h.connect_latency_ms,
            })
            .collect();
        // stable: ties keep registry order
        slowest.sort_by(|a, b| b.elapsed_ms.cmp(&a.elapsed_ms));
        let expected_parallel_ms = slowest.first().map(|h| h.elapsed_ms).unwrap_or(0);
        slowest.truncate(SLOWEST_SHOWN);

        let failed = snapshot
            .hosts
            .iter()
            .filter(|h| h.status == HostStatus::Offline)
            .map(|h| FailedHost {
                name: h.name().to_string(),
                reason: h
                    .offline_reason
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            })
            .collect();

        Self {
            collected_at: format_timestamp(snapshot.collected_at_ms),
            total_hosts,
            cycle_elapsed_ms: cycle_elapsed.as_millis() as u64,
            average_host_ms,
            expected_parallel_ms,
            slowest,
            failed,
            verdict: Verdict::from_average(Duration::from_millis(average_host_ms)),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Latency report, {}", self.collected_at);
        let _ = writeln!(out, "hosts: {}", self.total_hosts);
        let _ = writeln!(out, "cycle time: {}", ms(self.cycle_elapsed_ms));
        let _ = writeln!(out, "average per host: {}", ms(self.average_host_ms));
        let _ = writeln!(out, "expected parallel time: {}", ms(self.expected_parallel_ms));
        let _ = writeln!(out, "verdict: {}", self.verdict.as_str());

        if !self.slowest.is_empty() {
            let _ = writeln!(out, "\nslowest hosts:");
            for (i, h) in self.slowest.iter().enumerate() {
                let connect = h
                    .connect_latency_ms
                    .map(|c| format!(", connect {}", ms(c)))
                    .unwrap_or_default();
                let _ = writeln!(
                    out,
                    "  {}. {} {} ({}{})",
                    i + 1,
                    h.name,
                    ms(h.elapsed_ms),
                    h.status.as_str(),
                    connect
                );
            }
        }

        if !self.failed.is_empty() {
            let _ = writeln!(out, "\nfailed connections:");
            for f in &self.failed {
                let _ = writeln!(out, "  {}: {}", f.name, f.reason);
            }
        }
        out
    }
}

/// Operator-readable overview of a fleet snapshot.
pub fn render_text(snapshot: &FleetSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Fleet snapshot, {}: {} hosts, {} online, {} with errors, {} offline",
        format_timestamp(snapshot.collected_at_ms),
        snapshot.hosts.len(),
        snapshot.count_by_status(HostStatus::Online),
        snapshot.count_by_status(HostStatus::CompletedWithErrors),
        snapshot.count_by_status(HostStatus::Offline),
    );
    for host in &snapshot.hosts {
        render_host(&mut out, host);
    }
    out
}

fn render_host(out: &mut String, host: &HostSnapshot) {
    let _ = writeln!(
        out,
        "\n== {} ({}@{}:{}) {} in {}",
        host.host.name,
        host.host.username,
        host.host.address,
        host.host.port,
        host.status.as_str(),
        ms(host.elapsed_ms)
    );
    if let Some(reason) = &host.offline_reason {
        let _ = writeln!(out, "   {reason}");
        return;
    }
    for probe in &host.probes {
        match probe.outcome {
            ProbeOutcome::Success => {
                let _ = writeln!(out, "-- {}", probe.probe);
                for line in probe.output.trim_end().lines() {
                    let _ = writeln!(out, "   {line}");
                }
            }
            ProbeOutcome::CapabilityAbsent => {
                let _ = writeln!(out, "-- {}: not available", probe.probe);
            }
            ProbeOutcome::CommandError => {
                let _ = writeln!(out, "-- {}: error", probe.probe);
                for line in probe.error_output.trim_end().lines() {
                    let _ = writeln!(out, "   {line}");
                }
            }
            ProbeOutcome::NotRun => {
                let _ = writeln!(out, "-- {}: not run", probe.probe);
            }
        }
    }
}

fn ms(value: u64) -> String {
    humantime::format_duration(Duration::from_millis(value)).to_string()
}

fn format_timestamp(unix_ms: i64) -> String {
    let at = UNIX_EPOCH + Duration::from_millis(unix_ms.max(0) as u64);
    humantime::format_rfc3339_seconds(at).to_string()
}
