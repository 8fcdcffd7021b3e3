use super::aggregate::{aggregate_for, AggregateError};
use super::runner::RemoteCommandRunner;
use super::suite::DiagnosticSuite;
use super::Timeouts;
use crate::registry::HostRegistry;
use crate::snapshot::{now_unix_ms, FleetSnapshot, HostRef, HostSnapshot, HostStatus, NotRunCause};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectOptions {
    /// Upper bound on hosts in flight; clamped to the registry size.
    pub max_parallel: usize,
    pub timeouts: Timeouts,
    pub deadline: Duration,
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("fleet snapshot is inconsistent: {0}")]
    Inconsistent(#[from] AggregateError),
}

/// One bounded-parallel pass of a [`DiagnosticSuite`] over a registry.
#[derive(Clone)]
pub struct FleetCollector {
    runner: Arc<RemoteCommandRunner>,
}

impl FleetCollector {
    pub fn new(runner: Arc<RemoteCommandRunner>) -> Self {
        Self { runner }
    }

    /// Returns one snapshot per registered host, in registry order. Host
    /// failures, panics and the deadline are folded into the host's own
    /// snapshot; nothing per-host is reported as an error.
    pub async fn collect(
        &self,
        registry: &HostRegistry,
        suite: Arc<DiagnosticSuite>,
        opts: CollectOptions,
    ) -> Result<FleetSnapshot, CollectError> {
        let started_at_ms = now_unix_ms();
        let started = Instant::now();
        let total = registry.len();
        let workers = opts.max_parallel.min(total).max(1);
        info!(hosts = total, workers, deadline_ms = opts.deadline.as_millis() as u64, "collection started");

        let slots: Arc<Vec<OnceLock<HostSnapshot>>> =
            Arc::new((0..total).map(|_| OnceLock::new()).collect());
        let gate = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        let mut slot_of_task = HashMap::with_capacity(total);

        for (index, host) in registry.iter().enumerate() {
            let runner = self.runner.clone();
            let host = host.clone();
            let suite = suite.clone();
            let slots = slots.clone();
            let gate = gate.clone();
            let timeouts = opts.timeouts;
            let handle = tasks.spawn(async move {
                let Ok(_permit) = gate.acquire_owned().await else {
                    return;
                };
                let snapshot = runner.run_batch(&host, &suite, timeouts).await;
                let _ = slots[index].set(snapshot);
            });
            slot_of_task.insert(handle.id(), index);
        }

        let mut faults: HashMap<usize, String> = HashMap::new();
        let drained = time::timeout_at(started + opts.deadline, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined {
                    if let Some(&index) = slot_of_task.get(&err.id()) {
                        faults.insert(index, err.to_string());
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                abandoned = tasks.len(),
                deadline_ms = opts.deadline.as_millis() as u64,
                "collection deadline elapsed, abandoning remaining hosts"
            );
            // Aborting drops each task's session, which releases it.
            tasks.shutdown().await;
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let now = now_unix_ms();
        let hosts: Vec<HostSnapshot> = registry
            .iter()
            .enumerate()
            .map(|(index, host)| {
                if let Some(snapshot) = slots[index].get() {
                    return snapshot.clone();
                }
                let (cause, reason) = match faults.remove(&index) {
                    Some(fault) => {
                        error!(host = %host.name, error = %fault, "host task failed");
                        (NotRunCause::InternalFault, format!("internal fault: {fault}"))
                    }
                    None => (
                        NotRunCause::DeadlineExceeded,
                        format!(
                            "collection deadline of {}ms exceeded",
                            opts.deadline.as_millis()
                        ),
                    ),
                };
                HostSnapshot::offline(HostRef::from(host), &suite, cause, reason, elapsed_ms, now)
            })
            .collect();

        let fleet = aggregate_for(registry, &hosts, started_at_ms)?;
        info!(
            hosts = total,
            online = fleet.count_by_status(HostStatus::Online),
            offline = fleet.count_by_status(HostStatus::Offline),
            with_errors = fleet.count_by_status(HostStatus::CompletedWithErrors),
            elapsed_ms,
            "collection finished"
        );
        Ok(fleet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CredentialRef, HostDescriptor};
    use crate::snapshot::ProbeOutcome;
    use crate::transport::mock::{HostScript, Reply, ScriptedTransport};

    fn registry(names: &[&str]) -> HostRegistry {
        HostRegistry::new(
            names
                .iter()
                .enumerate()
                .map(|(i, n)| {
                    HostDescriptor::new(*n, format!("10.0.0.{}", i + 1), 22, "ops", CredentialRef::Agent)
                })
                .collect(),
        )
        .unwrap()
    }

    fn options(max_parallel: usize) -> CollectOptions {
        CollectOptions {
            max_parallel,
            timeouts: Timeouts {
                connect: Duration::from_secs(2),
                command: Duration::from_secs(5),
            },
            deadline: Duration::from_secs(60),
        }
    }

    fn collector(transport: &Arc<ScriptedTransport>) -> FleetCollector {
        FleetCollector::new(Arc::new(RemoteCommandRunner::new(transport.clone())))
    }

    fn suite() -> Arc<DiagnosticSuite> {
        Arc::new(DiagnosticSuite::standard().unwrap())
    }

    fn names(fleet: &FleetSnapshot) -> Vec<&str> {
        fleet.hosts.iter().map(|h| h.name()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn results_follow_registry_order_not_completion_order() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .host("h1", HostScript::healthy(Duration::from_millis(500)))
                .host("h2", HostScript::healthy(Duration::from_millis(400)))
                .host("h3", HostScript::healthy(Duration::from_millis(300)))
                .host("h4", HostScript::healthy(Duration::from_millis(200)))
                .host("h5", HostScript::healthy(Duration::from_millis(100))),
        );
        let reg = registry(&["h1", "h2", "h3", "h4", "h5"]);

        let fleet = collector(&transport)
            .collect(&reg, suite(), options(5))
            .await
            .unwrap();

        assert_eq!(names(&fleet), ["h1", "h2", "h3", "h4", "h5"]);
        assert!(fleet.hosts.iter().all(|h| h.status == HostStatus::Online));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_registry_yields_empty_snapshot() {
        let transport = Arc::new(ScriptedTransport::new());
        let fleet = collector(&transport)
            .collect(&registry(&[]), suite(), options(4))
            .await
            .unwrap();
        assert!(fleet.hosts.is_empty());
        assert!(fleet.collected_at_ms > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_fleet_scenario() {
        let gpu = DiagnosticSuite::standard().unwrap().get("gpu").unwrap().command.clone();
        let transport = Arc::new(
            ScriptedTransport::new()
                .host("A", HostScript::healthy(Duration::from_millis(80)))
                .host("B", HostScript::unreachable(Duration::from_secs(300)))
                .host(
                    "C",
                    HostScript::healthy(Duration::from_millis(80)).reply(
                        &gpu,
                        Reply::failed("bash: nvidia-smi: command not found\n", 127),
                    ),
                ),
        );
        let reg = registry(&["A", "B", "C"]);
        let started = Instant::now();

        let fleet = collector(&transport)
            .collect(&reg, suite(), options(3))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(names(&fleet), ["A", "B", "C"]);

        let a = fleet.host("A").unwrap();
        assert_eq!(a.status, HostStatus::Online);
        assert_eq!(a.probes.len(), 6);
        assert!(a.probes.iter().all(|p| p.outcome == ProbeOutcome::Success));

        let b = fleet.host("B").unwrap();
        assert_eq!(b.status, HostStatus::Offline);
        assert_eq!(
            b.probe("liveness").unwrap().cause,
            Some(NotRunCause::ConnectionError)
        );
        assert!(b.probes.iter().all(|p| p.outcome == ProbeOutcome::NotRun));

        let c = fleet.host("C").unwrap();
        assert_eq!(c.status, HostStatus::Online);
        for probe in &c.probes {
            let expected = if probe.probe == "gpu" {
                ProbeOutcome::CapabilityAbsent
            } else {
                ProbeOutcome::Success
            };
            assert_eq!(probe.outcome, expected);
        }

        // Bounded by B's connect timeout, not the sum of all hosts.
        assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(2_200), "{elapsed:?}");
        assert_eq!(transport.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn single_worker_runs_hosts_back_to_back() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .host("a", HostScript::healthy(Duration::from_millis(100)))
                .host("b", HostScript::healthy(Duration::from_millis(100)))
                .host("c", HostScript::healthy(Duration::from_millis(100))),
        );
        let reg = registry(&["a", "b", "c"]);

        let started = Instant::now();
        collector(&transport)
            .collect(&reg, suite(), options(1))
            .await
            .unwrap();
        let serial = started.elapsed();

        let started = Instant::now();
        collector(&transport)
            .collect(&reg, suite(), options(8))
            .await
            .unwrap();
        let parallel = started.elapsed();

        // Each host takes 6 x 100ms.
        assert!(serial >= Duration::from_millis(1_800), "{serial:?}");
        assert!(serial < Duration::from_millis(1_900), "{serial:?}");
        assert!(parallel >= Duration::from_millis(600), "{parallel:?}");
        assert!(parallel < Duration::from_millis(700), "{parallel:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_abandons_stuck_host_and_keeps_finished_ones() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .host("fast", HostScript::healthy(Duration::from_millis(10)))
                .host(
                    "stuck",
                    HostScript::healthy(Duration::ZERO).reply("uptime", Reply::Hang),
                ),
        );
        let reg = registry(&["stuck", "fast"]);
        let mut opts = options(2);
        opts.timeouts.command = Duration::from_secs(600);
        opts.deadline = Duration::from_secs(3);
        let started = Instant::now();

        let fleet = collector(&transport)
            .collect(&reg, suite(), opts)
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(names(&fleet), ["stuck", "fast"]);
        let stuck = fleet.host("stuck").unwrap();
        assert_eq!(stuck.status, HostStatus::Offline);
        assert_eq!(
            stuck.probe("liveness").unwrap().cause,
            Some(NotRunCause::DeadlineExceeded)
        );
        assert!(stuck.offline_reason.as_deref().unwrap().contains("deadline"));
        assert_eq!(fleet.host("fast").unwrap().status, HostStatus::Online);
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3_100));
        assert_eq!(transport.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_covers_hosts_still_waiting_for_a_worker() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .host("first", HostScript::healthy(Duration::from_secs(1)))
                .host("second", HostScript::healthy(Duration::from_secs(1))),
        );
        let reg = registry(&["first", "second"]);
        let mut opts = options(1);
        opts.deadline = Duration::from_secs(7);

        let fleet = collector(&transport)
            .collect(&reg, suite(), opts)
            .await
            .unwrap();

        assert_eq!(fleet.host("first").unwrap().status, HostStatus::Online);
        assert_eq!(
            fleet.host("second").unwrap().probe("liveness").unwrap().cause,
            Some(NotRunCause::DeadlineExceeded)
        );
        assert!(transport.executed_on("second").len() < 6);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_host_is_isolated() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .host("ok", HostScript::healthy(Duration::from_millis(10)))
                .host(
                    "broken",
                    HostScript::healthy(Duration::ZERO).reply("uptime", Reply::Panic),
                ),
        );
        let reg = registry(&["broken", "ok"]);

        let fleet = collector(&transport)
            .collect(&reg, suite(), options(2))
            .await
            .unwrap();

        let broken = fleet.host("broken").unwrap();
        assert_eq!(broken.status, HostStatus::Offline);
        assert_eq!(
            broken.probe("liveness").unwrap().cause,
            Some(NotRunCause::InternalFault)
        );
        assert_eq!(fleet.host("ok").unwrap().status, HostStatus::Online);
        assert_eq!(transport.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fault_in_later_probe_keeps_host_reachable() {
        let disk = DiagnosticSuite::standard().unwrap().get("disk").unwrap().command.clone();
        let transport = Arc::new(ScriptedTransport::new().host(
            "flaky",
            HostScript::healthy(Duration::from_millis(10)).reply(&disk, Reply::Panic),
        ));
        let reg = registry(&["flaky"]);

        let fleet = collector(&transport)
            .collect(&reg, suite(), options(1))
            .await
            .unwrap();

        let flaky = fleet.host("flaky").unwrap();
        assert_eq!(flaky.status, HostStatus::CompletedWithErrors);
        assert_eq!(flaky.probe("liveness").unwrap().outcome, ProbeOutcome::Success);
        assert_eq!(flaky.probe("disk").unwrap().outcome, ProbeOutcome::CommandError);
        assert_eq!(flaky.probe("memory").unwrap().outcome, ProbeOutcome::Success);
    }
}
