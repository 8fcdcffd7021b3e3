use crate::snapshot::HostStatus;
use crate::state::State;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub fleet_hosts_total: Gauge,
    pub fleet_hosts_by_status: GaugeVec,
    pub fleet_host_up: GaugeVec,
    pub fleet_host_probe_errors: GaugeVec,
    pub fleet_host_collect_duration_ms: GaugeVec,
    pub fleet_host_connect_latency_ms: GaugeVec,
    pub fleet_host_consecutive_offline: GaugeVec,
    pub fleet_host_last_change_timestamp_seconds: GaugeVec,
    pub fleet_probe_outcome: GaugeVec,
    pub fleet_cycle_duration_ms: Gauge,
    pub fleet_cycles: Gauge,
    pub fleet_uptime_seconds: Gauge,
    pub fleet_last_collect_timestamp_seconds: Gauge,
    pub fleet_scrape_count_total: Counter,
    pub fleet_refresh_requests_total: Counter,
    pub fleet_collect_errors_total: CounterVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let fleet_hosts_total =
            Gauge::with_opts(opts!("fleet_hosts_total", "Hosts in the last snapshot"))?;
        let fleet_hosts_by_status = GaugeVec::new(
            opts!("fleet_hosts_by_status", "Hosts in the last snapshot by status"),
            &["status"],
        )?;
        let fleet_host_up = GaugeVec::new(
            opts!("fleet_host_up", "Host reachable over SSH 0/1"),
            &["host"],
        )?;
        let fleet_host_probe_errors = GaugeVec::new(
            opts!("fleet_host_probe_errors", "Probes that ended in a command error"),
            &["host"],
        )?;
        let fleet_host_collect_duration_ms = GaugeVec::new(
            opts!(
                "fleet_host_collect_duration_ms",
                "Wall time spent collecting one host in ms"
            ),
            &["host"],
        )?;
        let fleet_host_connect_latency_ms = GaugeVec::new(
            opts!(
                "fleet_host_connect_latency_ms",
                "Time to establish the SSH session in ms"
            ),
            &["host"],
        )?;
        let fleet_host_consecutive_offline = GaugeVec::new(
            opts!(
                "fleet_host_consecutive_offline",
                "Consecutive cycles the host has been offline"
            ),
            &["host"],
        )?;
        let fleet_host_last_change_timestamp_seconds = GaugeVec::new(
            opts!(
                "fleet_host_last_change_timestamp_seconds",
                "Unix timestamp of the host's last status change"
            ),
            &["host"],
        )?;
        let fleet_probe_outcome = GaugeVec::new(
            opts!(
                "fleet_probe_outcome",
                "Probe outcome of the last cycle, 1 for the recorded outcome"
            ),
            &["host", "probe", "outcome"],
        )?;
        let fleet_cycle_duration_ms = Gauge::with_opts(opts!(
            "fleet_cycle_duration_ms",
            "Wall time of the last collection cycle in ms"
        ))?;
        let fleet_cycles = Gauge::with_opts(opts!(
            "fleet_cycles",
            "Collection cycles completed since start"
        ))?;
        let fleet_uptime_seconds =
            Gauge::with_opts(opts!("fleet_uptime_seconds", "Collector uptime in seconds"))?;
        let fleet_last_collect_timestamp_seconds = Gauge::with_opts(opts!(
            "fleet_last_collect_timestamp_seconds",
            "Unix timestamp of the last fleet snapshot"
        ))?;
        let fleet_scrape_count_total = Counter::with_opts(opts!(
            "fleet_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let fleet_refresh_requests_total = Counter::with_opts(opts!(
            "fleet_refresh_requests_total",
            "Refreshes requested over HTTP"
        ))?;
        let fleet_collect_errors_total = CounterVec::new(
            opts!(
                "fleet_collect_errors_total",
                "Collection cycles that failed to produce a snapshot"
            ),
            &["kind"],
        )?;

        register(&registry, &fleet_hosts_total)?;
        register(&registry, &fleet_hosts_by_status)?;
        register(&registry, &fleet_host_up)?;
        register(&registry, &fleet_host_probe_errors)?;
        register(&registry, &fleet_host_collect_duration_ms)?;
        register(&registry, &fleet_host_connect_latency_ms)?;
        register(&registry, &fleet_host_consecutive_offline)?;
        register(&registry, &fleet_host_last_change_timestamp_seconds)?;
        register(&registry, &fleet_probe_outcome)?;
        register(&registry, &fleet_cycle_duration_ms)?;
        register(&registry, &fleet_cycles)?;
        register(&registry, &fleet_uptime_seconds)?;
        register(&registry, &fleet_last_collect_timestamp_seconds)?;
        register(&registry, &fleet_scrape_count_total)?;
        register(&registry, &fleet_refresh_requests_total)?;
        register(&registry, &fleet_collect_errors_total)?;

        Ok(Arc::new(Self {
            registry,
            fleet_hosts_total,
            fleet_hosts_by_status,
            fleet_host_up,
            fleet_host_probe_errors,
            fleet_host_collect_duration_ms,
            fleet_host_connect_latency_ms,
            fleet_host_consecutive_offline,
            fleet_host_last_change_timestamp_seconds,
            fleet_probe_outcome,
            fleet_cycle_duration_ms,
            fleet_cycles,
            fleet_uptime_seconds,
            fleet_last_collect_timestamp_seconds,
            fleet_scrape_count_total,
            fleet_refresh_requests_total,
            fleet_collect_errors_total,
        }))
    }

    pub fn update_from_state(&self, state: &State) {
        let now = now_unix();
        self.fleet_uptime_seconds
            .set(now.saturating_sub(state.started_at_unix) as f64);
        self.fleet_cycles.set(state.cycles as f64);
        self.fleet_cycle_duration_ms
            .set(state.last_cycle_elapsed_ms as f64);

        let Some(snapshot) = &state.last_snapshot else {
            return;
        };

        self.fleet_last_collect_timestamp_seconds
            .set((snapshot.collected_at_ms / 1000) as f64);
        self.fleet_hosts_total.set(snapshot.hosts.len() as f64);
        for status in [
            HostStatus::Online,
            HostStatus::CompletedWithErrors,
            HostStatus::Offline,
        ] {
            self.fleet_hosts_by_status
                .with_label_values(&[status.as_str()])
                .set(snapshot.count_by_status(status) as f64);
        }

        self.fleet_host_up.reset();
        self.fleet_host_probe_errors.reset();
        self.fleet_host_collect_duration_ms.reset();
        self.fleet_host_connect_latency_ms.reset();
        self.fleet_host_consecutive_offline.reset();
        self.fleet_host_last_change_timestamp_seconds.reset();
        self.fleet_probe_outcome.reset();

        for h in &snapshot.hosts {
            let name = h.name();
            let up = h.status != HostStatus::Offline;
            self.fleet_host_up
                .with_label_values(&[name])
                .set(if up { 1.0 } else { 0.0 });
            self.fleet_host_probe_errors
                .with_label_values(&[name])
                .set(h.error_count() as f64);
            self.fleet_host_collect_duration_ms
                .with_label_values(&[name])
                .set(h.elapsed_ms as f64);
            if let Some(latency) = h.connect_latency_ms {
                self.fleet_host_connect_latency_ms
                    .with_label_values(&[name])
                    .set(latency as f64);
            }
            self.fleet_host_consecutive_offline
                .with_label_values(&[name])
                .set(state.consecutive_offline(name) as f64);
            if let Some(track) = state.host_tracking.get(name) {
                self.fleet_host_last_change_timestamp_seconds
                    .with_label_values(&[name])
                    .set((track.last_change_ms / 1000) as f64);
            }
            for p in &h.probes {
                self.fleet_probe_outcome
                    .with_label_values(&[name, p.probe.as_str(), p.outcome.as_str()])
                    .set(1.0);
            }
        }
    }

    pub fn inc_scrape_count(&self) {
        self.fleet_scrape_count_total.inc();
    }

    pub fn inc_refresh_request(&self) {
        self.fleet_refresh_requests_total.inc();
    }

    pub fn inc_collect_error(&self, kind: &str) {
        self.fleet_collect_errors_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
