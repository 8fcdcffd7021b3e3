use crate::snapshot::{FleetSnapshot, HostStatus};
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct State {
    pub started_at_unix: i64,
    pub last_snapshot: Option<FleetSnapshot>,
    pub last_cycle_elapsed_ms: u64,
    pub cycles: u64,
    pub host_tracking: HashMap<String, HostTrackState>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostTrackState {
    pub last_status: Option<HostStatus>,
    pub consecutive_offline: u32,
    pub last_change_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub host: String,
    pub from: Option<HostStatus>,
    pub to: HostStatus,
}

impl State {
    pub fn new(now_unix: i64) -> Self {
        Self {
            started_at_unix: now_unix,
            ..Self::default()
        }
    }

    /// Stores a finished cycle and reports hosts whose status differs from the
    /// previous cycle. The first sighting of a host counts as a change.
    pub fn update_collected(&mut self, snapshot: FleetSnapshot, elapsed_ms: u64) -> Vec<StatusChange> {
        let mut changes = Vec::new();

        self.host_tracking
            .retain(|name, _| snapshot.host(name).is_some());

        for host in &snapshot.hosts {
            let track = self
                .host_tracking
                .entry(host.name().to_string())
                .or_default();
            if host.status == HostStatus::Offline {
                track.consecutive_offline = track.consecutive_offline.saturating_add(1);
            } else {
                track.consecutive_offline = 0;
            }
            if track.last_status != Some(host.status) {
                changes.push(StatusChange {
                    host: host.name().to_string(),
                    from: track.last_status,
                    to: host.status,
                });
                track.last_status = Some(host.status);
                track.last_change_ms = host.collected_at_ms;
            }
        }

        self.last_snapshot = Some(snapshot);
        self.last_cycle_elapsed_ms = elapsed_ms;
        self.cycles = self.cycles.saturating_add(1);
        changes
    }

    pub fn consecutive_offline(&self, host: &str) -> u32 {
        self.host_tracking
            .get(host)
            .map(|t| t.consecutive_offline)
            .unwrap_or(0)
    }
}
