use crate::registry::HostRegistry;
use crate::snapshot::{FleetSnapshot, HostSnapshot};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("host '{0}' appears more than once")]
    DuplicateHost(String),
    #[error("host '{0}' has no snapshot")]
    MissingHost(String),
    #[error("snapshot for unregistered host '{0}'")]
    UnknownHost(String),
}

/// Merges per-host results into a fleet snapshot. The fleet timestamp is the
/// newest host timestamp, or `started_at_ms` when there are no hosts.
pub fn aggregate(hosts: &[HostSnapshot], started_at_ms: i64) -> Result<FleetSnapshot, AggregateError> {
    let mut seen = HashSet::with_capacity(hosts.len());
    for host in hosts {
        if !seen.insert(host.name()) {
            return Err(AggregateError::DuplicateHost(host.name().to_string()));
        }
    }
    let collected_at_ms = hosts
        .iter()
        .map(|h| h.collected_at_ms)
        .max()
        .unwrap_or(started_at_ms);
    Ok(FleetSnapshot {
        collected_at_ms,
        hosts: hosts.to_vec(),
    })
}

/// Like [`aggregate`], additionally requiring exactly one snapshot for every
/// registered host.
pub fn aggregate_for(
    registry: &HostRegistry,
    hosts: &[HostSnapshot],
    started_at_ms: i64,
) -> Result<FleetSnapshot, AggregateError> {
    let fleet = aggregate(hosts, started_at_ms)?;
    let registered: HashSet<&str> = registry.iter().map(|h| h.name.as_str()).collect();
    if let Some(unknown) = fleet
        .hosts
        .iter()
        .find(|h| !registered.contains(h.name()))
    {
        return Err(AggregateError::UnknownHost(unknown.name().to_string()));
    }
    if let Some(missing) = registry.iter().find(|h| fleet.host(&h.name).is_none()) {
        return Err(AggregateError::MissingHost(missing.name.clone()));
    }
    Ok(fleet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::suite::DiagnosticSuite;
    use crate::registry::{CredentialRef, HostDescriptor};
    use crate::snapshot::{HostRef, NotRunCause};

    fn snap(name: &str, at: i64) -> HostSnapshot {
        HostSnapshot::offline(
            HostRef {
                name: name.to_string(),
                address: "10.0.0.1".to_string(),
                port: 22,
                username: "ops".to_string(),
            },
            &DiagnosticSuite::standard().unwrap(),
            NotRunCause::ConnectionError,
            "refused",
            0,
            at,
        )
    }

    fn registry(names: &[&str]) -> HostRegistry {
        HostRegistry::new(
            names
                .iter()
                .map(|n| HostDescriptor::new(*n, "10.0.0.1", 22, "ops", CredentialRef::Agent))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn timestamp_is_newest_host() {
        let fleet = aggregate(&[snap("a", 30), snap("b", 70), snap("c", 50)], 10).unwrap();
        assert_eq!(fleet.collected_at_ms, 70);
        let names: Vec<_> = fleet.hosts.iter().map(|h| h.name()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn empty_input_uses_start_time() {
        let fleet = aggregate(&[], 1234).unwrap();
        assert!(fleet.hosts.is_empty());
        assert_eq!(fleet.collected_at_ms, 1234);
    }

    #[test]
    fn aggregation_is_repeatable_and_leaves_input_untouched() {
        let hosts = vec![snap("a", 30), snap("b", 70)];
        let before = hosts.clone();
        let first = aggregate(&hosts, 0).unwrap();
        let second = aggregate(&hosts, 0).unwrap();
        assert_eq!(first, second);
        assert_eq!(hosts, before);
    }

    #[test]
    fn duplicates_are_rejected() {
        assert_eq!(
            aggregate(&[snap("a", 1), snap("a", 2)], 0),
            Err(AggregateError::DuplicateHost("a".to_string()))
        );
    }

    #[test]
    fn registry_coverage_is_checked() {
        let reg = registry(&["a", "b"]);
        assert_eq!(
            aggregate_for(&reg, &[snap("a", 1)], 0),
            Err(AggregateError::MissingHost("b".to_string()))
        );
        assert_eq!(
            aggregate_for(&reg, &[snap("a", 1), snap("b", 1), snap("x", 1)], 0),
            Err(AggregateError::UnknownHost("x".to_string()))
        );
        assert!(aggregate_for(&reg, &[snap("a", 1), snap("b", 1)], 0).is_ok());
    }
}
