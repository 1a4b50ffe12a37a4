//! Pluggable rate allocation.
//!
//! The coordinator owns the mechanism (snapshot, tick, dispatch); a policy
//! is only the function from a catalog snapshot to per-flow rates in bits
//! per second. Flows absent from the result, or rated non-positively, are
//! simply not announced.

use std::collections::HashMap;

use crate::coordinator::catalog::CatalogSnapshot;
use crate::model::DataIdentifier;

pub trait RatePolicy: Send {
    fn allocate(&mut self, snapshot: &CatalogSnapshot) -> HashMap<DataIdentifier, f64>;
}

/// The default: every in-flight flow is uncapped. Clients treat a
/// non-finite rate as "no throttling".
#[derive(Debug, Default)]
pub struct IdentityPolicy;

impl RatePolicy for IdentityPolicy {
    fn allocate(&mut self, snapshot: &CatalogSnapshot) -> HashMap<DataIdentifier, f64> {
        snapshot
            .flows
            .iter()
            .filter(|f| !f.active.is_empty())
            .map(|f| (f.desc.data_id.clone(), f64::INFINITY))
            .collect()
    }
}

/// Caps every in-flight flow at a single fixed rate. Mostly useful in tests
/// and as the simplest non-trivial example of the seam.
#[derive(Debug)]
pub struct FixedRatePolicy {
    pub rate_bps: f64,
}

impl RatePolicy for FixedRatePolicy {
    fn allocate(&mut self, snapshot: &CatalogSnapshot) -> HashMap<DataIdentifier, f64> {
        snapshot
            .flows
            .iter()
            .filter(|f| !f.active.is_empty())
            .map(|f| (f.desc.data_id.clone(), self.rate_bps))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::catalog::{AgentSnapshot, FlowSnapshot};
    use crate::model::{CoflowState, FlowDescription};

    fn snapshot_with(active: Vec<String>) -> CatalogSnapshot {
        CatalogSnapshot {
            agents: vec![AgentSnapshot {
                slave_id: "s1".into(),
                host: "h1".into(),
                rx_bps: 0.0,
                tx_bps: 0.0,
            }],
            flows: vec![FlowSnapshot {
                desc: FlowDescription::fake(DataIdentifier::new("cf1", "f1"), 64, 1, "h1", 1608),
                owner_client_id: "CLIENT-000001".into(),
                coflow_state: CoflowState::Running,
                coflow_priority: 0,
                receivers: active.clone(),
                active,
            }],
        }
    }

    #[test]
    fn test_identity_rates_only_inflight_flows() {
        let mut policy = IdentityPolicy;
        assert!(policy.allocate(&snapshot_with(vec![])).is_empty());

        let rates = policy.allocate(&snapshot_with(vec!["CLIENT-000002".into()]));
        assert_eq!(rates.len(), 1);
        assert!(rates[&DataIdentifier::new("cf1", "f1")].is_infinite());

        // A flow whose receivers all finished gets no allocation.
        let mut done = snapshot_with(vec![]);
        done.flows[0].receivers = vec!["CLIENT-000002".into()];
        assert!(policy.allocate(&done).is_empty());
    }

    #[test]
    fn test_fixed_rate_policy() {
        let mut policy = FixedRatePolicy { rate_bps: 800.0 };
        let rates = policy.allocate(&snapshot_with(vec!["CLIENT-000002".into()]));
        assert_eq!(rates[&DataIdentifier::new("cf1", "f1")], 800.0);
    }
}
