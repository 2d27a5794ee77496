//! Fault reporting and propagation
//!
//! Witnessed failures (a connection to a peer died here) are reported by
//! site id. Failure updates received from other hosts yield derived,
//! non-witnessed notifications so that every live host takes part in
//! resolving a failure even without a direct connection to the dead peer.

use std::collections::HashSet;

use hostmesh_core::types::{hsid_to_string, host_of, HsId};
use hostmesh_messaging::{FailureSiteUpdate, FaultMessage};
use parking_lot::Mutex;
use tracing::{debug, info};

/// Consumer of fault reports, typically the agreement site
pub trait FaultSink: Send + Sync {
    /// A site failure observed directly by this host
    fn report_fault_site(&self, failed_site: HsId);

    /// A failure notification, witnessed or derived
    fn report_fault(&self, fault: FaultMessage);
}

/// Sink used when no agreement site is attached
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingFaultSink;

impl FaultSink for LoggingFaultSink {
    fn report_fault_site(&self, failed_site: HsId) {
        info!("Fault reported for site {}", hsid_to_string(failed_site));
    }

    fn report_fault(&self, fault: FaultMessage) {
        info!(
            failed = %hsid_to_string(fault.failed_site),
            reporter = %hsid_to_string(fault.reporting_site),
            witnessed = fault.witnessed,
            decided = fault.decided,
            "Fault notification"
        );
    }
}

/// Sink that keeps every report, for tests and diagnostics
#[derive(Debug, Default)]
pub struct RecordingFaultSink {
    sites: Mutex<Vec<HsId>>,
    faults: Mutex<Vec<FaultMessage>>,
}

impl RecordingFaultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reported_sites(&self) -> Vec<HsId> {
        self.sites.lock().clone()
    }

    pub fn faults(&self) -> Vec<FaultMessage> {
        self.faults.lock().clone()
    }
}

impl FaultSink for RecordingFaultSink {
    fn report_fault_site(&self, failed_site: HsId) {
        self.sites.lock().push(failed_site);
    }

    fn report_fault(&self, fault: FaultMessage) {
        self.faults.lock().push(fault);
    }
}

/// Derives non-witnessed fault notifications from incoming failure updates,
/// once per (failed site, reporter) pair
#[derive(Debug, Default)]
pub struct FaultPropagator {
    seen: Mutex<HashSet<(HsId, HsId)>>,
}

impl FaultPropagator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications this host must raise for `update` sent by `reporter`.
    ///
    /// `local_site` is the local agreement site. Nothing is derived when the
    /// reporter does not list it as a survivor, or for failures of the local
    /// host itself.
    pub fn derive(
        &self,
        local_site: HsId,
        reporter: HsId,
        update: &FailureSiteUpdate,
    ) -> Vec<FaultMessage> {
        if !update.survivors.contains(&local_site) {
            debug!(
                "Failure update from {} does not list {} as a survivor",
                hsid_to_string(reporter),
                hsid_to_string(local_site)
            );
            return Vec::new();
        }

        let mut seen = self.seen.lock();
        update
            .failed_sites()
            .filter(|failed| host_of(*failed) != host_of(local_site))
            .filter(|failed| seen.insert((*failed, reporter)))
            .map(|failed| {
                FaultMessage::relayed(
                    failed,
                    reporter,
                    update.survivors.clone(),
                    update.is_decided(),
                )
            })
            .collect()
    }

    /// Forget pairs involving `failed_site`, e.g. after the arbiter resolves it
    pub fn resolved(&self, failed_site: HsId) {
        self.seen.lock().retain(|(failed, _)| *failed != failed_site);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostmesh_core::types::{hsid, AGREEMENT_SITE_ID};
    use std::collections::{BTreeMap, BTreeSet};

    fn agreement(host: i32) -> HsId {
        hsid(host, AGREEMENT_SITE_ID)
    }

    fn update(survivors: &[i32], failed: &[i32]) -> FailureSiteUpdate {
        FailureSiteUpdate::new(
            survivors.iter().map(|h| agreement(*h)).collect::<BTreeSet<_>>(),
            failed
                .iter()
                .map(|h| (agreement(*h), 100))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[test]
    fn test_survivor_derives_notification() {
        let propagator = FaultPropagator::new();
        let faults = propagator.derive(agreement(1), agreement(0), &update(&[0, 1], &[2]));

        assert_eq!(faults.len(), 1);
        let fault = &faults[0];
        assert_eq!(fault.failed_site, agreement(2));
        assert_eq!(fault.reporting_site, agreement(0));
        assert!(!fault.witnessed);
        assert!(!fault.decided);
        assert!(fault.survivors.contains(&agreement(1)));
    }

    #[test]
    fn test_deduplicated_per_reporter() {
        let propagator = FaultPropagator::new();
        let msg = update(&[0, 1, 3], &[2]);
        assert_eq!(propagator.derive(agreement(1), agreement(0), &msg).len(), 1);
        assert!(propagator.derive(agreement(1), agreement(0), &msg).is_empty());
        // A different reporter is a new pair
        assert_eq!(propagator.derive(agreement(1), agreement(3), &msg).len(), 1);

        propagator.resolved(agreement(2));
        assert_eq!(propagator.derive(agreement(1), agreement(0), &msg).len(), 1);
    }

    #[test]
    fn test_non_survivor_derives_nothing() {
        let propagator = FaultPropagator::new();
        assert!(propagator
            .derive(agreement(1), agreement(0), &update(&[0], &[2]))
            .is_empty());
    }

    #[test]
    fn test_own_failure_ignored() {
        let propagator = FaultPropagator::new();
        let faults = propagator.derive(agreement(1), agreement(0), &update(&[0, 1], &[1, 2]));
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].failed_site, agreement(2));
    }

    #[test]
    fn test_decision_is_carried() {
        let propagator = FaultPropagator::new();
        let decided = update(&[0, 1], &[2]).with_decision([agreement(2)].into_iter().collect());
        let faults = propagator.derive(agreement(1), agreement(0), &decided);
        assert!(faults[0].decided);
    }
}
