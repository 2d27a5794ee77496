//! Split-brain decision after a batch of host failures

use std::collections::BTreeSet;

use hostmesh_core::types::HostId;
use tracing::warn;

/// Decide whether the local fragment must shut down.
///
/// `previous` holds the hosts live immediately before a batch of failures,
/// `current` those still live afterwards, the local host included.
///
/// * A strict minority shuts down.
/// * An exact half continues only if it holds the lowest host id of
///   `previous`.
/// * A majority always continues.
///
/// With partition detection disabled the function never returns `true`, but
/// still warns when it would have.
pub fn decide(
    previous: &BTreeSet<HostId>,
    current: &BTreeSet<HostId>,
    partition_detection: bool,
) -> bool {
    let prev = previous.len();
    let cur = current.len();

    if cur * 2 < prev {
        if partition_detection {
            return true;
        }
        warn!(
            "Partition detection is disabled but only {} of {} hosts survive; \
             this fragment keeps running and the cluster may be split",
            cur, prev
        );
        return false;
    }

    if cur * 2 == prev {
        let Some(lowest) = previous.iter().next() else {
            return false;
        };
        if current.contains(lowest) {
            return false;
        }
        if partition_detection {
            return true;
        }
        warn!(
            "Partition detection is disabled; this half of the cluster lacks host {} \
             and would have shut down",
            lowest
        );
        return false;
    }

    false
}
