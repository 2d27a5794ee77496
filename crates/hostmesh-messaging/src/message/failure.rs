//! Failure propagation messages

use std::collections::{BTreeMap, BTreeSet};

use bytes::{BufMut, Bytes, BytesMut};
use hostmesh_core::types::{hsids_to_string, HsId};

use super::{buf, WireBody, FAILURE_SITE_FORWARD_ID, FAILURE_SITE_UPDATE_ID};
use crate::WireResult;

/// Failure report from a host that observed the failure itself.
///
/// Wire layout:
/// `[survivors][safeTxnCount:4][(failedHsId:8, safeTxnId:8)*][hasDecision:1][decided]`
/// where each HSId set is `[count:4][hsid:8*]` and `decided` is present only
/// when `hasDecision` is 1.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureSiteUpdate {
    /// Sites the reporter still had a working connection to
    pub survivors: BTreeSet<HsId>,
    /// Failed site to the last transaction id known safe for it
    pub safe_txn_ids: BTreeMap<HsId, i64>,
    /// Finalized failure set, once the arbiter has decided
    pub decided: Option<BTreeSet<HsId>>,
}

impl FailureSiteUpdate {
    pub fn new(survivors: BTreeSet<HsId>, safe_txn_ids: BTreeMap<HsId, i64>) -> Self {
        Self {
            survivors,
            safe_txn_ids,
            decided: None,
        }
    }

    pub fn with_decision(mut self, decided: BTreeSet<HsId>) -> Self {
        self.decided = Some(decided);
        self
    }

    pub fn failed_sites(&self) -> impl Iterator<Item = HsId> + '_ {
        self.safe_txn_ids.keys().copied()
    }

    pub fn is_decided(&self) -> bool {
        self.decided.is_some()
    }
}

impl std::fmt::Display for FailureSiteUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let failed: Vec<HsId> = self.failed_sites().collect();
        write!(
            f,
            "FailureSiteUpdate(failed: {}, survivors: {}",
            hsids_to_string(&failed),
            hsids_to_string(&self.survivors)
        )?;
        if let Some(decided) = &self.decided {
            write!(f, ", decided: {}", hsids_to_string(decided))?;
        }
        write!(f, ")")
    }
}

impl WireBody for FailureSiteUpdate {
    const TYPE_TAG: u8 = FAILURE_SITE_UPDATE_ID;

    fn body_len(&self) -> usize {
        buf::hsid_set_len(&self.survivors)
            + 4
            + self.safe_txn_ids.len() * 16
            + 1
            + self.decided.as_ref().map_or(0, buf::hsid_set_len)
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf::put_hsid_set(buf, &self.survivors);
        buf.put_i32(self.safe_txn_ids.len() as i32);
        for (hsid, txn_id) in &self.safe_txn_ids {
            buf.put_i64(*hsid);
            buf.put_i64(*txn_id);
        }
        match &self.decided {
            Some(decided) => {
                buf::put_bool(buf, true);
                buf::put_hsid_set(buf, decided);
            }
            None => buf::put_bool(buf, false),
        }
    }

    fn decode_body(buf: &mut Bytes) -> WireResult<Self> {
        let survivors = buf::get_hsid_set(buf)?;

        let count = buf::get_count(buf, 16)?;
        let mut safe_txn_ids = BTreeMap::new();
        for _ in 0..count {
            let hsid = buf::get_i64(buf)?;
            let txn_id = buf::get_i64(buf)?;
            safe_txn_ids.insert(hsid, txn_id);
        }

        let decided = if buf::get_bool(buf)? {
            Some(buf::get_hsid_set(buf)?)
        } else {
            None
        };

        Ok(Self {
            survivors,
            safe_txn_ids,
            decided,
        })
    }
}

/// A [`FailureSiteUpdate`] relayed by a host other than its reporter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureSiteForward {
    pub reporting_hsid: HsId,
    pub update: FailureSiteUpdate,
}

impl FailureSiteForward {
    pub fn new(reporting_hsid: HsId, update: FailureSiteUpdate) -> Self {
        Self {
            reporting_hsid,
            update,
        }
    }
}

impl WireBody for FailureSiteForward {
    const TYPE_TAG: u8 = FAILURE_SITE_FORWARD_ID;

    fn body_len(&self) -> usize {
        8 + self.update.body_len()
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        buf.put_i64(self.reporting_hsid);
        self.update.encode_body(buf);
    }

    fn decode_body(buf: &mut Bytes) -> WireResult<Self> {
        let reporting_hsid = buf::get_i64(buf)?;
        let update = FailureSiteUpdate::decode_body(buf)?;
        Ok(Self {
            reporting_hsid,
            update,
        })
    }
}

/// Local notification that a site failed, handed to the fault sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultMessage {
    pub failed_site: HsId,
    pub reporting_site: HsId,
    /// The reporting host observed the failure itself
    pub witnessed: bool,
    /// Survivors named by the reporter; empty when witnessed
    pub survivors: BTreeSet<HsId>,
    /// The report already carries a final decision
    pub decided: bool,
}

impl FaultMessage {
    pub fn witnessed(failed_site: HsId, reporting_site: HsId) -> Self {
        Self {
            failed_site,
            reporting_site,
            witnessed: true,
            survivors: BTreeSet::new(),
            decided: false,
        }
    }

    pub fn relayed(
        failed_site: HsId,
        reporting_site: HsId,
        survivors: BTreeSet<HsId>,
        decided: bool,
    ) -> Self {
        Self {
            failed_site,
            reporting_site,
            witnessed: false,
            survivors,
            decided,
        }
    }
}
