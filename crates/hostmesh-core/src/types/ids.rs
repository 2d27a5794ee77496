//! Host and site identifiers
//!
//! An HSId packs a site id (high 32 bits) and a host id (low 32 bits) into
//! one 64-bit value. Negative site ids are reserved for well-known services.

/// Identifier of one host in the mesh
pub type HostId = i32;

/// Identifier of one endpoint on a host
pub type SiteId = i32;

/// Combined host and site identifier of a mailbox
pub type HsId = i64;

/// Membership agreement endpoint
pub const AGREEMENT_SITE_ID: SiteId = -1;
/// Statistics endpoint
pub const STATS_SITE_ID: SiteId = -2;
/// Asynchronous compiler endpoint
pub const ASYNC_COMPILER_SITE_ID: SiteId = -3;
/// Snapshot coordination endpoint
pub const SNAPSHOT_SITE_ID: SiteId = -4;
/// Heartbeat endpoint
pub const HEARTBEAT_SITE_ID: SiteId = -5;

/// Host id that has not been assigned yet
pub const UNASSIGNED_HOST_ID: HostId = -1;

/// Build an HSId from its host and site parts
#[inline]
pub const fn hsid(host_id: HostId, site_id: SiteId) -> HsId {
    ((site_id as i64) << 32) | (host_id as u32 as i64)
}

/// Host part of an HSId
#[inline]
pub const fn host_of(hsid: HsId) -> HostId {
    hsid as i32
}

/// Site part of an HSId
#[inline]
pub const fn site_of(hsid: HsId) -> SiteId {
    (hsid >> 32) as i32
}

/// Whether the HSId names a reserved well-known endpoint
#[inline]
pub const fn is_reserved(hsid: HsId) -> bool {
    site_of(hsid) < 0
}

/// Render an HSId as `host:site`
pub fn hsid_to_string(hsid: HsId) -> String {
    format!("{}:{}", host_of(hsid), site_of(hsid))
}

/// Render a collection of HSIds as `[h:s, h:s]`
pub fn hsids_to_string<'a, I>(hsids: I) -> String
where
    I: IntoIterator<Item = &'a HsId>,
{
    let parts: Vec<String> = hsids.into_iter().map(|h| hsid_to_string(*h)).collect();
    format!("[{}]", parts.join(", "))
}
