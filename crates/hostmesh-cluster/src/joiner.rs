//! Joining side of the mesh handshake
//!
//! A starting host probes the configured coordinators. If none answers it
//! races to bind the well-known leader address; the winner becomes the
//! leader with host id 0. Everyone else asks the leader for a host id,
//! receives the current topology and connects to every existing host.

use std::time::Duration;

use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hostmesh_core::config::{normalize_coordinator, MeshConfig};
use hostmesh_core::types::{ActiveVersions, HostId, HostInfo, MeshTopology, VersionInfo};
use hostmesh_core::utils::{now_millis, SkewSummary};
use hostmesh_core::MAX_ACTIVE_VERSIONS;

use crate::coordinator::InstanceId;
use crate::error::{ClusterError, ClusterResult};
use crate::handshake::{
    clock_skew, read_json, write_json, ConnectionRequest, HostIdAccepted, HostIdRequest,
    HostIdResponse, JoinRejection, JoinRequest, PeerAck, PublishHostId, JOIN_COMPLETE,
};

/// Outcome of the join protocol
pub(crate) enum JoinRole {
    /// This host bound the leader address
    Leader {
        listener: TcpListener,
        address: String,
    },
    Follower {
        listener: TcpListener,
        outcome: JoinOutcome,
    },
}

pub(crate) struct JoinOutcome {
    pub host_id: HostId,
    pub local: HostInfo,
    pub instance_id: Option<InstanceId>,
    /// Every other host with its sub-connection streams, leader first
    pub hosts: Vec<EstablishedHost>,
    pub versions: ActiveVersions,
}

pub(crate) struct EstablishedHost {
    pub info: HostInfo,
    pub streams: Vec<TcpStream>,
}

/// Exponential retry interval for retryable join rejections
#[derive(Debug)]
struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    /// Doubles on every call; after reaching the cap the next interval starts
    /// from the base again
    fn next_interval(&mut self) -> Duration {
        let interval = self.current.min(self.cap);
        if self.current >= self.cap {
            self.current = self.base;
        } else {
            self.current = (self.current * 2).min(self.cap);
        }
        interval
    }

    fn next_jittered(&mut self) -> Duration {
        let interval = self.next_interval();
        interval.mul_f64(rand::rng().random_range(0.75..1.25))
    }
}

pub(crate) struct SocketJoiner {
    config: MeshConfig,
    version: VersionInfo,
    display_name: String,
    cancel: CancellationToken,
}

impl SocketJoiner {
    pub(crate) fn new(config: &MeshConfig, version: VersionInfo, cancel: CancellationToken) -> Self {
        Self {
            display_name: config.display_name(),
            config: config.clone(),
            version,
            cancel,
        }
    }

    pub(crate) async fn start(&self) -> ClusterResult<JoinRole> {
        let deadline = Instant::now() + self.config.mesh.join_timeout();
        let leader_address = self.config.mesh.leader_coordinator().ok_or_else(|| {
            ClusterError::InvalidConfig("At least one coordinator must be configured".into())
        })?;

        let mut backoff = Backoff::new(
            Duration::from_millis(self.config.mesh.retry_base_ms),
            Duration::from_millis(self.config.mesh.retry_cap_ms),
        );
        let mut own_listener: Option<TcpListener> = None;

        loop {
            let stream = match self.probe_coordinators().await? {
                Some(stream) => stream,
                None => match TcpListener::bind(&leader_address).await {
                    Ok(listener) => {
                        info!(
                            "Bound leader address {}, this host will lead the mesh",
                            leader_address
                        );
                        let address = leader_address
                            .rsplit_once(':')
                            .map(|(host, _)| host.trim_matches(['[', ']']).to_string())
                            .unwrap_or_default();
                        return Ok(JoinRole::Leader { listener, address });
                    }
                    Err(e) => {
                        debug!(
                            "Could not bind leader address {} ({}), another host leads",
                            leader_address, e
                        );
                        self.connect_with_retry(&leader_address, deadline).await?
                    }
                },
            };

            let listener = match own_listener.take() {
                Some(listener) => listener,
                None => self.bind_internal().await?,
            };
            let port = listener.local_addr()?.port();

            match self.request_host_id(stream, port).await? {
                Ok((accepted, leader_stream, skew)) => {
                    let outcome = self.connect_mesh(accepted, leader_stream, skew, port).await?;
                    return Ok(JoinRole::Follower { listener, outcome });
                }
                Err(rejection) if rejection.may_retry => {
                    own_listener = Some(listener);
                    let delay = backoff.next_jittered();
                    warn!(
                        "Join request rejected: {}. Retrying in {:.1} seconds",
                        rejection.reason,
                        delay.as_secs_f64()
                    );
                    if Instant::now() + delay > deadline {
                        return Err(ClusterError::JoinTimeout(rejection.reason));
                    }
                    self.sleep(delay).await?;
                }
                Err(rejection) => {
                    return Err(ClusterError::JoinRejected {
                        reason: rejection.reason,
                        may_retry: false,
                    });
                }
            }
        }
    }

    async fn sleep(&self, delay: Duration) -> ClusterResult<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ClusterError::ShuttingDown),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Connect to the first reachable coordinator in sorted order
    async fn probe_coordinators(&self) -> ClusterResult<Option<TcpStream>> {
        let mut candidates: Vec<String> = self
            .config
            .mesh
            .coordinators
            .iter()
            .map(|c| normalize_coordinator(c))
            .collect();
        candidates.sort();
        candidates.dedup();

        let interval = Duration::from_millis(self.config.mesh.probe_interval_ms);
        for candidate in candidates {
            let mut attempts = 0;
            let addrs = loop {
                match lookup_host(candidate.as_str()).await {
                    Ok(addrs) => break Some(addrs.collect::<Vec<_>>()),
                    Err(e) => {
                        attempts += 1;
                        if attempts > self.config.mesh.name_resolution_retries {
                            warn!(
                                "Could not resolve coordinator {} after {} attempts: {}",
                                candidate, attempts, e
                            );
                            break None;
                        }
                        debug!("Could not resolve coordinator {}: {}", candidate, e);
                        self.sleep(interval).await?;
                    }
                }
            };
            let Some(addrs) = addrs else { continue };

            match TcpStream::connect(addrs.as_slice()).await {
                Ok(stream) => {
                    info!("Connected to coordinator {}", candidate);
                    return Ok(Some(stream));
                }
                Err(e) => debug!("Coordinator {} not reachable: {}", candidate, e),
            }
        }
        Ok(None)
    }

    async fn connect_with_retry(&self, target: &str, deadline: Instant) -> ClusterResult<TcpStream> {
        let interval = Duration::from_millis(self.config.mesh.probe_interval_ms);
        loop {
            match TcpStream::connect(target).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(ClusterError::CoordinatorUnreachable(format!(
                            "{}: {}",
                            target, e
                        )));
                    }
                    debug!("Waiting for leader at {}: {}", target, e);
                    self.sleep(interval).await?;
                }
            }
        }
    }

    async fn bind_internal(&self) -> ClusterResult<TcpListener> {
        let interface = if self.config.node.internal_interface.is_empty() {
            "0.0.0.0"
        } else {
            self.config.node.internal_interface.as_str()
        };
        let address = format!("{}:{}", interface, self.config.node.internal_port);
        let listener = TcpListener::bind(&address).await?;
        info!("Listening for mesh connections on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Returns the acceptance with the leader stream and one clock skew
    /// sample, or the rejection
    async fn request_host_id(
        &self,
        mut stream: TcpStream,
        port: u16,
    ) -> ClusterResult<Result<(HostIdAccepted, TcpStream, i64), JoinRejection>> {
        let mut request = HostIdRequest {
            host_display_name: self.display_name.clone(),
            address: self.config.node.internal_interface.clone(),
            port,
            version: self.version.clone(),
            timestamp: now_millis(),
            signature: None,
        };
        if let Some(secret) = &self.config.mesh.cluster_secret {
            request.sign(secret.as_bytes())?;
        }

        let sent_at = request.timestamp;
        write_json(&mut stream, &JoinRequest::RequestHostId(request)).await?;
        let response: HostIdResponse = read_json(&mut stream).await?;
        let received_at = now_millis();

        match response {
            HostIdResponse::Accepted(accepted) => {
                let skew = clock_skew(sent_at, accepted.timestamp, received_at);
                Ok(Ok((accepted, stream, skew)))
            }
            HostIdResponse::Rejected(rejection) => Ok(Err(rejection)),
        }
    }

    async fn connect_mesh(
        &self,
        accepted: HostIdAccepted,
        leader_stream: TcpStream,
        leader_skew: i64,
        port: u16,
    ) -> ClusterResult<JoinOutcome> {
        let host_id = accepted.new_host_id;
        let address = if self.config.node.internal_interface.is_empty() {
            accepted.reported_address.clone()
        } else {
            self.config.node.internal_interface.clone()
        };
        let local = HostInfo::new(host_id, address, port, self.display_name.clone());

        let mut versions =
            ActiveVersions::new(self.version.version_string.clone(), MAX_ACTIVE_VERSIONS);
        self.version.check_compatible(&accepted.version)?;
        versions.admit(&accepted.version.version_string)?;

        let topology = MeshTopology::new(accepted.hosts);
        let leader = topology
            .leader()
            .cloned()
            .ok_or_else(|| ClusterError::Handshake("Leader sent an empty topology".into()))?;
        info!(
            "Assigned host id {} by leader {} ({} hosts in the mesh)",
            host_id,
            leader.host_display_name,
            topology.len()
        );

        let mut skews = vec![leader_skew];
        let mut leader_streams = vec![leader_stream];
        leader_streams.extend(self.open_extra_connections(&leader, host_id).await?);
        let mut hosts = vec![EstablishedHost {
            info: leader.clone(),
            streams: leader_streams,
        }];

        for peer in topology.followers() {
            if peer.host_id == host_id {
                continue;
            }
            let mut primary = TcpStream::connect(peer.connect_target()).await?;
            let extras = self.open_extra_connections(peer, host_id).await?;

            let sent_at = now_millis();
            let publish = PublishHostId {
                host_id,
                address: local.address.clone(),
                port,
                host_display_name: local.host_display_name.clone(),
                version: self.version.clone(),
            };
            write_json(&mut primary, &JoinRequest::PublishHostId(publish)).await?;
            let ack: PeerAck = read_json(&mut primary).await?;
            let received_at = now_millis();
            match ack {
                PeerAck::Accepted(ack) => {
                    self.version.check_compatible(&ack.version)?;
                    versions.admit(&ack.version.version_string)?;
                    skews.push(clock_skew(sent_at, ack.timestamp, received_at));
                }
                PeerAck::Rejected(rejected) => {
                    return Err(ClusterError::JoinRejected {
                        reason: format!(
                            "Host {} refused connection: {}",
                            peer.host_id, rejected.reason
                        ),
                        may_retry: false,
                    });
                }
            }

            let mut streams = vec![primary];
            streams.extend(extras);
            hosts.push(EstablishedHost {
                info: peer.clone(),
                streams,
            });
        }

        self.check_clock_skew(&skews)?;

        if let Some(leader) = hosts.first_mut() {
            leader.streams[0].write_all(&[JOIN_COMPLETE]).await?;
            leader.streams[0].flush().await?;
        }

        Ok(JoinOutcome {
            host_id,
            local,
            instance_id: accepted.instance_id,
            hosts,
            versions,
        })
    }

    /// Open the additional sub-connections to `peer`
    async fn open_extra_connections(
        &self,
        peer: &HostInfo,
        host_id: HostId,
    ) -> ClusterResult<Vec<TcpStream>> {
        let mut streams = Vec::new();
        for _ in 1..self.config.node.sub_connections {
            let mut stream = TcpStream::connect(peer.connect_target()).await?;
            write_json(
                &mut stream,
                &JoinRequest::RequestConnection(ConnectionRequest { host_id }),
            )
            .await?;
            match read_json::<_, PeerAck>(&mut stream).await? {
                PeerAck::Accepted(_) => streams.push(stream),
                PeerAck::Rejected(rejected) => {
                    return Err(ClusterError::Handshake(format!(
                        "Host {} refused sub-connection: {}",
                        peer.host_id, rejected.reason
                    )));
                }
            }
        }
        Ok(streams)
    }

    fn check_clock_skew(&self, skews: &[i64]) -> ClusterResult<()> {
        let Some(summary) = SkewSummary::from_samples(skews) else {
            return Ok(());
        };
        let spread = summary.spread_ms();
        if spread > self.config.mesh.clock_skew_max_ms {
            return Err(ClusterError::ClockSkew {
                skew_ms: spread,
                max_ms: self.config.mesh.clock_skew_max_ms,
            });
        }
        if spread > self.config.mesh.clock_skew_warn_ms {
            warn!(
                "Clock skew of {} ms across the mesh (min {} ms, max {} ms), keep clocks synchronized",
                spread, summary.min_ms, summary.max_ms
            );
        } else {
            debug!("Clock skew across the mesh is {} ms", spread);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_resets() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        let intervals: Vec<u64> = (0..6).map(|_| backoff.next_interval().as_secs()).collect();
        assert_eq!(intervals, vec![1, 2, 4, 8, 1, 2]);
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let mut backoff = Backoff::new(Duration::from_secs(4), Duration::from_secs(300));
        let interval = backoff.next_jittered();
        assert!(interval >= Duration::from_secs(3));
        assert!(interval <= Duration::from_secs(5));
    }

    #[test]
    fn test_clock_skew_limits() {
        let config = MeshConfig::default();
        let joiner = SocketJoiner::new(
            &config,
            VersionInfo::new("1.0", None),
            CancellationToken::new(),
        );
        assert!(joiner.check_clock_skew(&[10, -40]).is_ok());
        assert!(joiner.check_clock_skew(&[150]).is_ok());
        assert!(matches!(
            joiner.check_clock_skew(&[120, -90]),
            Err(ClusterError::ClockSkew { skew_ms: 210, .. })
        ));
        assert!(joiner.check_clock_skew(&[]).is_ok());
    }
}
