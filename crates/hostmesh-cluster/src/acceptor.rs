//! Accepting side of the mesh handshake
//!
//! The listener spawns one task per inbound connection. The first JSON
//! message decides what the connection is: a new host asking the leader for
//! an id, an admitted host announcing itself, or a secondary sub-connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use hostmesh_core::types::{HostId, HostInfo, VersionInfo};
use hostmesh_core::utils::now_millis;

use crate::error::{ClusterError, ClusterResult};
use crate::handshake::{
    read_json, write_json, ConnectionRequest, HostIdAccepted, HostIdRequest, HostIdResponse,
    JoinRejection, JoinRequest, PeerAccepted, PeerAck, PeerRejected, PublishHostId, JOIN_COMPLETE,
};
use crate::messenger::HostMessenger;

/// Limit for reading the first handshake message of a connection
const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(30);

fn rejection(reason: impl Into<String>, may_retry: bool) -> HostIdResponse {
    HostIdResponse::Rejected(JoinRejection {
        reason: reason.into(),
        may_retry,
    })
}

fn peer_rejection(reason: impl Into<String>) -> PeerAck {
    PeerAck::Rejected(PeerRejected {
        reason: reason.into(),
    })
}

impl HostMessenger {
    pub(crate) fn spawn_listener(self: &Arc<Self>, listener: TcpListener) {
        let messenger = Arc::downgrade(self);
        let cancel = self.shutdown_token().child_token();

        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        let Some(messenger) = messenger.upgrade() else {
                            break;
                        };
                        debug!("Accepted mesh connection from {}", peer);
                        tokio::spawn(async move {
                            if let Err(e) = messenger.handle_connection(stream, peer).await {
                                warn!("Handshake with {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("Failed to accept mesh connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            info!("Mesh listener stopped");
        });
    }

    async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> ClusterResult<()> {
        let request: JoinRequest =
            match tokio::time::timeout(HANDSHAKE_READ_TIMEOUT, read_json(&mut stream)).await {
                Ok(request) => request?,
                Err(_) => {
                    return Err(ClusterError::Handshake(
                        "Timed out waiting for the first handshake message".into(),
                    ))
                }
            };

        match request {
            JoinRequest::RequestHostId(request) => {
                self.accept_host_id_request(stream, peer, request).await
            }
            JoinRequest::PublishHostId(publish) => self.accept_publish(stream, publish).await,
            JoinRequest::RequestConnection(request) => {
                self.accept_extra_connection(stream, request).await
            }
            JoinRequest::Unknown => {
                error!(
                    "Unrecognized handshake request from {}, closing the connection",
                    peer
                );
                Ok(())
            }
        }
    }

    /// Leader admission of a new host
    async fn accept_host_id_request(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        request: HostIdRequest,
    ) -> ClusterResult<()> {
        if self.local_host_id() != 0 {
            write_json(&mut stream, &rejection("This host is not the leader", true)).await?;
            return Ok(());
        }

        let _admission = self.lock_admission().await;

        if self.is_shutting_down() {
            write_json(&mut stream, &rejection("Leader is shutting down", true)).await?;
            return Ok(());
        }
        if self.is_paused() {
            info!(
                "Rejecting join of {} while admission is paused",
                request.host_display_name
            );
            write_json(&mut stream, &rejection("Mesh is paused", true)).await?;
            return Ok(());
        }
        if let Some(secret) = &self.config().mesh.cluster_secret {
            if let Err(e) = request.verify(secret.as_bytes()) {
                warn!(
                    "Rejecting join of {} from {}: {}",
                    request.host_display_name, peer, e
                );
                write_json(&mut stream, &rejection("Join request signature invalid", false))
                    .await?;
                return Ok(());
            }
        }
        if let Err(e) = self.check_version(&request.version) {
            warn!(
                "Rejecting join of {} from {}: {}",
                request.host_display_name, peer, e
            );
            write_json(&mut stream, &rejection(e.to_string(), false)).await?;
            return Ok(());
        }

        let host_id = match self.allocate_host_id().await {
            Ok(host_id) => host_id,
            Err(e) => {
                error!("Failed to allocate a host id: {}", e);
                write_json(&mut stream, &rejection("Host id allocation failed", true)).await?;
                return Ok(());
            }
        };

        let result = self
            .complete_admission(stream, peer, host_id, &request)
            .await;
        if result.is_err() {
            self.discard_pending_connections(host_id);
        }
        result
    }

    /// Answer an accepted join, wait for join complete and register the host
    async fn complete_admission(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        host_id: HostId,
        request: &HostIdRequest,
    ) -> ClusterResult<()> {
        let reported_address = peer.ip().to_string();
        let address = if request.address.is_empty() {
            reported_address.clone()
        } else {
            request.address.clone()
        };
        let info = HostInfo::new(
            host_id,
            address,
            request.port,
            request.host_display_name.clone(),
        );

        let accepted = HostIdAccepted {
            new_host_id: host_id,
            reported_address,
            hosts: self.topology(),
            timestamp: now_millis(),
            version: self.version().clone(),
            instance_id: self.instance_id(),
        };
        write_json(&mut stream, &HostIdResponse::Accepted(accepted)).await?;
        info!(
            "Assigned host id {} to {} ({})",
            host_id, request.host_display_name, peer
        );

        let timeout = self.config().mesh.join_complete_timeout();
        let mut marker = [0u8; 1];
        let completed = tokio::select! {
            _ = self.shutdown_token().cancelled() => return Err(ClusterError::ShuttingDown),
            read = tokio::time::timeout(timeout, stream.read_exact(&mut marker)) => read,
        };
        match completed {
            Ok(Ok(_)) if marker[0] == JOIN_COMPLETE => {}
            Ok(Ok(_)) => {
                return Err(ClusterError::Handshake(format!(
                    "Host {} sent {:#04x} instead of join complete",
                    host_id, marker[0]
                )))
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(ClusterError::JoinTimeout(format!(
                    "Host {} did not complete its join within {} seconds",
                    host_id,
                    timeout.as_secs()
                )))
            }
        }

        let expected = self.config().node.sub_connections.saturating_sub(1);
        let mut streams = vec![stream];
        streams.extend(self.take_pending_connections(host_id, expected).await);
        self.register_admitted(info, streams, &request.version)
    }

    fn register_admitted(
        &self,
        info: HostInfo,
        streams: Vec<TcpStream>,
        version: &VersionInfo,
    ) -> ClusterResult<()> {
        let registered = self
            .add_remote_host(info, streams)
            .and_then(|_| self.commit_version(version));
        if let Err(e) = &registered {
            if e.is_fatal() {
                self.crash_local(&e.to_string());
            }
        }
        registered
    }

    /// An admitted host connecting to this member
    async fn accept_publish(
        &self,
        mut stream: TcpStream,
        publish: PublishHostId,
    ) -> ClusterResult<()> {
        if let Err(e) = self.check_version(&publish.version) {
            warn!(
                "Refusing connection from host {} ({}): {}",
                publish.host_id, publish.host_display_name, e
            );
            write_json(&mut stream, &peer_rejection(e.to_string())).await?;
            return Ok(());
        }

        let ack = PeerAck::Accepted(PeerAccepted {
            timestamp: now_millis(),
            version: self.version().clone(),
        });
        write_json(&mut stream, &ack).await?;

        let expected = self.config().node.sub_connections.saturating_sub(1);
        let mut streams = vec![stream];
        streams.extend(self.take_pending_connections(publish.host_id, expected).await);
        self.register_admitted(publish.host_info(), streams, &publish.version)
    }

    async fn accept_extra_connection(
        &self,
        mut stream: TcpStream,
        request: ConnectionRequest,
    ) -> ClusterResult<()> {
        if self.remote_host(request.host_id).is_some() {
            write_json(
                &mut stream,
                &peer_rejection(format!("Host {} is already connected", request.host_id)),
            )
            .await?;
            return Ok(());
        }

        let ack = PeerAck::Accepted(PeerAccepted {
            timestamp: now_millis(),
            version: self.version().clone(),
        });
        write_json(&mut stream, &ack).await?;
        debug!("Stashed sub-connection for host {}", request.host_id);
        self.stash_connection(request.host_id, stream);
        Ok(())
    }
}
