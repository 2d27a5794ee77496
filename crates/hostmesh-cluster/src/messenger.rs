//! Cluster membership manager
//!
//! [`HostMessenger`] owns the registries of remote hosts, local mailboxes and
//! failed hosts. It routes outbound messages, delivers inbound ones, turns
//! connection events into failure reports and runs the partition decision
//! for every batch of failures.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use hostmesh_core::config::{CipherKind, MeshConfig};
use hostmesh_core::types::{
    host_of, hsid, hsid_to_string, hsids_to_string, ActiveVersions, HostId, HostInfo, HsId,
    VersionInfo, AGREEMENT_SITE_ID, HEARTBEAT_SITE_ID, UNASSIGNED_HOST_ID,
};
use hostmesh_core::utils::now_millis;
use hostmesh_core::MAX_ACTIVE_VERSIONS;
use hostmesh_crypto::{AesGcmCipher, FrameCipher, PlaintextCipher};
use hostmesh_messaging::{
    FailureSiteForward, FailureSiteUpdate, Frame, FrameCodec, Heartbeat, Mailbox, Message,
    MessageFactory, MessageRouter, Payload, PoisonCause, SiteMailbox, UnknownSiteMailbox,
};

use crate::connection::{HostEvent, HostListener};
use crate::coordinator::{
    host_id_from_path, host_metadata_path, CoordinateError, CoordinateStore, CreateMode,
    HostMetadata, InMemoryCoordinateStore, InstanceId, HOST_ID_PREFIX, INSTANCE_ID_PATH,
};
use crate::error::{ClusterError, ClusterResult};
use crate::fatal::{FatalHandler, ProcessExit};
use crate::fault::{FaultPropagator, FaultSink, LoggingFaultSink};
use crate::heartbeat::{run_heartbeats, HeartbeatMailbox};
use crate::joiner::{JoinOutcome, JoinRole, SocketJoiner};
use crate::partition;
use crate::registry::CowMap;
use crate::remote_host::{Liveness, RemoteHost};

/// How long a newly admitted host's secondary sockets may trail its primary
const PENDING_CONNECTION_WAIT: Duration = Duration::from_secs(10);

/// How long the event loop gathers further host events after the first one
const EVENT_SETTLE_WINDOW: Duration = Duration::from_millis(100);

/// Secondary sockets stashed for one host, with the time the first arrived
struct PendingConnections {
    since: Instant,
    streams: Vec<TcpStream>,
}

/// Builder for [`HostMessenger`]
pub struct HostMessengerBuilder {
    config: MeshConfig,
    fault_sink: Option<Arc<dyn FaultSink>>,
    fatal: Option<Arc<dyn FatalHandler>>,
    store: Option<Arc<dyn CoordinateStore>>,
    factory: Option<MessageFactory>,
    cipher: Option<Arc<dyn FrameCipher>>,
}

impl HostMessengerBuilder {
    /// Receiver of fault reports, [`LoggingFaultSink`] by default
    pub fn fault_sink(mut self, sink: Arc<dyn FaultSink>) -> Self {
        self.fault_sink = Some(sink);
        self
    }

    /// Handler for fatal conditions, [`ProcessExit`] by default
    pub fn fatal_handler(mut self, handler: Arc<dyn FatalHandler>) -> Self {
        self.fatal = Some(handler);
        self
    }

    /// Coordinate store, a private [`InMemoryCoordinateStore`] by default
    pub fn coordinate_store(mut self, store: Arc<dyn CoordinateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Message factory with application message types registered
    pub fn message_factory(mut self, factory: MessageFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Frame cipher, derived from the `[security]` configuration by default
    pub fn cipher(mut self, cipher: Arc<dyn FrameCipher>) -> Self {
        self.cipher = Some(cipher);
        self
    }

    pub fn build(self) -> ClusterResult<Arc<HostMessenger>> {
        self.config.validate()?;

        let cipher = match self.cipher {
            Some(cipher) => cipher,
            None => cipher_from_config(&self.config)?,
        };
        let codec = FrameCodec::new(cipher);
        let version = VersionInfo::new(
            self.config.mesh.version.clone(),
            self.config.mesh.compatible_version_pattern.clone(),
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (live_count, _) = watch::channel(0usize);
        let config = self.config;

        Ok(Arc::new_cyclic(|self_ref| HostMessenger {
            display_name: config.display_name(),
            active_versions: Mutex::new(ActiveVersions::new(
                version.version_string.clone(),
                MAX_ACTIVE_VERSIONS,
            )),
            version,
            local_host_id: AtomicI32::new(UNASSIGNED_HOST_ID),
            local_info: RwLock::new(None),
            instance_id: RwLock::new(None),
            listen_addr: RwLock::new(None),
            foreign_hosts: CowMap::new(),
            mailboxes: CowMap::new(),
            failed_hosts: CowMap::new(),
            stopping_hosts: Mutex::new(BTreeSet::new()),
            pending_connections: Mutex::new(HashMap::new()),
            pending_notify: Notify::new(),
            mutation: Mutex::new(()),
            join_lock: tokio::sync::Mutex::new(()),
            paused: AtomicBool::new(false),
            partition_detection: AtomicBool::new(config.failure.partition_detection),
            shutting_down: AtomicBool::new(false),
            dead_host_timeout_ms: Arc::new(AtomicU64::new(config.failure.dead_host_timeout_ms)),
            next_site_id: AtomicI32::new(0),
            fault_sink: self.fault_sink.unwrap_or_else(|| Arc::new(LoggingFaultSink)),
            fatal: self.fatal.unwrap_or_else(|| Arc::new(ProcessExit)),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryCoordinateStore::new())),
            factory: Arc::new(self.factory.unwrap_or_default()),
            codec,
            propagator: FaultPropagator::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            live_count,
            shutdown: CancellationToken::new(),
            self_ref: self_ref.clone(),
            config,
        }))
    }
}

fn cipher_from_config(config: &MeshConfig) -> ClusterResult<Arc<dyn FrameCipher>> {
    let cipher: Arc<dyn FrameCipher> = match config.security.cipher {
        CipherKind::Plaintext => Arc::new(PlaintextCipher),
        CipherKind::Aes256Gcm => match (&config.security.key, &config.security.passphrase) {
            (Some(key), _) => Arc::new(AesGcmCipher::from_hex(key)?),
            (None, Some(passphrase)) => Arc::new(AesGcmCipher::from_passphrase(passphrase)?),
            (None, None) => {
                return Err(ClusterError::InvalidConfig(
                    "aes256gcm cipher selected without key or passphrase".into(),
                ))
            }
        },
    };
    Ok(cipher)
}

/// Membership manager of one host
pub struct HostMessenger {
    config: MeshConfig,
    version: VersionInfo,
    display_name: String,

    /// Assigned once the join completes
    local_host_id: AtomicI32,
    local_info: RwLock<Option<HostInfo>>,
    instance_id: RwLock<Option<InstanceId>>,
    listen_addr: RwLock<Option<SocketAddr>>,

    foreign_hosts: CowMap<HostId, Arc<RemoteHost>>,
    mailboxes: CowMap<HsId, Arc<dyn Mailbox>>,
    /// Failed host id to last known display name, never shrinks
    failed_hosts: CowMap<HostId, String>,
    /// Hosts announced as stopping by a stop-node notice
    stopping_hosts: Mutex<BTreeSet<HostId>>,
    /// Secondary sockets of hosts that are not admitted yet
    pending_connections: Mutex<HashMap<HostId, PendingConnections>>,
    pending_notify: Notify,

    /// Serializes registry writers
    mutation: Mutex<()>,
    /// Held by the leader for the whole admission of one joining host
    join_lock: tokio::sync::Mutex<()>,
    active_versions: Mutex<ActiveVersions>,

    paused: AtomicBool,
    partition_detection: AtomicBool,
    shutting_down: AtomicBool,
    dead_host_timeout_ms: Arc<AtomicU64>,
    next_site_id: AtomicI32,

    fault_sink: Arc<dyn FaultSink>,
    fatal: Arc<dyn FatalHandler>,
    store: Arc<dyn CoordinateStore>,
    factory: Arc<MessageFactory>,
    codec: FrameCodec,
    propagator: FaultPropagator,

    events_tx: mpsc::UnboundedSender<HostEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<HostEvent>>>,
    /// Number of live hosts, the local one included
    live_count: watch::Sender<usize>,
    shutdown: CancellationToken,
    self_ref: Weak<HostMessenger>,
}

impl HostMessenger {
    pub fn builder(config: MeshConfig) -> HostMessengerBuilder {
        HostMessengerBuilder {
            config,
            fault_sink: None,
            fatal: None,
            store: None,
            factory: None,
            cipher: None,
        }
    }

    /// Join or found the mesh, then start serving it
    pub async fn start(self: &Arc<Self>) -> ClusterResult<()> {
        if self.local_host_id() != UNASSIGNED_HOST_ID {
            return Err(ClusterError::Internal("Host messenger already started".into()));
        }
        info!(
            "Starting host messenger '{}' (version {})",
            self.display_name, self.version.version_string
        );

        let joiner = SocketJoiner::new(
            &self.config,
            self.version.clone(),
            self.shutdown.child_token(),
        );
        let role = joiner.start().await.map_err(|e| self.escalate(e))?;

        let listener = match role {
            JoinRole::Leader { listener, address } => {
                let port = listener.local_addr()?.port();
                self.start_as_leader(address, port)
                    .await
                    .map_err(|e| self.escalate(e))?;
                listener
            }
            JoinRole::Follower { listener, outcome } => {
                self.start_as_follower(outcome)
                    .await
                    .map_err(|e| self.escalate(e))?;
                listener
            }
        };

        *self.listen_addr.write() = listener.local_addr().ok();
        self.spawn_listener(listener);
        self.install_heartbeat_site();
        self.spawn_event_loop();
        tokio::spawn(run_heartbeats(
            self.self_ref.clone(),
            Duration::from_millis(self.config.failure.heartbeat_interval_ms),
            self.shutdown.child_token(),
        ));

        info!(
            "Host {} joined the mesh with {} live hosts",
            self.local_host_id(),
            *self.live_count.borrow()
        );
        Ok(())
    }

    async fn start_as_leader(&self, address: String, port: u16) -> ClusterResult<()> {
        let host_id = self.allocate_host_id().await?;
        if host_id != 0 {
            return Err(ClusterError::LeaderHostId(host_id));
        }
        let info = HostInfo::new(0, address.clone(), port, self.display_name.clone());
        self.set_local(info.clone());

        let instance = InstanceId {
            coord: format!("{}:{}", address, port),
            timestamp: now_millis(),
        };
        let data = serde_json::to_vec(&instance)?;
        let instance = match self
            .store
            .create(INSTANCE_ID_PATH, data, CreateMode::Persistent)
            .await
        {
            Ok(_) => instance,
            Err(CoordinateError::NodeExists(_)) => {
                serde_json::from_slice(&self.store.get_data(INSTANCE_ID_PATH).await?)?
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            "Mesh instance id {} @ {}",
            instance.coord, instance.timestamp
        );
        *self.instance_id.write() = Some(instance);

        self.publish_host_metadata(&info).await
    }

    async fn start_as_follower(&self, outcome: JoinOutcome) -> ClusterResult<()> {
        let JoinOutcome {
            local,
            instance_id,
            hosts,
            versions,
            ..
        } = outcome;

        self.set_local(local.clone());
        *self.instance_id.write() = instance_id;
        *self.active_versions.lock() = versions;
        self.publish_host_metadata(&local).await?;

        for host in hosts {
            self.add_remote_host(host.info, host.streams)?;
        }
        Ok(())
    }

    fn set_local(&self, info: HostInfo) {
        self.local_host_id.store(info.host_id, Ordering::Release);
        *self.local_info.write() = Some(info);
        self.update_live_count();
    }

    /// Route a fatal error to the fatal handler, returning it for the caller
    fn escalate(&self, error: ClusterError) -> ClusterError {
        if error.is_fatal() {
            self.fatal.crash_local(&error.to_string());
        }
        error
    }

    pub(crate) fn crash_local(&self, reason: &str) {
        self.fatal.crash_local(reason);
    }

    // Coordinate store

    pub(crate) async fn allocate_host_id(&self) -> ClusterResult<HostId> {
        let path = self
            .store
            .create(HOST_ID_PREFIX, Vec::new(), CreateMode::PersistentSequential)
            .await?;
        host_id_from_path(&path)
            .ok_or_else(|| ClusterError::Internal(format!("Unexpected host id path {}", path)))
    }

    async fn publish_host_metadata(&self, info: &HostInfo) -> ClusterResult<()> {
        let metadata = HostMetadata {
            address: info.address.clone(),
            port: info.port,
            host_display_name: info.host_display_name.clone(),
            group: "0".to_string(),
            sites_per_host: 0,
        };
        let path = host_metadata_path(info.host_id);
        match self
            .store
            .create(
                &path,
                serde_json::to_vec(&metadata)?,
                CreateMode::Ephemeral {
                    owner: info.host_id as i64,
                },
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(CoordinateError::NodeExists(_)) => {
                debug!("Host metadata {} already published", path);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // Remote hosts

    fn liveness(&self) -> Liveness {
        Liveness {
            dead_host_timeout_ms: Arc::clone(&self.dead_host_timeout_ms),
            warn_fraction: self.config.failure.warn_fraction,
            warn_interval_ms: self.config.failure.warn_interval_ms as i64,
        }
    }

    /// Admit a remote host over already negotiated streams, primary first
    pub(crate) fn add_remote_host(
        &self,
        info: HostInfo,
        streams: Vec<TcpStream>,
    ) -> ClusterResult<Arc<RemoteHost>> {
        let host_id = info.host_id;
        let host = {
            let _writer = self.mutation.lock();
            if host_id == self.local_host_id()
                || self.foreign_hosts.contains_key(&host_id)
                || self.failed_hosts.contains_key(&host_id)
            {
                return Err(ClusterError::DuplicateHost(host_id));
            }
            let listener: Weak<dyn HostListener> = self.self_ref.clone();
            let host = RemoteHost::new(
                self.local_host_id(),
                info,
                streams,
                self.liveness(),
                Arc::clone(&self.factory),
                listener,
                self.events_tx.clone(),
            );
            self.foreign_hosts
                .update(|hosts| hosts.insert(host_id, Arc::clone(&host)));
            host
        };

        host.start(&self.codec);
        self.update_live_count();
        info!(
            "Connected to host {} ({}) over {} sub-connection(s)",
            host_id,
            host.display_name(),
            host.sub_connection_count()
        );
        Ok(host)
    }

    /// Stash a secondary socket until its host is admitted
    pub(crate) fn stash_connection(&self, host_id: HostId, stream: TcpStream) {
        self.purge_expired_connections();
        self.pending_connections
            .lock()
            .entry(host_id)
            .or_insert_with(|| PendingConnections {
                since: Instant::now(),
                streams: Vec::new(),
            })
            .streams
            .push(stream);
        self.pending_notify.notify_waiters();
    }

    /// A stash entry outlives the longest legitimate admission: the wait for
    /// join complete followed by the wait for trailing sub-connections
    fn pending_connection_ttl(&self) -> Duration {
        self.config.mesh.join_complete_timeout() + PENDING_CONNECTION_WAIT
    }

    /// Close stashed sockets of hosts that were never admitted within `ttl`
    fn purge_stale_connections(&self, ttl: Duration) {
        let mut pending = self.pending_connections.lock();
        pending.retain(|host_id, entry| {
            let keep = entry.since.elapsed() < ttl;
            if !keep {
                warn!(
                    "Dropping {} stashed sub-connection(s) of host {} that never joined",
                    entry.streams.len(),
                    host_id
                );
            }
            keep
        });
    }

    /// Close the stashed sockets of a host whose admission failed
    pub(crate) fn discard_pending_connections(&self, host_id: HostId) {
        if let Some(entry) = self.pending_connections.lock().remove(&host_id) {
            debug!(
                "Closing {} stashed sub-connection(s) of host {}",
                entry.streams.len(),
                host_id
            );
        }
    }

    /// Close stashed sockets older than the admission window
    pub(crate) fn purge_expired_connections(&self) {
        self.purge_stale_connections(self.pending_connection_ttl());
    }

    /// Take the stashed sockets of `host_id`, waiting a bounded time until
    /// `expected` of them arrived
    pub(crate) async fn take_pending_connections(
        &self,
        host_id: HostId,
        expected: usize,
    ) -> Vec<TcpStream> {
        let deadline = Instant::now() + PENDING_CONNECTION_WAIT;
        loop {
            let notified = self.pending_notify.notified();
            {
                let mut pending = self.pending_connections.lock();
                let have = pending.get(&host_id).map_or(0, |entry| entry.streams.len());
                if have >= expected || Instant::now() >= deadline {
                    if have < expected {
                        warn!(
                            "Host {} opened {} of {} secondary connections",
                            host_id, have, expected
                        );
                    }
                    return pending
                        .remove(&host_id)
                        .map(|entry| entry.streams)
                        .unwrap_or_default();
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
                _ = self.shutdown.cancelled() => return Vec::new(),
            }
        }
    }

    /// Topology answered to joining hosts: leader first, then by host id
    pub(crate) fn topology(&self) -> Vec<HostInfo> {
        let mut hosts: Vec<HostInfo> = self.local_info().into_iter().collect();
        let mut remote: Vec<HostInfo> = self
            .foreign_hosts
            .snapshot()
            .values()
            .filter(|h| h.is_up())
            .map(|h| h.info().clone())
            .collect();
        remote.sort_by_key(|h| h.host_id);
        hosts.extend(remote);
        hosts
    }

    pub(crate) fn version(&self) -> &VersionInfo {
        &self.version
    }

    pub(crate) fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Reject `remote` unless it is compatible and fits the active version cap.
    /// Nothing is recorded until [`commit_version`](Self::commit_version).
    pub(crate) fn check_version(&self, remote: &VersionInfo) -> ClusterResult<()> {
        self.version.check_compatible(remote)?;
        let mut versions = self.active_versions.lock().clone();
        versions.admit(&remote.version_string)?;
        Ok(())
    }

    /// Record the version of a host that has been registered
    pub(crate) fn commit_version(&self, remote: &VersionInfo) -> ClusterResult<()> {
        self.active_versions.lock().admit(&remote.version_string)?;
        Ok(())
    }

    pub(crate) async fn lock_admission(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.join_lock.lock().await
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn remote_host(&self, host_id: HostId) -> Option<Arc<RemoteHost>> {
        self.foreign_hosts.get(&host_id)
    }

    // Failure handling

    /// Handle the failure of one remote host. Repeated reports are ignored.
    pub fn report_foreign_host_failed(&self, host_id: HostId) {
        self.report_foreign_hosts_failed(&[host_id]);
    }

    /// Handle a batch of host failures and decide whether the local fragment
    /// survives
    pub fn report_foreign_hosts_failed(&self, host_ids: &[HostId]) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }

        let local = self.local_host_id();
        let (previous, newly_failed) = {
            let _writer = self.mutation.lock();
            let previous = self.partition_view(true);
            let mut newly_failed = Vec::new();

            for host_id in host_ids {
                if *host_id == local || self.failed_hosts.contains_key(host_id) {
                    continue;
                }
                let removed = self.foreign_hosts.update(|hosts| hosts.remove(host_id));
                let name = removed
                    .as_ref()
                    .map(|h| h.display_name().to_string())
                    .unwrap_or_else(|| "UNKNOWN".to_string());
                if let Some(host) = removed {
                    host.close();
                }
                self.failed_hosts
                    .update(|failed| failed.insert(*host_id, name.clone()));
                self.pending_connections.lock().remove(host_id);
                newly_failed.push((*host_id, name));
            }
            (previous, newly_failed)
        };

        if newly_failed.is_empty() {
            return;
        }

        let stopping = self.stopping_hosts.lock().clone();
        for (host_id, name) in &newly_failed {
            if stopping.contains(host_id) {
                info!("Host {} ({}) stopped as announced", host_id, name);
            } else {
                error!("Host {} ({}) failed", host_id, name);
            }
            metrics::counter!("hostmesh_host_failures_total").increment(1);
            self.fault_sink
                .report_fault_site(hsid(*host_id, AGREEMENT_SITE_ID));
            self.expire_host_metadata(*host_id);
        }
        self.update_live_count();

        let current = self.partition_view(false);
        {
            let mut stopping = self.stopping_hosts.lock();
            for (host_id, _) in &newly_failed {
                stopping.remove(host_id);
            }
        }
        if partition::decide(
            &previous,
            &current,
            self.partition_detection.load(Ordering::Acquire),
        ) {
            self.fatal.crash_local(&format!(
                "Partition detected: {} of {} hosts remain reachable ({:?} of {:?}), \
                 shutting down this fragment",
                current.len(),
                previous.len(),
                current,
                previous
            ));
        }
    }

    fn expire_host_metadata(&self, host_id: HostId) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        handle.spawn(async move {
            if let Err(e) = store.expire_owner(host_id as i64).await {
                debug!("Failed to expire metadata of host {}: {}", host_id, e);
            }
        });
    }

    /// Hosts taking part in the partition decision: the local host plus every
    /// registered remote host not announced as stopping. Registered hosts whose
    /// connections already dropped count only when `include_down` is set, so
    /// failures still waiting for their report are not mistaken for survivors.
    fn partition_view(&self, include_down: bool) -> BTreeSet<HostId> {
        let stopping = self.stopping_hosts.lock();
        let mut view: BTreeSet<HostId> = self
            .foreign_hosts
            .snapshot()
            .values()
            .filter(|h| include_down || h.is_up())
            .map(|h| h.host_id())
            .filter(|h| !stopping.contains(h))
            .collect();
        let local = self.local_host_id();
        if local != UNASSIGNED_HOST_ID && !stopping.contains(&local) {
            view.insert(local);
        }
        view
    }

    fn spawn_event_loop(&self) {
        let Some(mut rx) = self.events_rx.lock().take() else {
            return;
        };
        let messenger = self.self_ref.clone();
        let cancel = self.shutdown.child_token();

        tokio::spawn(async move {
            loop {
                let first = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let mut batch = vec![first];
                // Connections lost to one split close within moments of each
                // other and must share one partition decision
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(EVENT_SETTLE_WINDOW) => {}
                }
                while let Ok(event) = rx.try_recv() {
                    batch.push(event);
                }
                match messenger.upgrade() {
                    Some(messenger) => messenger.handle_events(batch),
                    None => break,
                }
            }
            debug!("Host event loop stopped");
        });
    }

    fn handle_events(&self, batch: Vec<HostEvent>) {
        let mut failed = Vec::new();
        for event in batch {
            match event {
                HostEvent::Stopped { host_id } => failed.push(host_id),
                HostEvent::DeadHostTimeout { host_id, silent_ms } => {
                    debug!("Host {} silent for {} ms", host_id, silent_ms);
                    failed.push(host_id);
                }
                HostEvent::StopNodeNotice {
                    from_host,
                    target_host,
                } => {
                    info!(
                        "Host {} announced that host {} is stopping",
                        from_host, target_host
                    );
                    self.stopping_hosts.lock().insert(target_host);
                }
            }
        }
        if !failed.is_empty() {
            self.report_foreign_hosts_failed(&failed);
        }
    }

    /// Derive fault notifications from a failure update received from
    /// another host
    fn propagate_failure(&self, message: &Message) {
        let (reporter, update) = match message.payload() {
            Payload::FailureSiteUpdate(update) => (message.source(), update),
            Payload::FailureSiteForward(forward) => (forward.reporting_hsid, &forward.update),
            _ => return,
        };
        let local_site = hsid(self.local_host_id(), AGREEMENT_SITE_ID);
        for fault in self.propagator.derive(local_site, reporter, update) {
            debug!(
                "Derived fault for {} reported by {}",
                hsid_to_string(fault.failed_site),
                hsid_to_string(fault.reporting_site)
            );
            self.fault_sink.report_fault(fault);
        }
    }

    /// Relay a failure update witnessed by `reporter` to `destinations`
    pub fn relay_failure_update(
        &self,
        reporter: HsId,
        update: FailureSiteUpdate,
        destinations: &[HsId],
    ) {
        let mut message = Message::new(FailureSiteForward::new(reporter, update));
        message.set_source(hsid(self.local_host_id(), AGREEMENT_SITE_ID));
        self.send_many(destinations, message);
    }

    /// Forget dedup state of a failure the arbiter has resolved
    pub fn fault_resolved(&self, failed_site: HsId) {
        self.propagator.resolved(failed_site);
    }

    // Mailboxes

    fn placeholder(&self, hsid: HsId) -> Arc<dyn Mailbox> {
        let router: Weak<dyn MessageRouter> = self.self_ref.clone();
        Arc::new(UnknownSiteMailbox::new(
            router,
            hsid,
            self.config.failure.unknown_site_reply,
        ))
    }

    fn next_local_hsid(&self) -> ClusterResult<HsId> {
        let local = self.local_host_id();
        if local == UNASSIGNED_HOST_ID {
            return Err(ClusterError::NotStarted);
        }
        Ok(hsid(local, self.next_site_id.fetch_add(1, Ordering::AcqRel)))
    }

    /// Reserve an HSId bound to a placeholder until a real mailbox is
    /// registered for it
    pub fn generate_mailbox_id(&self, proposed: Option<HsId>) -> ClusterResult<HsId> {
        let hsid = match proposed {
            Some(hsid) => hsid,
            None => self.next_local_hsid()?,
        };
        let placeholder = self.placeholder(hsid);
        let _writer = self.mutation.lock();
        if self.mailboxes.contains_key(&hsid) {
            return Err(ClusterError::DuplicateMailbox(hsid_to_string(hsid)));
        }
        self.mailboxes
            .update(|mailboxes| mailboxes.insert(hsid, placeholder));
        Ok(hsid)
    }

    /// Create and bind a [`SiteMailbox`], at a fresh local HSId unless one is
    /// proposed
    pub fn create_mailbox(&self, proposed: Option<HsId>) -> ClusterResult<Arc<SiteMailbox>> {
        let hsid = match proposed {
            Some(hsid) => hsid,
            None => self.next_local_hsid()?,
        };
        let router: Weak<dyn MessageRouter> = self.self_ref.clone();
        let mailbox = Arc::new(SiteMailbox::new(router, hsid));

        let _writer = self.mutation.lock();
        if self.mailboxes.contains_key(&hsid) {
            return Err(ClusterError::DuplicateMailbox(hsid_to_string(hsid)));
        }
        let bound: Arc<dyn Mailbox> = mailbox.clone();
        self.mailboxes.update(|mailboxes| mailboxes.insert(hsid, bound));
        debug!("Created mailbox {}", hsid_to_string(hsid));
        Ok(mailbox)
    }

    /// Replace the placeholder of a generated HSId with `mailbox`
    pub fn register_mailbox(&self, mailbox: Arc<dyn Mailbox>) -> ClusterResult<()> {
        let hsid = mailbox.hsid();
        let _writer = self.mutation.lock();
        if !self.mailboxes.contains_key(&hsid) {
            return Err(ClusterError::UnknownMailbox(hsid_to_string(hsid)));
        }
        self.mailboxes.update(|mailboxes| mailboxes.insert(hsid, mailbox));
        Ok(())
    }

    /// Unbind and close the mailbox at `hsid`
    pub fn remove_mailbox(&self, hsid: HsId) -> Option<Arc<dyn Mailbox>> {
        let removed = {
            let _writer = self.mutation.lock();
            self.mailboxes.update(|mailboxes| mailboxes.remove(&hsid))
        };
        if let Some(mailbox) = &removed {
            mailbox.close();
        }
        removed
    }

    pub fn mailbox(&self, hsid: HsId) -> Option<Arc<dyn Mailbox>> {
        self.mailboxes.get(&hsid)
    }

    fn install_heartbeat_site(&self) {
        let hsid = hsid(self.local_host_id(), HEARTBEAT_SITE_ID);
        let router: Weak<dyn MessageRouter> = self.self_ref.clone();
        let mailbox: Arc<dyn Mailbox> = Arc::new(HeartbeatMailbox::new(router, hsid));
        let _writer = self.mutation.lock();
        self.mailboxes.update(|mailboxes| mailboxes.insert(hsid, mailbox));
    }

    fn deliver_local(&self, destination: HsId, message: Message) {
        match self.mailboxes.get(&destination) {
            Some(mailbox) => {
                mailbox.deliver(message);
                metrics::counter!("hostmesh_messages_delivered_total").increment(1);
            }
            None => {
                info!(
                    "No mailbox at {} for {} message from {}, dropping",
                    hsid_to_string(destination),
                    message.payload().kind(),
                    hsid_to_string(message.source())
                );
                metrics::counter!("hostmesh_messages_dropped_total", "reason" => "no_mailbox")
                    .increment(1);
            }
        }
    }

    /// Periodic heartbeat to the heartbeat site of every remote host
    pub(crate) fn send_heartbeats(&self, sequence: i64) {
        let mut message = Message::new(Heartbeat::new(sequence, sequence - 1));
        message.set_source(hsid(self.local_host_id(), HEARTBEAT_SITE_ID));
        for host in self.foreign_hosts.snapshot().values() {
            host.send(&[hsid(host.host_id(), HEARTBEAT_SITE_ID)], &message);
        }
    }

    // Operational controls

    pub fn set_dead_host_timeout(&self, timeout_ms: u64) {
        info!("Dead host timeout set to {} ms", timeout_ms);
        self.dead_host_timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    pub fn dead_host_timeout_ms(&self) -> u64 {
        self.dead_host_timeout_ms.load(Ordering::Relaxed)
    }

    pub fn set_partition_detection(&self, enabled: bool) {
        info!(
            "Partition detection {}",
            if enabled { "enabled" } else { "disabled" }
        );
        self.partition_detection.store(enabled, Ordering::Release);
    }

    pub fn partition_detection_enabled(&self) -> bool {
        self.partition_detection.load(Ordering::Acquire)
    }

    /// Reject new hosts with a retryable answer until [`unpause`](Self::unpause)
    pub fn pause(&self) {
        info!("Pausing admission of new hosts");
        self.paused.store(true, Ordering::Release);
    }

    pub fn unpause(&self) {
        info!("Resuming admission of new hosts");
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Drop every socket to `host_id` as if the network had failed
    pub fn cut_link(&self, host_id: HostId) -> ClusterResult<()> {
        let host = self
            .foreign_hosts
            .get(&host_id)
            .ok_or(ClusterError::HostNotFound(host_id))?;
        warn!("Cutting link to host {}", host_id);
        host.kill_socket();
        Ok(())
    }

    /// Tell every remote host to terminate
    pub fn send_poison_pill(&self, reason: &str) {
        let hosts: Vec<HostId> = self.foreign_hosts.snapshot().keys().copied().collect();
        self.send_poison_pill_to(&hosts, reason, PoisonCause::CrashAll);
    }

    /// Send a poison pill with a chosen cause to specific hosts
    pub fn send_poison_pill_to(&self, host_ids: &[HostId], reason: &str, cause: PoisonCause) {
        let hosts = self.foreign_hosts.snapshot();
        for host_id in host_ids {
            match hosts.get(host_id) {
                Some(host) => {
                    warn!("Sending poison pill ({:?}) to host {}: {}", cause, host_id, reason);
                    host.send_control(Frame::PoisonPill {
                        source: hsid(self.local_host_id(), AGREEMENT_SITE_ID),
                        reason: reason.to_string(),
                        cause,
                    });
                }
                None => debug!("No live host {} for poison pill", host_id),
            }
        }
    }

    /// Announce to every host that `target_host` is about to stop
    pub fn send_stop_node_notice(&self, target_host: HostId) {
        self.stopping_hosts.lock().insert(target_host);
        let source = hsid(self.local_host_id(), AGREEMENT_SITE_ID);
        for host in self.foreign_hosts.snapshot().values() {
            host.send_control(Frame::StopNodeNotice {
                source,
                target_host,
            });
        }
    }

    // Queries

    pub fn local_host_id(&self) -> HostId {
        self.local_host_id.load(Ordering::Acquire)
    }

    pub fn local_info(&self) -> Option<HostInfo> {
        self.local_info.read().clone()
    }

    /// HSId of the local agreement site
    pub fn agreement_hsid(&self) -> HsId {
        hsid(self.local_host_id(), AGREEMENT_SITE_ID)
    }

    pub fn instance_id(&self) -> Option<InstanceId> {
        self.instance_id.read().clone()
    }

    /// Address of the mesh listener once started
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.read()
    }

    /// The local host plus every remote host that is up
    pub fn live_host_ids(&self) -> BTreeSet<HostId> {
        let mut live: BTreeSet<HostId> = self
            .foreign_hosts
            .snapshot()
            .values()
            .filter(|h| h.is_up())
            .map(|h| h.host_id())
            .collect();
        let local = self.local_host_id();
        if local != UNASSIGNED_HOST_ID {
            live.insert(local);
        }
        live
    }

    pub fn count_foreign_hosts(&self) -> usize {
        self.foreign_hosts
            .snapshot()
            .values()
            .filter(|h| h.is_up())
            .count()
    }

    /// Display name of a live or failed host, `"UNKNOWN"` otherwise
    pub fn hostname_for_host_id(&self, host_id: HostId) -> String {
        if host_id == self.local_host_id() {
            return self.display_name.clone();
        }
        if let Some(host) = self.foreign_hosts.get(&host_id) {
            return host.display_name().to_string();
        }
        self.failed_hosts
            .get(&host_id)
            .unwrap_or_else(|| "UNKNOWN".to_string())
    }

    /// Every host that failed since this process started, with its last
    /// known display name
    pub fn failed_hosts(&self) -> BTreeMap<HostId, String> {
        self.failed_hosts
            .snapshot()
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect()
    }

    /// Hosts announced as stopping whose disconnection has not happened yet
    pub fn stopping_hosts(&self) -> BTreeSet<HostId> {
        self.stopping_hosts.lock().clone()
    }

    pub fn active_versions(&self) -> Vec<String> {
        self.active_versions
            .lock()
            .versions()
            .map(str::to_string)
            .collect()
    }

    fn update_live_count(&self) {
        self.live_count.send_replace(self.live_host_ids().len());
    }

    /// Wait until at least `expected` hosts, the local one included, are live
    pub async fn wait_for_group_join(&self, expected: usize, timeout: Duration) -> ClusterResult<()> {
        let mut rx = self.live_count.subscribe();
        let reached = tokio::time::timeout(timeout, async {
            rx.wait_for(|count| *count >= expected).await.is_ok()
        })
        .await;

        match reached {
            Ok(true) => Ok(()),
            Ok(false) => Err(ClusterError::ShuttingDown),
            Err(_) => Err(ClusterError::JoinTimeout(format!(
                "{} of {} hosts joined",
                *self.live_count.borrow(),
                expected
            ))),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Close every connection, stop the listener and release mailbox waiters.
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down host messenger {}", self.local_host_id());
        self.shutdown.cancel();

        for host in self.foreign_hosts.snapshot().values() {
            host.close();
        }
        self.pending_connections.lock().clear();
        for mailbox in self.mailboxes.snapshot().values() {
            mailbox.close();
        }
    }
}

impl MessageRouter for HostMessenger {
    fn send(&self, destination: HsId, message: Message) {
        self.send_many(&[destination], message);
    }

    fn send_many(&self, destinations: &[HsId], message: Message) {
        let local = self.local_host_id();
        let mut remote: BTreeMap<HostId, Vec<HsId>> = BTreeMap::new();
        for destination in destinations {
            let host_id = host_of(*destination);
            if host_id == local {
                self.deliver_local(*destination, message.clone());
            } else {
                remote.entry(host_id).or_default().push(*destination);
            }
        }
        if remote.is_empty() {
            return;
        }

        let hosts = self.foreign_hosts.snapshot();
        for (host_id, destinations) in remote {
            match hosts.get(&host_id) {
                Some(host) => host.send(&destinations, &message),
                None => {
                    if self.failed_hosts.contains_key(&host_id) {
                        debug!(
                            "Dropping message to {} on failed host {}",
                            hsids_to_string(&destinations),
                            host_id
                        );
                    } else {
                        info!(
                            "Dropping message to {} on unknown host {}",
                            hsids_to_string(&destinations),
                            host_id
                        );
                    }
                    metrics::counter!("hostmesh_messages_dropped_total", "reason" => "unknown_host")
                        .increment(destinations.len() as u64);
                }
            }
        }
    }
}

impl HostListener for HostMessenger {
    fn deliver(&self, from_host: HostId, destinations: Vec<HsId>, message: Message) {
        trace!(
            "{} message from host {} for {} destination(s)",
            message.payload().kind(),
            from_host,
            destinations.len()
        );
        if matches!(
            message.payload(),
            Payload::FailureSiteUpdate(_) | Payload::FailureSiteForward(_)
        ) {
            self.propagate_failure(&message);
        }

        let mut destinations = destinations.into_iter().peekable();
        while let Some(destination) = destinations.next() {
            if destinations.peek().is_some() {
                self.deliver_local(destination, message.clone());
            } else {
                self.deliver_local(destination, message);
                break;
            }
        }
    }

    fn poison_pill(&self, from_host: HostId, reason: String, cause: PoisonCause) {
        if cause.is_terminal() {
            self.fatal.crash_local(&format!(
                "Received a poison pill ({:?}) from host {}: {}",
                cause, from_host, reason
            ));
        } else {
            warn!(
                "Host {} requested diagnostics: {}\n{}",
                from_host,
                reason,
                std::backtrace::Backtrace::force_capture()
            );
        }
    }

    fn fatal(&self, reason: String) {
        self.fatal.crash_local(&reason);
    }
}

impl std::fmt::Debug for HostMessenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMessenger")
            .field("local_host_id", &self.local_host_id())
            .field("display_name", &self.display_name)
            .field("foreign_hosts", &self.count_foreign_hosts())
            .field("failed_hosts", &self.failed_hosts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fatal::RecordingFatalHandler;
    use crate::handshake::{
        read_json, write_json, ConnectionRequest, HostIdRequest, HostIdResponse, JoinRequest,
        PeerAck,
    };

    fn leader_config() -> MeshConfig {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut config = MeshConfig::default();
        config.node.display_name = Some("leader".to_string());
        config.node.internal_interface = "127.0.0.1".to_string();
        config.node.internal_port = 0;
        config.mesh.coordinators = vec![format!("127.0.0.1:{}", port)];
        config.mesh.join_complete_timeout_secs = 1;
        config.mesh.version = "1.0".to_string();
        config.mesh.compatible_version_pattern = Some(r"^[12]\.0$".to_string());
        config
    }

    fn pending_count(messenger: &HostMessenger, host_id: HostId) -> usize {
        messenger
            .pending_connections
            .lock()
            .get(&host_id)
            .map_or(0, |entry| entry.streams.len())
    }

    async fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    /// Get a host id and stash one sub-connection, then never send join complete
    async fn abandon_join(leader: SocketAddr, version: &str) -> (HostId, Vec<TcpStream>) {
        let mut main = TcpStream::connect(leader).await.unwrap();
        let request = JoinRequest::RequestHostId(HostIdRequest {
            host_display_name: "straggler".to_string(),
            address: "127.0.0.1".to_string(),
            port: 1,
            version: VersionInfo::new(version, Some(r"^[12]\.0$".to_string())),
            timestamp: now_millis(),
            signature: None,
        });
        write_json(&mut main, &request).await.unwrap();
        let host_id = match read_json(&mut main).await.unwrap() {
            HostIdResponse::Accepted(accepted) => accepted.new_host_id,
            HostIdResponse::Rejected(rejection) => panic!("join rejected: {}", rejection.reason),
        };

        let mut extra = TcpStream::connect(leader).await.unwrap();
        write_json(
            &mut extra,
            &JoinRequest::RequestConnection(ConnectionRequest { host_id }),
        )
        .await
        .unwrap();
        let ack: PeerAck = read_json(&mut extra).await.unwrap();
        assert!(matches!(ack, PeerAck::Accepted(_)));

        (host_id, vec![main, extra])
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abandoned_join_releases_its_admission_state() {
        let messenger = HostMessenger::builder(leader_config())
            .fatal_handler(Arc::new(RecordingFatalHandler::new()))
            .build()
            .unwrap();
        messenger.start().await.unwrap();
        let leader = messenger.listen_addr().unwrap();

        let (host_id, _sockets) = abandon_join(leader, "2.0").await;
        assert!(wait_for(Duration::from_secs(1), || pending_count(&messenger, host_id) == 1).await);

        // Join complete never arrives, so the stash goes with the admission
        assert!(wait_for(Duration::from_secs(5), || pending_count(&messenger, host_id) == 0).await);
        assert!(messenger.remote_host(host_id).is_none());
        assert_eq!(messenger.active_versions(), vec!["1.0".to_string()]);

        messenger.shutdown();
    }

    #[tokio::test]
    async fn test_stale_stash_entries_expire() {
        let messenger = HostMessenger::builder(leader_config()).build().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        messenger.stash_connection(7, accepted);
        assert_eq!(pending_count(&messenger, 7), 1);

        messenger.purge_stale_connections(Duration::from_secs(60));
        assert_eq!(pending_count(&messenger, 7), 1);

        messenger.purge_stale_connections(Duration::ZERO);
        assert_eq!(pending_count(&messenger, 7), 0);
    }

    #[test]
    fn test_version_check_records_nothing() {
        let messenger = HostMessenger::builder(leader_config()).build().unwrap();
        let remote = VersionInfo::new("2.0", Some(r"^[12]\.0$".to_string()));

        messenger.check_version(&remote).unwrap();
        assert_eq!(messenger.active_versions(), vec!["1.0".to_string()]);

        messenger.commit_version(&remote).unwrap();
        assert_eq!(
            messenger.active_versions(),
            vec!["1.0".to_string(), "2.0".to_string()]
        );
    }
}
