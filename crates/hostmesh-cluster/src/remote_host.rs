//! A live or recently live peer host

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use hostmesh_core::types::{host_of, hsid_to_string, is_reserved, HostId, HostInfo, HsId};
use hostmesh_core::utils::now_millis;
use hostmesh_messaging::{Frame, FrameCodec, Message, MessageFactory};

use crate::connection::{HostEvent, HostListener, SubConnection};

/// Liveness settings shared by every remote host of one messenger
#[derive(Debug, Clone)]
pub(crate) struct Liveness {
    /// Adjustable at runtime
    pub dead_host_timeout_ms: Arc<AtomicU64>,
    pub warn_fraction: f64,
    pub warn_interval_ms: i64,
}

/// Destination to sub-connection binding.
///
/// A destination is bound on first use and keeps its sub-connection for the
/// life of the host, which keeps traffic to one site in order. Reserved sites
/// draw from their own counter.
#[derive(Debug, Default)]
struct Striping {
    assigned: HashMap<HsId, usize>,
    next_normal: usize,
    next_reserved: usize,
}

impl Striping {
    fn pick(&mut self, destination: HsId, count: usize) -> usize {
        if count <= 1 {
            return 0;
        }
        if let Some(index) = self.assigned.get(&destination) {
            return *index;
        }
        let counter = if is_reserved(destination) {
            &mut self.next_reserved
        } else {
            &mut self.next_normal
        };
        let index = *counter % count;
        *counter = counter.wrapping_add(1);
        self.assigned.insert(destination, index);
        index
    }
}

pub struct RemoteHost {
    host_id: HostId,
    local_host_id: HostId,
    info: HostInfo,
    connections: Vec<Arc<SubConnection>>,
    striping: Mutex<Striping>,
    last_message_ms: AtomicI64,
    last_warn_ms: AtomicI64,
    is_up: AtomicBool,
    dead_reported: AtomicBool,
    liveness: Liveness,
    factory: Arc<MessageFactory>,
    listener: Weak<dyn HostListener>,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl RemoteHost {
    pub(crate) fn new(
        local_host_id: HostId,
        info: HostInfo,
        streams: Vec<TcpStream>,
        liveness: Liveness,
        factory: Arc<MessageFactory>,
        listener: Weak<dyn HostListener>,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Arc<Self> {
        let connections = streams
            .into_iter()
            .enumerate()
            .map(|(index, stream)| Arc::new(SubConnection::new(index, stream)))
            .collect();

        Arc::new(Self {
            host_id: info.host_id,
            local_host_id,
            info,
            connections,
            striping: Mutex::new(Striping::default()),
            last_message_ms: AtomicI64::new(now_millis()),
            last_warn_ms: AtomicI64::new(0),
            is_up: AtomicBool::new(true),
            dead_reported: AtomicBool::new(false),
            liveness,
            factory,
            listener,
            events,
        })
    }

    /// Start reading and writing on every sub-connection
    pub(crate) fn start(self: &Arc<Self>, codec: &FrameCodec) {
        for conn in &self.connections {
            conn.start(codec.clone(), Arc::downgrade(self));
        }
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn info(&self) -> &HostInfo {
        &self.info
    }

    pub fn display_name(&self) -> &str {
        &self.info.host_display_name
    }

    pub fn is_up(&self) -> bool {
        self.is_up.load(Ordering::Acquire)
    }

    pub fn sub_connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Sub-connection index carrying traffic for `destination`
    pub fn sub_connection_for(&self, destination: HsId) -> usize {
        self.striping
            .lock()
            .pick(destination, self.connections.len())
    }

    /// Milliseconds since the last frame arrived from this host
    pub fn silent_for_ms(&self) -> i64 {
        now_millis() - self.last_message_ms.load(Ordering::Acquire)
    }

    /// Send one message to destinations on this host, one frame per
    /// sub-connection involved
    pub fn send(&self, destinations: &[HsId], message: &Message) {
        if destinations.is_empty() {
            return;
        }
        if !self.is_up() {
            warn!(
                "Attempted delivery of message to failed site: {}",
                hsid_to_string(destinations[0])
            );
            metrics::counter!("hostmesh_messages_dropped_total", "reason" => "host_down")
                .increment(1);
            return;
        }

        let payload = match message.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    "Cannot send {} message to host {}: {}",
                    message.payload().kind(),
                    self.host_id,
                    e
                );
                return;
            }
        };

        if self.connections.len() == 1 {
            self.connections[0].send(Frame::Message {
                source: message.source(),
                destinations: destinations.to_vec(),
                payload,
            });
            metrics::counter!("hostmesh_frames_sent_total").increment(1);
        } else {
            let mut groups: BTreeMap<usize, Vec<HsId>> = BTreeMap::new();
            {
                let mut striping = self.striping.lock();
                for dest in destinations {
                    let index = striping.pick(*dest, self.connections.len());
                    groups.entry(index).or_default().push(*dest);
                }
            }
            for (index, dests) in groups {
                self.connections[index].send(Frame::Message {
                    source: message.source(),
                    destinations: dests,
                    payload: payload.clone(),
                });
                metrics::counter!("hostmesh_frames_sent_total").increment(1);
            }
        }

        self.check_liveness();
    }

    /// Send a control frame (poison pill or stop-node notice)
    pub(crate) fn send_control(&self, frame: Frame) {
        if !self.is_up() {
            debug!(host = self.host_id, "Not sending control frame to a down host");
            return;
        }
        if let Some(conn) = self.connections.first() {
            conn.send(frame);
            metrics::counter!("hostmesh_frames_sent_total").increment(1);
        }
    }

    /// Report the host once it has been silent past the dead host timeout,
    /// warn ahead of that at a limited rate
    fn check_liveness(&self) {
        let now = now_millis();
        let silent = now - self.last_message_ms.load(Ordering::Acquire);
        let timeout = self.liveness.dead_host_timeout_ms.load(Ordering::Relaxed) as i64;

        if silent > timeout {
            if !self.dead_reported.swap(true, Ordering::AcqRel) {
                error!(
                    "DEAD HOST DETECTED, hostname: {}, host id: {}, no message received for {} ms",
                    self.display_name(),
                    self.host_id,
                    silent
                );
                let _ = self.events.send(HostEvent::DeadHostTimeout {
                    host_id: self.host_id,
                    silent_ms: silent,
                });
            }
            return;
        }

        let warn_after = (timeout as f64 * self.liveness.warn_fraction) as i64;
        if silent > warn_after {
            let last = self.last_warn_ms.load(Ordering::Acquire);
            if now - last >= self.liveness.warn_interval_ms
                && self
                    .last_warn_ms
                    .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                warn!(
                    "Have not received a message from host {} ({}) for {:.1} seconds",
                    self.display_name(),
                    self.host_id,
                    silent as f64 / 1000.0
                );
            }
        }
    }

    /// Dispatch one frame read from any sub-connection
    pub(crate) fn handle_frame(&self, frame: Frame) {
        self.last_message_ms.store(now_millis(), Ordering::Release);

        let Some(listener) = self.listener.upgrade() else {
            return;
        };

        match frame {
            Frame::Message {
                source,
                destinations,
                payload,
            } => {
                if let Some(wrong) = destinations
                    .iter()
                    .find(|d| host_of(**d) != self.local_host_id)
                {
                    listener.fatal(format!(
                        "Host {} received a message from host {} addressed to {}",
                        self.local_host_id,
                        self.host_id,
                        hsid_to_string(*wrong)
                    ));
                    return;
                }

                match self.factory.decode(source, payload) {
                    Ok(message) => listener.deliver(self.host_id, destinations, message),
                    Err(e) if e.is_fatal() => listener.fatal(format!(
                        "Undecodable message from host {}: {}",
                        self.host_id, e
                    )),
                    Err(e) => {
                        warn!(
                            "Dropping malformed message from {}: {}",
                            hsid_to_string(source),
                            e
                        );
                        metrics::counter!("hostmesh_messages_dropped_total", "reason" => "malformed")
                            .increment(1);
                    }
                }
            }
            Frame::PoisonPill { reason, cause, .. } => {
                listener.poison_pill(self.host_id, reason, cause);
            }
            Frame::StopNodeNotice { target_host, .. } => {
                let _ = self.events.send(HostEvent::StopNodeNotice {
                    from_host: self.host_id,
                    target_host,
                });
            }
        }
    }

    /// Called once per sub-connection when it stops. Only the first stop of an
    /// up host is reported.
    pub(crate) fn sub_connection_stopped(&self, index: usize) {
        debug!(
            host = self.host_id,
            index,
            peer = ?self.connections.get(index).and_then(|c| c.peer()),
            "Sub-connection stopped"
        );
        if self.is_up.swap(false, Ordering::AcqRel) {
            for conn in &self.connections {
                conn.close();
            }
            let _ = self.events.send(HostEvent::Stopped {
                host_id: self.host_id,
            });
        }
    }

    /// Close every sub-connection without reporting a failure. Idempotent.
    pub fn close(&self) {
        self.is_up.store(false, Ordering::Release);
        for conn in &self.connections {
            conn.close();
        }
    }

    /// Drop the sockets abruptly, as if the link had been cut. The resulting
    /// stop is reported like any other failure.
    pub fn kill_socket(&self) {
        for conn in &self.connections {
            conn.close();
        }
        self.sub_connection_stopped(0);
    }
}

impl fmt::Debug for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHost")
            .field("host_id", &self.host_id)
            .field("display_name", &self.info.host_display_name)
            .field("sub_connections", &self.connections.len())
            .field("is_up", &self.is_up())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostmesh_core::types::{hsid, AGREEMENT_SITE_ID, HEARTBEAT_SITE_ID};
    use hostmesh_messaging::PoisonCause;

    struct NullListener;

    impl HostListener for NullListener {
        fn deliver(&self, _from_host: HostId, _destinations: Vec<HsId>, _message: Message) {}

        fn poison_pill(&self, _from_host: HostId, _reason: String, _cause: PoisonCause) {}

        fn fatal(&self, _reason: String) {}
    }

    fn unconnected_host(timeout_ms: u64) -> (Arc<RemoteHost>, mpsc::UnboundedReceiver<HostEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let listener: Weak<dyn HostListener> = Weak::<NullListener>::new();
        let host = RemoteHost::new(
            0,
            HostInfo::new(1, "127.0.0.1", 3021, "node-1"),
            Vec::new(),
            Liveness {
                dead_host_timeout_ms: Arc::new(AtomicU64::new(timeout_ms)),
                warn_fraction: 0.5,
                warn_interval_ms: 60_000,
            },
            Arc::new(MessageFactory::default()),
            listener,
            events,
        );
        (host, rx)
    }

    #[test]
    fn test_dead_host_timeout_reported_once() {
        let (host, mut rx) = unconnected_host(10_000);
        host.check_liveness();
        assert!(rx.try_recv().is_err());

        // Shrink the timeout at runtime, as an operator would
        host.liveness.dead_host_timeout_ms.store(1, Ordering::Relaxed);
        std::thread::sleep(std::time::Duration::from_millis(10));
        for _ in 0..3 {
            host.check_liveness();
        }

        match rx.try_recv() {
            Ok(HostEvent::DeadHostTimeout { host_id, silent_ms }) => {
                assert_eq!(host_id, 1);
                assert!(silent_ms >= 1);
            }
            other => panic!("expected a dead host event, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_gap_warning_is_rate_limited() {
        let (host, mut rx) = unconnected_host(10_000);

        host.last_message_ms
            .store(now_millis() - 1_000, Ordering::Release);
        host.check_liveness();
        assert_eq!(host.last_warn_ms.load(Ordering::Acquire), 0);

        // Past half the timeout: one warning, then quiet for the interval
        host.last_message_ms
            .store(now_millis() - 6_000, Ordering::Release);
        host.check_liveness();
        let first = host.last_warn_ms.load(Ordering::Acquire);
        assert!(first > 0);
        host.check_liveness();
        host.check_liveness();
        assert_eq!(host.last_warn_ms.load(Ordering::Acquire), first);

        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_single_connection_always_zero() {
        let mut striping = Striping::default();
        for site in 0..10 {
            assert_eq!(striping.pick(hsid(1, site), 1), 0);
        }
        assert!(striping.assigned.is_empty());
    }

    #[test]
    fn test_destination_is_stable() {
        let mut striping = Striping::default();
        let first = striping.pick(hsid(1, 5), 3);
        for _ in 0..1000 {
            assert_eq!(striping.pick(hsid(1, 5), 3), first);
        }
    }

    #[test]
    fn test_round_robin_spread() {
        let mut striping = Striping::default();
        let picks: Vec<usize> = (0..6).map(|site| striping.pick(hsid(1, site), 3)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_reserved_sites_use_own_counter() {
        let mut striping = Striping::default();
        assert_eq!(striping.pick(hsid(1, 0), 2), 0);
        assert_eq!(striping.pick(hsid(1, 1), 2), 1);
        // Reserved counter starts fresh
        assert_eq!(striping.pick(hsid(1, AGREEMENT_SITE_ID), 2), 0);
        assert_eq!(striping.pick(hsid(1, HEARTBEAT_SITE_ID), 2), 1);
        assert_eq!(striping.pick(hsid(1, 2), 2), 0);
    }
}
