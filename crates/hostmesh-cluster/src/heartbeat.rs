//! Heartbeat endpoint and sender loop

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Weak;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use hostmesh_core::types::{hsid_to_string, HsId};
use hostmesh_messaging::{HeartbeatResponse, Mailbox, Message, MessageRouter, Payload};

use crate::messenger::HostMessenger;

/// Mailbox bound to the reserved heartbeat site of the local host. It
/// answers every heartbeat with a response carrying the received txn id.
pub(crate) struct HeartbeatMailbox {
    hsid: AtomicI64,
    router: Weak<dyn MessageRouter>,
}

impl HeartbeatMailbox {
    pub(crate) fn new(router: Weak<dyn MessageRouter>, hsid: HsId) -> Self {
        Self {
            hsid: AtomicI64::new(hsid),
            router,
        }
    }

    fn handle(&self, message: Message) {
        match message.payload() {
            Payload::Heartbeat(heartbeat) => {
                let Some(router) = self.router.upgrade() else {
                    return;
                };
                let mut reply = Message::new(HeartbeatResponse::new(heartbeat.txn_id, false));
                reply.set_source(self.hsid());
                router.send(message.source(), reply);
            }
            Payload::HeartbeatResponse(response) => {
                trace!(
                    "Heartbeat {} acknowledged by {}",
                    response.last_received_txn_id,
                    hsid_to_string(message.source())
                );
            }
            other => debug!(
                "Heartbeat site ignoring {} message from {}",
                other.kind(),
                hsid_to_string(message.source())
            ),
        }
    }
}

impl Mailbox for HeartbeatMailbox {
    fn hsid(&self) -> HsId {
        self.hsid.load(Ordering::Acquire)
    }

    fn set_hsid(&self, hsid: HsId) {
        self.hsid.store(hsid, Ordering::Release);
    }

    fn deliver(&self, message: Message) {
        self.handle(message);
    }

    fn deliver_front(&self, message: Message) {
        self.handle(message);
    }
}

/// Send heartbeats every `interval` until cancelled or the messenger is gone.
/// Each tick also expires stashed sub-connections of hosts that never joined.
pub(crate) async fn run_heartbeats(
    messenger: Weak<HostMessenger>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sequence: i64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(messenger) = messenger.upgrade() else {
                    break;
                };
                sequence += 1;
                messenger.send_heartbeats(sequence);
                messenger.purge_expired_connections();
            }
        }
    }
    debug!("Heartbeat loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostmesh_core::types::{hsid, HEARTBEAT_SITE_ID};
    use hostmesh_messaging::Heartbeat;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct RecordingRouter {
        sent: Mutex<Vec<(HsId, Message)>>,
    }

    impl MessageRouter for RecordingRouter {
        fn send(&self, destination: HsId, message: Message) {
            self.sent.lock().push((destination, message));
        }

        fn send_many(&self, destinations: &[HsId], message: Message) {
            for destination in destinations {
                self.send(*destination, message.clone());
            }
        }
    }

    #[test]
    fn test_heartbeat_is_answered() {
        let router = Arc::new(RecordingRouter::default());
        let weak: Weak<dyn MessageRouter> = Arc::downgrade(&router) as Weak<dyn MessageRouter>;
        let own = hsid(0, HEARTBEAT_SITE_ID);
        let mailbox = HeartbeatMailbox::new(weak, own);

        let peer = hsid(1, HEARTBEAT_SITE_ID);
        let mut heartbeat = Message::new(Heartbeat::new(7, 6));
        heartbeat.set_source(peer);
        mailbox.deliver(heartbeat);

        let sent = router.sent.lock();
        assert_eq!(sent.len(), 1);
        let (destination, reply) = &sent[0];
        assert_eq!(*destination, peer);
        assert_eq!(reply.source(), own);
        match reply.payload() {
            Payload::HeartbeatResponse(response) => {
                assert_eq!(response.last_received_txn_id, 7);
                assert!(!response.blocked);
            }
            other => panic!("unexpected reply {}", other.kind()),
        }
    }

    #[test]
    fn test_responses_are_not_answered() {
        let router = Arc::new(RecordingRouter::default());
        let weak: Weak<dyn MessageRouter> = Arc::downgrade(&router) as Weak<dyn MessageRouter>;
        let mailbox = HeartbeatMailbox::new(weak, hsid(0, HEARTBEAT_SITE_ID));

        let mut response = Message::new(HeartbeatResponse::new(3, false));
        response.set_source(hsid(1, HEARTBEAT_SITE_ID));
        mailbox.deliver(response);

        assert!(router.sent.lock().is_empty());
    }
}
