//! Mailboxes
//!
//! A mailbox is an addressable queue bound to one HSId. Delivery may happen
//! from any connection task; receive is used by one consumer at a time.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Weak;
use std::time::{Duration, Instant};

use hostmesh_core::types::{hsid_to_string, HsId};
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::message::{Message, Payload, UnknownSite};
use crate::{MailboxError, Subject};

/// Routes outbound messages to local mailboxes or remote hosts
pub trait MessageRouter: Send + Sync {
    fn send(&self, destination: HsId, message: Message);

    fn send_many(&self, destinations: &[HsId], message: Message);
}

/// Endpoint the membership manager delivers into
pub trait Mailbox: Send + Sync {
    fn hsid(&self) -> HsId;

    /// Bind the mailbox to an HSId chosen at registration
    fn set_hsid(&self, hsid: HsId);

    /// Enqueue at the tail of the message's subject queue
    fn deliver(&self, message: Message);

    /// Enqueue at the head of the message's subject queue
    fn deliver_front(&self, message: Message);

    /// Release blocked receivers; called on shutdown
    fn close(&self) {}
}

struct Queues {
    by_subject: [VecDeque<Message>; Subject::COUNT],
    closed: bool,
}

impl Queues {
    fn pop(&mut self, subjects: &[Subject]) -> Option<Message> {
        if subjects.is_empty() {
            return self.by_subject[Subject::Default.index()].pop_front();
        }
        subjects
            .iter()
            .find_map(|s| self.by_subject[s.index()].pop_front())
    }

    fn len(&self) -> usize {
        self.by_subject.iter().map(VecDeque::len).sum()
    }
}

/// Standard mailbox with one FIFO queue per subject.
///
/// Receive calls take a list of subjects and drain them in the order given,
/// so the first listed subject is always emptied before the next is checked.
/// An empty list means [`Subject::Default`] only.
pub struct SiteMailbox {
    hsid: AtomicI64,
    router: Weak<dyn MessageRouter>,
    queues: Mutex<Queues>,
    available: Condvar,
    notify: Notify,
}

impl SiteMailbox {
    pub fn new(router: Weak<dyn MessageRouter>, hsid: HsId) -> Self {
        Self {
            hsid: AtomicI64::new(hsid),
            router,
            queues: Mutex::new(Queues {
                by_subject: Default::default(),
                closed: false,
            }),
            available: Condvar::new(),
            notify: Notify::new(),
        }
    }

    /// Send to one destination, stamping this mailbox as the source
    pub fn send(&self, destination: HsId, mut message: Message) {
        message.set_source(self.hsid());
        match self.router.upgrade() {
            Some(router) => router.send(destination, message),
            None => debug!(
                mailbox = %hsid_to_string(self.hsid()),
                "Router gone, dropping message to {}",
                hsid_to_string(destination)
            ),
        }
    }

    /// Send to several destinations, stamping this mailbox as the source
    pub fn send_many(&self, destinations: &[HsId], mut message: Message) {
        message.set_source(self.hsid());
        match self.router.upgrade() {
            Some(router) => router.send_many(destinations, message),
            None => debug!(
                mailbox = %hsid_to_string(self.hsid()),
                "Router gone, dropping message to {} destinations",
                destinations.len()
            ),
        }
    }

    /// Non-blocking receive
    pub fn recv(&self, subjects: &[Subject]) -> Option<Message> {
        self.queues.lock().pop(subjects)
    }

    /// Block the calling thread until a message arrives or the mailbox closes
    pub fn recv_blocking(&self, subjects: &[Subject]) -> Result<Message, MailboxError> {
        let mut queues = self.queues.lock();
        loop {
            if let Some(message) = queues.pop(subjects) {
                return Ok(message);
            }
            if queues.closed {
                return Err(MailboxError::Closed);
            }
            self.available.wait(&mut queues);
        }
    }

    /// Like [`recv_blocking`](Self::recv_blocking) with an upper bound on
    /// waiting. `Ok(None)` means the timeout elapsed.
    pub fn recv_blocking_timeout(
        &self,
        subjects: &[Subject],
        timeout: Duration,
    ) -> Result<Option<Message>, MailboxError> {
        let deadline = Instant::now() + timeout;
        let mut queues = self.queues.lock();
        loop {
            if let Some(message) = queues.pop(subjects) {
                return Ok(Some(message));
            }
            if queues.closed {
                return Err(MailboxError::Closed);
            }
            if self.available.wait_until(&mut queues, deadline).timed_out() {
                return Ok(queues.pop(subjects));
            }
        }
    }

    /// Async receive for consumers running on the runtime
    pub async fn recv_async(&self, subjects: &[Subject]) -> Result<Message, MailboxError> {
        loop {
            {
                let mut queues = self.queues.lock();
                if let Some(message) = queues.pop(subjects) {
                    return Ok(message);
                }
                if queues.closed {
                    return Err(MailboxError::Closed);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Messages queued across all subjects
    pub fn pending(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.queues.lock().closed
    }

    fn enqueue(&self, message: Message, front: bool) {
        {
            let mut queues = self.queues.lock();
            let queue = &mut queues.by_subject[message.subject().index()];
            if front {
                queue.push_front(message);
            } else {
                queue.push_back(message);
            }
        }
        self.available.notify_one();
        self.notify.notify_one();
    }
}

impl Mailbox for SiteMailbox {
    fn hsid(&self) -> HsId {
        self.hsid.load(Ordering::Acquire)
    }

    fn set_hsid(&self, hsid: HsId) {
        self.hsid.store(hsid, Ordering::Release);
    }

    fn deliver(&self, message: Message) {
        self.enqueue(message, false);
    }

    fn deliver_front(&self, message: Message) {
        self.enqueue(message, true);
    }

    fn close(&self) {
        self.queues.lock().closed = true;
        self.available.notify_all();
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

impl fmt::Debug for SiteMailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiteMailbox")
            .field("hsid", &hsid_to_string(self.hsid()))
            .field("pending", &self.pending())
            .finish()
    }
}

/// Placeholder bound to an HSId that has no real mailbox yet, or whose
/// mailbox was removed. It never queues anything.
pub struct UnknownSiteMailbox {
    hsid: AtomicI64,
    router: Weak<dyn MessageRouter>,
    reply: bool,
}

impl UnknownSiteMailbox {
    /// With `reply` set, senders receive an [`UnknownSite`] bounce;
    /// otherwise messages are dropped silently
    pub fn new(router: Weak<dyn MessageRouter>, hsid: HsId, reply: bool) -> Self {
        Self {
            hsid: AtomicI64::new(hsid),
            router,
            reply,
        }
    }

    fn bounce(&self, message: Message) {
        metrics::counter!("hostmesh_messages_dropped_total", "reason" => "unknown_site")
            .increment(1);

        let own = self.hsid();
        let source = message.source();

        // Never answer a bounce, our own traffic or an unsent message
        let answerable = self.reply
            && source != own
            && source != crate::message::NO_SOURCE
            && !matches!(message.payload(), Payload::UnknownSite(_));
        if !answerable {
            trace!(
                site = %hsid_to_string(own),
                "Dropping message from {} for unknown site",
                hsid_to_string(source)
            );
            return;
        }

        let Some(original_type) = message.type_tag() else {
            return;
        };
        let Some(router) = self.router.upgrade() else {
            return;
        };

        let mut reply = Message::new(UnknownSite {
            original_type,
            original_subject: message.subject().id(),
        });
        reply.set_source(own);
        router.send(source, reply);
    }
}

impl Mailbox for UnknownSiteMailbox {
    fn hsid(&self) -> HsId {
        self.hsid.load(Ordering::Acquire)
    }

    fn set_hsid(&self, hsid: HsId) {
        self.hsid.store(hsid, Ordering::Release);
    }

    fn deliver(&self, message: Message) {
        self.bounce(message);
    }

    fn deliver_front(&self, message: Message) {
        self.bounce(message);
    }
}

impl fmt::Debug for UnknownSiteMailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnknownSiteMailbox")
            .field("hsid", &hsid_to_string(self.hsid()))
            .field("reply", &self.reply)
            .finish()
    }
}
