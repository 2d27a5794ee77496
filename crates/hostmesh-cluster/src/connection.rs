//! Sub-connections
//!
//! Every sub-connection is one TCP stream driven by two tasks: a reader that
//! decodes frames and hands them to the owning [`RemoteHost`], and a writer
//! that drains an unbounded send queue in batches. Callers never block on the
//! socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use hostmesh_core::types::{HostId, HsId};
use hostmesh_messaging::{Frame, FrameCodec, Message, PoisonCause, WireError};

use crate::remote_host::RemoteHost;

/// Lifecycle events sent from connections to the membership manager's
/// serialized event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HostEvent {
    /// The first sub-connection of a host stopped
    Stopped { host_id: HostId },
    /// A host stayed silent past the dead host timeout
    DeadHostTimeout { host_id: HostId, silent_ms: i64 },
    /// `from_host` announced that `target_host` will stop soon
    StopNodeNotice {
        from_host: HostId,
        target_host: HostId,
    },
}

/// Synchronous callbacks invoked from connection reader tasks
pub(crate) trait HostListener: Send + Sync {
    /// Messages for local mailboxes
    fn deliver(&self, from_host: HostId, destinations: Vec<HsId>, message: Message);

    fn poison_pill(&self, from_host: HostId, reason: String, cause: PoisonCause);

    /// A protocol integrity violation that must end the process
    fn fatal(&self, reason: String);
}

struct Unstarted {
    stream: TcpStream,
    rx: mpsc::UnboundedReceiver<Frame>,
}

pub(crate) struct SubConnection {
    index: usize,
    peer: Option<SocketAddr>,
    tx: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
    stopping: AtomicBool,
    unstarted: Mutex<Option<Unstarted>>,
}

impl SubConnection {
    pub(crate) fn new(index: usize, stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let peer = stream.peer_addr().ok();
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            index,
            peer,
            tx,
            cancel: CancellationToken::new(),
            stopping: AtomicBool::new(false),
            unstarted: Mutex::new(Some(Unstarted { stream, rx })),
        }
    }

    pub(crate) fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Spawn the reader and writer tasks. Later calls do nothing.
    pub(crate) fn start(self: &Arc<Self>, codec: FrameCodec, host: Weak<RemoteHost>) {
        let Some(Unstarted { stream, rx }) = self.unstarted.lock().take() else {
            return;
        };
        let (read_half, write_half) = stream.into_split();

        tokio::spawn(read_loop(
            Arc::clone(self),
            read_half,
            codec.clone(),
            host.clone(),
        ));
        tokio::spawn(write_loop(Arc::clone(self), write_half, codec, rx, host));
    }

    /// Queue a frame for the writer task
    pub(crate) fn send(&self, frame: Frame) {
        if self.tx.send(frame).is_err() {
            debug!(
                index = self.index,
                "Sub-connection writer gone, dropping frame"
            );
        }
    }

    /// Stop both tasks; the socket closes once they exit
    pub(crate) fn close(&self) {
        self.cancel.cancel();
        // Never started: dropping the stream closes it
        self.unstarted.lock().take();
    }

    /// True only for the first caller
    fn mark_stopping(&self) -> bool {
        !self.stopping.swap(true, Ordering::AcqRel)
    }

    fn stopped(&self, host: &Weak<RemoteHost>) {
        self.cancel.cancel();
        if self.mark_stopping() {
            if let Some(host) = host.upgrade() {
                host.sub_connection_stopped(self.index);
            }
        }
    }
}

async fn read_loop(
    conn: Arc<SubConnection>,
    read_half: OwnedReadHalf,
    codec: FrameCodec,
    host: Weak<RemoteHost>,
) {
    let mut reader = FramedRead::new(read_half, codec);
    loop {
        let next = tokio::select! {
            _ = conn.cancel.cancelled() => break,
            next = reader.next() => next,
        };

        match next {
            Some(Ok(frame)) => match host.upgrade() {
                Some(host) => host.handle_frame(frame),
                None => break,
            },
            Some(Err(e)) => {
                warn!(index = conn.index, peer = ?conn.peer, "Closing sub-connection after read error: {}", e);
                break;
            }
            None => {
                debug!(index = conn.index, peer = ?conn.peer, "Sub-connection closed by peer");
                break;
            }
        }
    }
    conn.stopped(&host);
}

async fn write_loop(
    conn: Arc<SubConnection>,
    write_half: OwnedWriteHalf,
    codec: FrameCodec,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    host: Weak<RemoteHost>,
) {
    let mut writer = FramedWrite::new(write_half, codec);

    let result: Result<(), WireError> = async {
        loop {
            let frame = tokio::select! {
                _ = conn.cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            writer.feed(frame).await?;
            while let Ok(frame) = rx.try_recv() {
                writer.feed(frame).await?;
            }
            writer.flush().await?;
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        warn!(index = conn.index, peer = ?conn.peer, "Closing sub-connection after write error: {}", e);
    }
    conn.stopped(&host);
}
