//! GATT notification routing.
//!
//! Per connection there is at most one live channel per
//! (service, characteristic) key. The first consumer triggers the
//! transport subscribe; further consumers share the channel and bytes
//! fan out to all of them in arrival order. The transport unsubscribe
//! is issued only when the last logical consumer detaches.
//!
//! A failed transport subscribe *completes* the channel instead of
//! erroring it: "no data will ever arrive" releases waiting consumers
//! cleanly without surfacing a hard failure.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use futures_lite::future;
use log::{debug, warn};

use crate::bridge::{BluetoothBridge, CharId};
use crate::connect::Connection;

/// Frames buffered per consumer. The channel holds no history beyond
/// what a consumer has not yet drained; overflow drops with a warning.
const CONSUMER_DEPTH: usize = 16;

// ── Channel core ──────────────────────────────────────────────

/// Shared state of one notification channel.
pub(crate) struct ChannelCore {
    key: CharId,
    consumers: Cell<usize>,
    queues: RefCell<Vec<Rc<ConsumerQueue>>>,
    closed: Cell<bool>,
}

struct ConsumerQueue {
    inbox: Channel<NoopRawMutex, Vec<u8>, CONSUMER_DEPTH>,
    closed_wake: Signal<NoopRawMutex, ()>,
}

impl ChannelCore {
    pub(crate) fn new(key: CharId) -> Rc<Self> {
        Rc::new(Self {
            key,
            consumers: Cell::new(0),
            queues: RefCell::new(Vec::new()),
            closed: Cell::new(false),
        })
    }

    pub(crate) fn attach(self: &Rc<Self>) -> NotificationStream {
        let queue = Rc::new(ConsumerQueue {
            inbox: Channel::new(),
            closed_wake: Signal::new(),
        });
        self.queues.borrow_mut().push(queue.clone());
        self.consumers.set(self.consumers.get() + 1);
        NotificationStream {
            core: self.clone(),
            queue,
        }
    }

    /// Detach one logical consumer; returns how many remain.
    pub(crate) fn detach(&self) -> usize {
        let remaining = self.consumers.get().saturating_sub(1);
        self.consumers.set(remaining);
        remaining
    }

    pub(crate) fn consumer_count(&self) -> usize {
        self.consumers.get()
    }

    /// Fan one frame out to every consumer, in arrival order.
    pub(crate) fn deliver(&self, data: &[u8]) {
        if self.closed.get() {
            return;
        }
        for queue in self.queues.borrow().iter() {
            if queue.inbox.try_send(data.to_vec()).is_err() {
                warn!("notification queue full for {}, dropping frame", self.key);
            }
        }
    }

    /// Complete the channel: consumers drain what is buffered, then
    /// see end-of-stream.
    pub(crate) fn complete(&self) {
        if self.closed.replace(true) {
            return;
        }
        for queue in self.queues.borrow().iter() {
            queue.closed_wake.signal(());
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

// ── Consumer stream ───────────────────────────────────────────

/// One logical consumer of a notification channel.
///
/// Dropping the stream does not detach the consumer; call
/// [`NotificationRouter::stop`] so the transport unsubscribe can be
/// issued once the count reaches zero.
pub struct NotificationStream {
    core: Rc<ChannelCore>,
    queue: Rc<ConsumerQueue>,
}

impl NotificationStream {
    /// Next notification frame, or `None` once the channel completed.
    /// Frames delivered before completion are drained first.
    pub async fn next(&self) -> Option<Vec<u8>> {
        loop {
            if let Ok(frame) = self.queue.inbox.try_receive() {
                return Some(frame);
            }
            if self.core.closed.get() {
                return None;
            }
            let data = async { Some(self.queue.inbox.receive().await) };
            let closed = async {
                self.queue.closed_wake.wait().await;
                None
            };
            match future::or(data, closed).await {
                Some(frame) => return Some(frame),
                // Woken by completion: loop to drain leftovers first.
                None => {}
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────

/// Maps (connection, service, characteristic) to its single channel
/// and owns the transport subscribe/unsubscribe calls.
pub struct NotificationRouter<B> {
    bridge: Rc<B>,
}

impl<B: BluetoothBridge> NotificationRouter<B> {
    pub fn new(bridge: Rc<B>) -> Self {
        Self { bridge }
    }

    /// Attach a consumer to the channel for `key`, creating it (and
    /// issuing the transport subscribe) on first use. Idempotent:
    /// repeated calls share one channel and one subscribe call.
    pub async fn start(&self, conn: &Connection, key: CharId) -> NotificationStream {
        if !conn.is_connected() {
            let core = ChannelCore::new(key);
            let stream = core.attach();
            core.complete();
            return stream;
        }
        if let Some(core) = conn.channel_core(&key) {
            return core.attach();
        }

        let core = ChannelCore::new(key);
        // Insert before the subscribe call resolves so a concurrent
        // start for the same key attaches instead of re-subscribing.
        conn.insert_channel(key, core.clone());
        let stream = core.attach();
        if let Err(e) = self.bridge.subscribe(conn.handle(), &key).await {
            warn!("subscribe {} failed ({e}), completing channel", key);
            conn.remove_channel(&key);
            core.complete();
        }
        stream
    }

    /// Detach one logical consumer. The transport unsubscribe happens
    /// only when this was the last one.
    pub async fn stop(&self, conn: &Connection, key: CharId) {
        let Some(core) = conn.channel_core(&key) else {
            return;
        };
        if core.detach() > 0 {
            return;
        }
        conn.remove_channel(&key);
        core.complete();
        if conn.is_connected() {
            if let Err(e) = self.bridge.unsubscribe(conn.handle(), &key).await {
                warn!("unsubscribe {key} failed: {e}");
            }
        }
    }

    /// Deliver a transport notification. Returns `false` if no channel
    /// matches the key (a leaked subscription to clean up).
    pub(crate) fn deliver(&self, conn: &Connection, key: CharId, data: &[u8]) -> bool {
        match conn.channel_core(&key) {
            Some(core) => {
                core.deliver(data);
                true
            }
            None => {
                debug!("no channel for {} on {}", key, conn.id());
                false
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
