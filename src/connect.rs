//! Connection lifecycle.
//!
//! One table serializes connection identity: at most one live or
//! pending connection per peripheral address, process-wide. Concurrent
//! `connect` calls for the same address observe the same in-flight
//! attempt (a shared future), so the transport never sees duplicate
//! connect calls.
//!
//! Some transports report "could not connect" by resolving the connect
//! call with a sentinel handle instead of an error. The attempt loop
//! polls for that sentinel and retries at a fixed interval until the
//! failure ceiling elapses. The ceiling is evaluated against the
//! injected clock on every tick, so an attempt whose callers all went
//! away is simply re-driven by the next waiter rather than wedging.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use futures::FutureExt;
use futures::future::{LocalBoxFuture, Shared};
use log::{debug, info, warn};

use crate::bridge::{BluetoothBridge, CharId, ConnHandle, HANDLE_NONE};
use crate::clock::Clock;
use crate::config::ConnectTuning;
use crate::error::{Error, Result};
use crate::notify::ChannelCore;

// ── Connection ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connected,
    Disconnected,
}

/// A live link to one peripheral. Cheap to clone; all clones observe
/// the same state and the same notification channels.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<ConnInner>,
}

struct ConnInner {
    id: String,
    handle: ConnHandle,
    mtu: u16,
    state: Cell<ConnState>,
    channels: RefCell<HashMap<CharId, Rc<ChannelCore>>>,
}

impl Connection {
    fn new(id: String, handle: ConnHandle, mtu: u16) -> Self {
        Self {
            inner: Rc::new(ConnInner {
                id,
                handle,
                mtu,
                state: Cell::new(ConnState::Connected),
                channels: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Peripheral address this connection is keyed by.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Transport-level handle (fd/token).
    pub fn handle(&self) -> ConnHandle {
        self.inner.handle
    }

    /// Negotiated MTU.
    pub fn mtu(&self) -> u16 {
        self.inner.mtu
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.get() == ConnState::Connected
    }

    pub(crate) fn channel_core(&self, key: &CharId) -> Option<Rc<ChannelCore>> {
        self.inner.channels.borrow().get(key).cloned()
    }

    pub(crate) fn insert_channel(&self, key: CharId, core: Rc<ChannelCore>) {
        self.inner.channels.borrow_mut().insert(key, core);
    }

    pub(crate) fn remove_channel(&self, key: &CharId) {
        self.inner.channels.borrow_mut().remove(key);
    }

    /// Mark the connection dead and complete every notification
    /// channel it owns. Dependent requests observe end-of-stream and
    /// fail with `Disconnected` instead of pending forever.
    pub(crate) fn teardown(&self) {
        self.inner.state.set(ConnState::Disconnected);
        let cores: Vec<Rc<ChannelCore>> = {
            let mut channels = self.inner.channels.borrow_mut();
            channels.drain().map(|(_, core)| core).collect()
        };
        for core in cores {
            core.complete();
        }
    }
}

// ── Manager ───────────────────────────────────────────────────

type ConnectFuture = Shared<LocalBoxFuture<'static, Result<Connection>>>;

enum Slot {
    Pending {
        fut: ConnectFuture,
        abort: Rc<Cell<bool>>,
    },
    Live(Connection),
}

struct Tables {
    by_id: HashMap<String, Slot>,
    by_handle: HashMap<ConnHandle, String>,
}

/// Maps peripheral addresses to at most one live/pending connection.
pub struct ConnectionManager<B, C> {
    bridge: Rc<B>,
    clock: Rc<C>,
    tuning: ConnectTuning,
    tables: Rc<RefCell<Tables>>,
}

impl<B: BluetoothBridge + 'static, C: Clock + 'static> ConnectionManager<B, C> {
    pub fn new(bridge: Rc<B>, clock: Rc<C>, tuning: ConnectTuning) -> Self {
        Self {
            bridge,
            clock,
            tuning,
            tables: Rc::new(RefCell::new(Tables {
                by_id: HashMap::new(),
                by_handle: HashMap::new(),
            })),
        }
    }

    /// Connect to `address`, or return the existing live connection,
    /// or join the in-flight attempt.
    pub async fn connect(&self, address: &str) -> Result<Connection> {
        let fut = {
            let mut t = self.tables.borrow_mut();
            match t.by_id.get(address) {
                Some(Slot::Live(conn)) if conn.is_connected() => return Ok(conn.clone()),
                Some(Slot::Pending { fut, .. }) => fut.clone(),
                _ => {
                    let abort = Rc::new(Cell::new(false));
                    let fut = attempt(
                        self.bridge.clone(),
                        self.clock.clone(),
                        self.tables.clone(),
                        address.to_string(),
                        self.tuning.clone(),
                        abort.clone(),
                    )
                    .boxed_local()
                    .shared();
                    t.by_id.insert(
                        address.to_string(),
                        Slot::Pending {
                            fut: fut.clone(),
                            abort,
                        },
                    );
                    fut
                }
            }
        };
        fut.await
    }

    /// Disconnect by address. Idempotent: no matching connection is a
    /// no-op success.
    pub async fn disconnect(&self, address: &str) {
        let removed = {
            let mut t = self.tables.borrow_mut();
            match t.by_id.get(address) {
                Some(Slot::Pending { abort, .. }) => {
                    // The attempt observes the flag on its next tick
                    // and removes its own entry.
                    abort.set(true);
                    None
                }
                Some(Slot::Live(_)) => match t.by_id.remove(address) {
                    Some(Slot::Live(conn)) => {
                        t.by_handle.remove(&conn.handle());
                        Some(conn)
                    }
                    _ => None,
                },
                None => None,
            }
        };
        if let Some(conn) = removed {
            conn.teardown();
            if let Err(e) = self.bridge.disconnect(conn.handle()).await {
                warn!("disconnect {} reported {e}", conn.id());
            }
        }
    }

    /// Disconnect by transport handle. Idempotent.
    pub async fn disconnect_handle(&self, handle: ConnHandle) {
        let id = self.tables.borrow().by_handle.get(&handle).cloned();
        if let Some(id) = id {
            self.disconnect(&id).await;
        }
    }

    /// Live connection for `address`, if any.
    pub fn connection(&self, address: &str) -> Option<Connection> {
        match self.tables.borrow().by_id.get(address) {
            Some(Slot::Live(conn)) if conn.is_connected() => Some(conn.clone()),
            _ => None,
        }
    }

    pub(crate) fn connection_by_handle(&self, handle: ConnHandle) -> Option<Connection> {
        let t = self.tables.borrow();
        let id = t.by_handle.get(&handle)?;
        match t.by_id.get(id) {
            Some(Slot::Live(conn)) => Some(conn.clone()),
            _ => None,
        }
    }

    /// Transport reported a disconnect. Tear the connection and every
    /// dependent channel down synchronously, then drop both indexes.
    pub(crate) fn handle_transport_disconnect(&self, handle: ConnHandle) {
        let conn = {
            let mut t = self.tables.borrow_mut();
            match t.by_handle.remove(&handle) {
                Some(id) => match t.by_id.remove(&id) {
                    Some(Slot::Live(conn)) => Some(conn),
                    Some(pending) => {
                        // A fresh attempt for the same id is unrelated
                        // to the dead handle; put it back.
                        t.by_id.insert(id, pending);
                        None
                    }
                    None => None,
                },
                None => {
                    debug!("disconnect event for unknown handle {handle}");
                    None
                }
            }
        };
        if let Some(conn) = conn {
            info!("connection {} (handle {handle}) closed by transport", conn.id());
            conn.teardown();
        }
    }
}

// ── Attempt loop ──────────────────────────────────────────────

async fn attempt<B: BluetoothBridge + 'static, C: Clock + 'static>(
    bridge: Rc<B>,
    clock: Rc<C>,
    tables: Rc<RefCell<Tables>>,
    address: String,
    tuning: ConnectTuning,
    abort: Rc<Cell<bool>>,
) -> Result<Connection> {
    let started = clock.now();
    let outcome = loop {
        if abort.get() {
            break Err(Error::Aborted);
        }
        if clock.now().saturating_sub(started) >= tuning.failure_ceiling() {
            break Err(Error::ConnectTimeout);
        }
        match bridge.connect(&address).await {
            Err(e) => break Err(Error::TransportUnavailable(e.to_string())),
            Ok(reply) if reply.handle == HANDLE_NONE => {
                debug!("connect {address} returned sentinel, retrying");
                clock.sleep(tuning.retry_interval()).await;
            }
            Ok(reply) => {
                if abort.get() {
                    // Caller disconnected mid-flight; give the handle back.
                    let _ = bridge.disconnect(reply.handle).await;
                    break Err(Error::Aborted);
                }
                break Ok(reply);
            }
        }
    };

    let mut t = tables.borrow_mut();
    match outcome {
        Ok(reply) => {
            let conn = Connection::new(address.clone(), reply.handle, reply.mtu);
            t.by_id.insert(address.clone(), Slot::Live(conn.clone()));
            t.by_handle.insert(reply.handle, address.clone());
            info!(
                "connected {address} (handle {}, mtu {})",
                reply.handle, reply.mtu
            );
            Ok(conn)
        }
        Err(e) => {
            // Remove only our own pending entry; a newer attempt may
            // already occupy the slot.
            let ours = matches!(
                t.by_id.get(&address),
                Some(Slot::Pending { abort: current, .. }) if Rc::ptr_eq(current, &abort)
            );
            if ours {
                t.by_id.remove(&address);
            }
            warn!("connect {address} failed: {e}");
            Err(e)
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
