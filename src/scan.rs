//! Scan coordination.
//!
//! One native scan session serves every logical subscriber. The OS
//! kills a scan after a finite lifetime without telling anyone, so the
//! coordinator restarts it on a cadence:
//!
//! ```text
//! Idle ─▶ Starting ─▶ Running ─(expiry)─▶ Restarting ─▶ Running ─▶ …
//!   ▲                    │
//!   └──(grace elapsed)───┘
//! ```
//!
//! - Active mode: fixed window, short fixed pause between restarts.
//! - Opportunistic mode: longer window plus a random jitter on every
//!   cycle and on every discovery, to stay off the cadence of
//!   periodically advertising peripherals.
//!
//! When the last subscriber detaches the native scan is NOT stopped
//! immediately; a grace window runs first so UI views that unmount and
//! remount in quick succession do not thrash the radio.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use futures_lite::future;
use log::{debug, info, warn};

use crate::advert::{self, DeviceRegistry, Peripheral};
use crate::bridge::{Advertisement, BluetoothBridge};
use crate::clock::Clock;
use crate::config::ScanTuning;
use crate::error::{Error, Result};

/// Discoveries buffered per subscriber before overflow drops.
const SUB_DEPTH: usize = 16;

/// Scan intensity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Continuous discovery at full duty cycle.
    Active,
    /// Power-saving background discovery.
    Opportunistic,
}

enum ScanFrame {
    Discovered(Peripheral),
    Failed(Error),
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowOutcome {
    /// The native scan window ran out; restart.
    Expired,
    /// Zero subscribers for a full grace window (or an explicit stop);
    /// release native resources.
    Release,
}

// ── Shared state ──────────────────────────────────────────────

struct SubSlot {
    mode: ScanMode,
    inbox: Channel<NoopRawMutex, ScanFrame, SUB_DEPTH>,
}

struct ScanShared {
    subs: RefCell<Vec<Rc<SubSlot>>>,
    wake: Signal<NoopRawMutex, ()>,
    /// When the subscriber count hit zero (stamped by the run loop).
    idle_since: Cell<Option<Duration>>,
    force_stop: Cell<bool>,
    /// Opportunistic extension accumulated from discovery jitter.
    cycle_extend: Cell<Duration>,
    restarts: Cell<u32>,
}

// ── Subscription handle ───────────────────────────────────────

/// One logical scan subscription. Dropping it detaches; the native
/// scan outlives it by the grace window.
pub struct ScanSubscription {
    shared: Rc<ScanShared>,
    slot: Rc<SubSlot>,
    done: Cell<bool>,
}

impl ScanSubscription {
    /// Next discovery. `Some(Err(..))` is terminal (start-scan was
    /// rejected); `None` means the subscription ended.
    pub async fn next(&self) -> Option<Result<Peripheral>> {
        if self.done.get() {
            return None;
        }
        match self.slot.inbox.receive().await {
            ScanFrame::Discovered(p) => Some(Ok(p)),
            ScanFrame::Failed(e) => {
                self.done.set(true);
                Some(Err(e))
            }
            ScanFrame::Ended => {
                self.done.set(true);
                None
            }
        }
    }

    /// Non-blocking variant of [`next`](Self::next); `None` when
    /// nothing is queued.
    pub fn try_next(&self) -> Option<Result<Peripheral>> {
        if self.done.get() {
            return None;
        }
        match self.slot.inbox.try_receive() {
            Ok(ScanFrame::Discovered(p)) => Some(Ok(p)),
            Ok(ScanFrame::Failed(e)) => {
                self.done.set(true);
                Some(Err(e))
            }
            Ok(ScanFrame::Ended) => {
                self.done.set(true);
                None
            }
            Err(_) => None,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.done.get()
    }
}

impl Drop for ScanSubscription {
    fn drop(&mut self) {
        let mut subs = self.shared.subs.borrow_mut();
        let before = subs.len();
        subs.retain(|s| !Rc::ptr_eq(s, &self.slot));
        if subs.len() != before {
            drop(subs);
            self.shared.wake.signal(());
        }
    }
}

// ── Coordinator ───────────────────────────────────────────────

/// Owns the single underlying scan session and multiplexes logical
/// subscribers onto it.
pub struct ScanCoordinator<B, C> {
    bridge: Rc<B>,
    clock: Rc<C>,
    tuning: ScanTuning,
    registry: DeviceRegistry,
    shared: Rc<ScanShared>,
}

impl<B: BluetoothBridge, C: Clock> ScanCoordinator<B, C> {
    pub fn new(bridge: Rc<B>, clock: Rc<C>, tuning: ScanTuning, registry: DeviceRegistry) -> Self {
        Self {
            bridge,
            clock,
            tuning,
            registry,
            shared: Rc::new(ScanShared {
                subs: RefCell::new(Vec::new()),
                wake: Signal::new(),
                idle_since: Cell::new(None),
                force_stop: Cell::new(false),
                cycle_extend: Cell::new(Duration::ZERO),
                restarts: Cell::new(0),
            }),
        }
    }

    /// Subscribe at full duty cycle.
    pub fn scan(&self) -> ScanSubscription {
        self.subscribe(ScanMode::Active)
    }

    /// Subscribe at background duty cycle.
    pub fn opportunistic_scan(&self) -> ScanSubscription {
        self.subscribe(ScanMode::Opportunistic)
    }

    fn subscribe(&self, mode: ScanMode) -> ScanSubscription {
        let slot = Rc::new(SubSlot {
            mode,
            inbox: Channel::new(),
        });
        let total = {
            let mut subs = self.shared.subs.borrow_mut();
            subs.push(slot.clone());
            subs.len()
        };
        self.shared.idle_since.set(None);
        // An explicit stop already ended every prior subscription; a
        // new one starts a fresh session, not a stopped one.
        self.shared.force_stop.set(false);
        self.shared.wake.signal(());
        info!("scan subscriber attached ({mode:?}), {total} total");
        ScanSubscription {
            shared: self.shared.clone(),
            slot,
            done: Cell::new(false),
        }
    }

    /// Explicit, unconditional stop: ends every subscription and
    /// releases the native scan without waiting for the grace window.
    pub fn stop_scan(&self) {
        let slots: Vec<Rc<SubSlot>> = self.shared.subs.borrow_mut().drain(..).collect();
        for slot in &slots {
            let _ = slot.inbox.try_send(ScanFrame::Ended);
        }
        self.shared.force_stop.set(true);
        self.shared.wake.signal(());
    }

    /// Restart cycles performed since construction.
    pub fn restart_count(&self) -> u32 {
        self.shared.restarts.get()
    }

    /// Drive the scan state machine. Spawn once alongside the event
    /// pump; never returns.
    pub async fn run(&self) {
        loop {
            while self.shared.subs.borrow().is_empty() {
                self.shared.force_stop.set(false);
                self.shared.wake.wait().await;
            }
            self.drive_session().await;
        }
    }

    // ── Discovery path (called from the event pump) ───────────

    pub(crate) fn handle_advertisement(&self, adv: &Advertisement) {
        let blocks = advert::parse_ad_blocks(&adv.data);
        let Some(manufacturer) = blocks.manufacturer_data() else {
            debug!("advertisement from {} has no manufacturer data", adv.address);
            return;
        };
        let Some(kind) = self.registry.classify(manufacturer) else {
            debug!(
                "unclassified advertisement from {} ({} blocks)",
                adv.address,
                blocks.len()
            );
            return;
        };
        let peripheral = Peripheral {
            address: adv.address.clone(),
            name: blocks.local_name().map(advert::truncate_name),
            kind,
            rssi: advert::normalize_rssi(adv.rssi),
            manufacturer: manufacturer.to_vec(),
        };
        debug!(
            "discovered {} {} (rssi {})",
            peripheral.kind, peripheral.address, peripheral.rssi
        );

        // Every discovery nudges the opportunistic cycle off the
        // advertiser's own period.
        if self.current_mode() == ScanMode::Opportunistic {
            let extra = self.clock.jitter(self.tuning.opportunistic_jitter_max());
            self.shared
                .cycle_extend
                .set(self.shared.cycle_extend.get() + extra);
            self.shared.wake.signal(());
        }

        for slot in self.shared.subs.borrow().iter() {
            if slot
                .inbox
                .try_send(ScanFrame::Discovered(peripheral.clone()))
                .is_err()
            {
                warn!(
                    "scan subscriber queue full, dropping discovery {}",
                    peripheral.address
                );
            }
        }
    }

    // ── Session driver ────────────────────────────────────────

    fn current_mode(&self) -> ScanMode {
        if self
            .shared
            .subs
            .borrow()
            .iter()
            .any(|s| s.mode == ScanMode::Active)
        {
            ScanMode::Active
        } else {
            ScanMode::Opportunistic
        }
    }

    async fn drive_session(&self) {
        loop {
            let mode = self.current_mode();
            let window = match mode {
                ScanMode::Active => self.tuning.active_window(),
                ScanMode::Opportunistic => {
                    self.tuning.opportunistic_window()
                        + self.clock.jitter(self.tuning.opportunistic_jitter_max())
                }
            };
            self.shared.cycle_extend.set(Duration::ZERO);

            let token = match self.bridge.start_scan(mode == ScanMode::Active, window).await {
                Ok(token) => token,
                Err(e) => {
                    warn!("start-scan rejected: {e}");
                    self.fail_all(Error::TransportUnavailable(e.to_string()));
                    return;
                }
            };
            debug!("native scan {token:?} started ({mode:?}, window {window:?})");

            let outcome = self.watch_window(self.clock.now() + window).await;

            if let Err(e) = self.bridge.stop_scan(token).await {
                warn!("stop-scan {token:?} reported {e}");
            }
            match outcome {
                WindowOutcome::Release => {
                    info!("scan released");
                    return;
                }
                WindowOutcome::Expired => {
                    self.shared.restarts.set(self.shared.restarts.get() + 1);
                    let pause = match mode {
                        ScanMode::Active => self.tuning.active_restart_pause(),
                        ScanMode::Opportunistic => {
                            self.clock.jitter(self.tuning.opportunistic_jitter_max())
                        }
                    };
                    self.shared.cycle_extend.set(Duration::ZERO);
                    if self.watch_window(self.clock.now() + pause).await == WindowOutcome::Release {
                        info!("scan released during restart pause");
                        return;
                    }
                }
            }
        }
    }

    /// Wait until the window (plus any discovery extension) expires,
    /// releasing early if subscribers stay at zero through the grace
    /// window or an explicit stop arrives.
    async fn watch_window(&self, base_expiry: Duration) -> WindowOutcome {
        loop {
            if self.shared.force_stop.get() {
                return WindowOutcome::Release;
            }
            let now = self.clock.now();
            let expiry = base_expiry + self.shared.cycle_extend.get();
            if now >= expiry {
                return WindowOutcome::Expired;
            }

            if self.shared.subs.borrow().is_empty() {
                if self.shared.idle_since.get().is_none() {
                    self.shared.idle_since.set(Some(now));
                    debug!("last scan subscriber detached, grace window starts");
                }
            } else if self.shared.idle_since.get().is_some() {
                self.shared.idle_since.set(None);
            }

            let mut deadline = expiry;
            if let Some(idle) = self.shared.idle_since.get() {
                let grace_end = idle + self.tuning.teardown_grace();
                if now >= grace_end {
                    return WindowOutcome::Release;
                }
                deadline = deadline.min(grace_end);
            }

            let sleep = async {
                self.clock.sleep(deadline.saturating_sub(now)).await;
            };
            let wake = async {
                self.shared.wake.wait().await;
            };
            future::or(sleep, wake).await;
        }
    }

    fn fail_all(&self, error: Error) {
        let slots: Vec<Rc<SubSlot>> = self.shared.subs.borrow_mut().drain(..).collect();
        for slot in slots {
            let _ = slot.inbox.try_send(ScanFrame::Failed(error.clone()));
        }
        self.shared.idle_since.set(None);
    }
}

// ── Tests ────────────────────────────────────────────────────
