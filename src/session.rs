//! Link host: wiring and the bridge event pump.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        LinkHost                             │
//! │                                                             │
//! │  BridgeEvent pump ──┬─ Discovered ──▶ ScanCoordinator       │
//! │                     ├─ Disconnected ─▶ ConnectionManager    │
//! │                     └─ Notification ─▶ NotificationRouter   │
//! │                                                             │
//! │  ScanCoordinator · ConnectionManager · NotificationRouter   │
//! │            (shared bridge + injected clock)                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Everything runs on one logical sequence: spawn [`LinkHost::run`]
//! on a local executor and use the accessors from the same thread.

use std::rc::Rc;

use log::warn;
use uuid::Uuid;

use crate::advert::DeviceRegistry;
use crate::bridge::{BluetoothBridge, BridgeEvent, CharId, WriteMode};
use crate::clock::Clock;
use crate::config::LinkConfig;
use crate::connect::{Connection, ConnectionManager};
use crate::error::{Error, Result};
use crate::notify::{NotificationRouter, NotificationStream};
use crate::scan::{ScanCoordinator, ScanSubscription};
use crate::shell::ShellStream;
use crate::writer::{CharWriter, map_gatt_error};

// ── Shell GATT layout ─────────────────────────────────────────
//
// All CareLink peripherals expose the shell over a UART-style service:
//
// | Characteristic | UUID           | Role                |
// |----------------|----------------|---------------------|
// | Shell TX       | 6e400002-…     | host → device write |
// | Shell RX       | 6e400003-…     | device → host notify|

pub const SHELL_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
pub const SHELL_TX: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
pub const SHELL_RX: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Write-side shell characteristic.
pub fn shell_tx_char() -> CharId {
    CharId::new(SHELL_SERVICE, SHELL_TX)
}

/// Notify-side shell characteristic.
pub fn shell_rx_char() -> CharId {
    CharId::new(SHELL_SERVICE, SHELL_RX)
}

// ── Host ──────────────────────────────────────────────────────

/// Owns the session-layer components over one bridge.
pub struct LinkHost<B, C> {
    bridge: Rc<B>,
    clock: Rc<C>,
    config: LinkConfig,
    scanner: ScanCoordinator<B, C>,
    connections: ConnectionManager<B, C>,
    router: NotificationRouter<B>,
}

impl<B: BluetoothBridge + 'static, C: Clock + 'static> LinkHost<B, C> {
    pub fn new(bridge: Rc<B>, clock: Rc<C>, config: LinkConfig) -> Self {
        Self::with_registry(bridge, clock, config, DeviceRegistry::with_defaults())
    }

    pub fn with_registry(
        bridge: Rc<B>,
        clock: Rc<C>,
        config: LinkConfig,
        registry: DeviceRegistry,
    ) -> Self {
        let scanner = ScanCoordinator::new(
            bridge.clone(),
            clock.clone(),
            config.scan.clone(),
            registry,
        );
        let connections =
            ConnectionManager::new(bridge.clone(), clock.clone(), config.connect.clone());
        let router = NotificationRouter::new(bridge.clone());
        Self {
            bridge,
            clock,
            config,
            scanner,
            connections,
            router,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn scanner(&self) -> &ScanCoordinator<B, C> {
        &self.scanner
    }

    pub fn connections(&self) -> &ConnectionManager<B, C> {
        &self.connections
    }

    pub fn router(&self) -> &NotificationRouter<B> {
        &self.router
    }

    /// Whether the underlying adapter is usable at all.
    pub async fn is_enabled(&self) -> bool {
        self.bridge.is_enabled().await
    }

    // ── Conveniences ──────────────────────────────────────────

    pub fn scan(&self) -> ScanSubscription {
        self.scanner.scan()
    }

    pub fn opportunistic_scan(&self) -> ScanSubscription {
        self.scanner.opportunistic_scan()
    }

    pub fn stop_scan(&self) {
        self.scanner.stop_scan();
    }

    pub async fn connect(&self, address: &str) -> Result<Connection> {
        self.connections.connect(address).await
    }

    pub async fn disconnect(&self, address: &str) {
        self.connections.disconnect(address).await;
    }

    /// One-shot characteristic read on a live connection.
    pub async fn read(&self, conn: &Connection, key: CharId) -> Result<Vec<u8>> {
        if !conn.is_connected() {
            return Err(Error::Disconnected);
        }
        self.bridge
            .read_characteristic(conn.handle(), &key)
            .await
            .map_err(map_gatt_error)
    }

    /// Open a shell stream on `conn`: subscribe the RX characteristic
    /// and bind a flow-controlled writer to TX.
    pub async fn shell(&self, conn: &Connection) -> ShellStream<B, C> {
        let rx: NotificationStream = self.router.start(conn, shell_rx_char()).await;
        let writer = CharWriter::new(
            self.bridge.clone(),
            self.clock.clone(),
            conn.clone(),
            shell_tx_char(),
            WriteMode::WithResponse,
        );
        ShellStream::new(writer, rx, self.clock.clone(), &self.config.shell)
    }

    // ── The pump ──────────────────────────────────────────────

    /// Drive the event pump and the scan state machine. Never returns;
    /// spawn it once on the executor that owns this host.
    pub async fn run(&self) {
        let pump = self.pump_events();
        let scan = self.scanner.run();
        futures_lite::future::zip(pump, scan).await;
    }

    async fn pump_events(&self) {
        loop {
            match self.bridge.next_event().await {
                BridgeEvent::Discovered(adv) => self.scanner.handle_advertisement(&adv),
                BridgeEvent::Disconnected(handle) => {
                    self.connections.handle_transport_disconnect(handle);
                }
                BridgeEvent::Notification { handle, key, data } => {
                    let delivered = self
                        .connections
                        .connection_by_handle(handle)
                        .is_some_and(|conn| self.router.deliver(&conn, key, &data));
                    if !delivered {
                        // A notification nobody asked for means a leaked
                        // subscription on the peripheral side.
                        warn!("unroutable notification {key} on handle {handle}, unsubscribing");
                        if let Err(e) = self.bridge.unsubscribe(handle, &key).await {
                            warn!("defensive unsubscribe {key} failed: {e}");
                        }
                    }
                }
            }
        }
    }
}
