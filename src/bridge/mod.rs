//! Bluetooth bridge abstraction.
//!
//! The link layer does not talk to a radio. It talks to a *bridge*: a
//! platform service (native plugin, message-bus daemon) that exposes
//! scan/connect/GATT primitives and delivers discovery, disconnect and
//! notification signals. Everything above this trait is written once
//! and reused across bridges.
//!
//! Concrete implementations:
//! - [`mock::MockBridge`] - scriptable in-process bridge for tests.
//! - `btleplug` (feature `btleplug`) - real host adapter over BlueZ /
//!   CoreBluetooth / WinRT.

use core::fmt;
use std::time::Duration;

use uuid::Uuid;

pub mod mock;

#[cfg(feature = "btleplug")]
pub mod btleplug;

// ── Identifiers ───────────────────────────────────────────────

/// Transport-level connection handle (fd/token).
pub type ConnHandle = i32;

/// Sentinel handle some transports return instead of signalling a
/// connect failure. The connection manager polls for it and retries.
pub const HANDLE_NONE: ConnHandle = -1;

/// Opaque token identifying one native scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanToken(pub u32);

/// A GATT characteristic address: service plus characteristic UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharId {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharId {
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl fmt::Display for CharId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// GATT write mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

// ── Wire-level records ────────────────────────────────────────

/// One raw discovery as delivered by the bridge.
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: String,
    pub rssi: i16,
    /// Raw advertisement payload (length-prefixed AD blocks).
    pub data: Vec<u8>,
}

/// Successful connect reply. `handle == HANDLE_NONE` means the
/// transport's silent-failure sentinel.
#[derive(Debug, Clone, Copy)]
pub struct ConnectReply {
    pub handle: ConnHandle,
    pub mtu: u16,
}

/// Signals pushed up from the bridge.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Discovered(Advertisement),
    Disconnected(ConnHandle),
    Notification {
        handle: ConnHandle,
        key: CharId,
        data: Vec<u8>,
    },
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Plugin not installed / bus service absent / adapter powered off.
    Unavailable(&'static str),
    /// The bridge refused the call.
    Rejected(String),
    /// The call failed mid-flight.
    Io(String),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "bridge unavailable: {msg}"),
            Self::Rejected(msg) => write!(f, "bridge rejected call: {msg}"),
            Self::Io(msg) => write!(f, "bridge i/o: {msg}"),
        }
    }
}

// ── The bridge trait ──────────────────────────────────────────

/// Platform Bluetooth bridge.
///
/// All methods take `&self`; implementations use interior mutability
/// because the whole link layer runs on one logical sequence and the
/// bridge is shared behind an `Rc`.
#[allow(async_fn_in_trait)] // single-threaded crate, no Send bounds wanted
pub trait BluetoothBridge {
    /// Whether the adapter is powered and usable.
    async fn is_enabled(&self) -> bool;

    /// Start a native scan session. The session silently dies after
    /// roughly `window`; the scan coordinator restarts it.
    async fn start_scan(&self, active: bool, window: Duration) -> Result<ScanToken, BridgeError>;

    async fn stop_scan(&self, token: ScanToken) -> Result<(), BridgeError>;

    /// Issue a connect call. A reply carrying [`HANDLE_NONE`] means the
    /// transport could not connect but did not report an error.
    async fn connect(&self, address: &str) -> Result<ConnectReply, BridgeError>;

    async fn disconnect(&self, handle: ConnHandle) -> Result<(), BridgeError>;

    async fn read_characteristic(
        &self,
        handle: ConnHandle,
        key: &CharId,
    ) -> Result<Vec<u8>, BridgeError>;

    async fn write_characteristic(
        &self,
        handle: ConnHandle,
        key: &CharId,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), BridgeError>;

    async fn subscribe(&self, handle: ConnHandle, key: &CharId) -> Result<(), BridgeError>;

    async fn unsubscribe(&self, handle: ConnHandle, key: &CharId) -> Result<(), BridgeError>;

    /// Next bridge signal. The link host runs one pump over this.
    async fn next_event(&self) -> BridgeEvent;
}
