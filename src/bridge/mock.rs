//! Scriptable in-process bridge for tests.
//!
//! Records every call so tests can assert on the full command history,
//! and lets tests inject discovery/disconnect/notification events as
//! if the platform pushed them. Connect replies are scripted per call;
//! with an empty script the bridge keeps answering with the silent
//! failure sentinel, which is exactly how a flaky transport looks.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::time::Duration;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;

use super::{
    Advertisement, BluetoothBridge, BridgeError, BridgeEvent, CharId, ConnHandle, ConnectReply,
    HANDLE_NONE, ScanToken, WriteMode,
};

const EVENT_DEPTH: usize = 32;

// ── Call record ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeCall {
    StartScan { active: bool, window: Duration },
    StopScan(ScanToken),
    Connect(String),
    Disconnect(ConnHandle),
    Read(ConnHandle, CharId),
    Write {
        handle: ConnHandle,
        key: CharId,
        data: Vec<u8>,
        mode: WriteMode,
    },
    Subscribe(ConnHandle, CharId),
    Unsubscribe(ConnHandle, CharId),
}

// ── MockBridge ────────────────────────────────────────────────

pub struct MockBridge {
    calls: RefCell<Vec<BridgeCall>>,
    enabled: Cell<bool>,
    scan_rejection: RefCell<Option<&'static str>>,
    next_token: Cell<u32>,
    connect_script: RefCell<VecDeque<Result<ConnectReply, BridgeError>>>,
    subscribe_error: RefCell<Option<BridgeError>>,
    write_error: RefCell<Option<BridgeError>>,
    read_script: RefCell<VecDeque<Vec<u8>>>,
    events: Channel<NoopRawMutex, BridgeEvent, EVENT_DEPTH>,
}

impl MockBridge {
    pub fn new() -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            enabled: Cell::new(true),
            scan_rejection: RefCell::new(None),
            next_token: Cell::new(1),
            connect_script: RefCell::new(VecDeque::new()),
            subscribe_error: RefCell::new(None),
            write_error: RefCell::new(None),
            read_script: RefCell::new(VecDeque::new()),
            events: Channel::new(),
        }
    }

    // ── Scripting ─────────────────────────────────────────────

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    /// Make every subsequent start-scan call fail.
    pub fn reject_scans(&self, reason: &'static str) {
        *self.scan_rejection.borrow_mut() = Some(reason);
    }

    /// Queue one connect reply.
    pub fn script_connect(&self, reply: Result<ConnectReply, BridgeError>) {
        self.connect_script.borrow_mut().push_back(reply);
    }

    /// Queue a successful connect reply.
    pub fn script_connect_success(&self, handle: ConnHandle, mtu: u16) {
        self.script_connect(Ok(ConnectReply { handle, mtu }));
    }

    /// Queue `count` silent-failure sentinels.
    pub fn script_connect_sentinels(&self, count: usize) {
        for _ in 0..count {
            self.script_connect(Ok(ConnectReply {
                handle: HANDLE_NONE,
                mtu: 0,
            }));
        }
    }

    pub fn fail_subscribes(&self, error: BridgeError) {
        *self.subscribe_error.borrow_mut() = Some(error);
    }

    pub fn fail_writes(&self, error: BridgeError) {
        *self.write_error.borrow_mut() = Some(error);
    }

    pub fn script_read(&self, data: Vec<u8>) {
        self.read_script.borrow_mut().push_back(data);
    }

    // ── Event injection ───────────────────────────────────────

    pub fn push_event(&self, event: BridgeEvent) {
        self.events
            .try_send(event)
            .expect("mock bridge event queue full");
    }

    pub fn emit_advertisement(&self, address: &str, rssi: i16, data: &[u8]) {
        self.push_event(BridgeEvent::Discovered(Advertisement {
            address: address.to_string(),
            rssi,
            data: data.to_vec(),
        }));
    }

    pub fn emit_disconnect(&self, handle: ConnHandle) {
        self.push_event(BridgeEvent::Disconnected(handle));
    }

    pub fn emit_notification(&self, handle: ConnHandle, key: CharId, data: &[u8]) {
        self.push_event(BridgeEvent::Notification {
            handle,
            key,
            data: data.to_vec(),
        });
    }

    // ── Assertions ────────────────────────────────────────────

    pub fn calls(&self) -> Vec<BridgeCall> {
        self.calls.borrow().clone()
    }

    pub fn start_scan_count(&self) -> usize {
        self.count(|c| matches!(c, BridgeCall::StartScan { .. }))
    }

    pub fn stop_scan_count(&self) -> usize {
        self.count(|c| matches!(c, BridgeCall::StopScan(_)))
    }

    pub fn connect_count(&self) -> usize {
        self.count(|c| matches!(c, BridgeCall::Connect(_)))
    }

    pub fn subscribe_count(&self, key: &CharId) -> usize {
        self.count(|c| matches!(c, BridgeCall::Subscribe(_, k) if k == key))
    }

    pub fn unsubscribe_count(&self, key: &CharId) -> usize {
        self.count(|c| matches!(c, BridgeCall::Unsubscribe(_, k) if k == key))
    }

    pub fn write_count(&self, key: &CharId) -> usize {
        self.count(|c| matches!(c, BridgeCall::Write { key: k, .. } if k == key))
    }

    /// Every byte written to `key`, in write order.
    pub fn written_bytes(&self, key: &CharId) -> Vec<u8> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|c| match c {
                BridgeCall::Write { key: k, data, .. } if k == key => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn count(&self, predicate: impl Fn(&BridgeCall) -> bool) -> usize {
        self.calls.borrow().iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: BridgeCall) {
        self.calls.borrow_mut().push(call);
    }
}

impl Default for MockBridge {
    fn default() -> Self {
        Self::new()
    }
}

// ── Bridge implementation ─────────────────────────────────────

impl BluetoothBridge for MockBridge {
    async fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    async fn start_scan(&self, active: bool, window: Duration) -> Result<ScanToken, BridgeError> {
        self.record(BridgeCall::StartScan { active, window });
        if let Some(reason) = *self.scan_rejection.borrow() {
            return Err(BridgeError::Rejected(reason.to_string()));
        }
        let token = ScanToken(self.next_token.get());
        self.next_token.set(token.0 + 1);
        Ok(token)
    }

    async fn stop_scan(&self, token: ScanToken) -> Result<(), BridgeError> {
        self.record(BridgeCall::StopScan(token));
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<ConnectReply, BridgeError> {
        self.record(BridgeCall::Connect(address.to_string()));
        self.connect_script.borrow_mut().pop_front().unwrap_or(Ok(ConnectReply {
            handle: HANDLE_NONE,
            mtu: 0,
        }))
    }

    async fn disconnect(&self, handle: ConnHandle) -> Result<(), BridgeError> {
        self.record(BridgeCall::Disconnect(handle));
        Ok(())
    }

    async fn read_characteristic(
        &self,
        handle: ConnHandle,
        key: &CharId,
    ) -> Result<Vec<u8>, BridgeError> {
        self.record(BridgeCall::Read(handle, *key));
        Ok(self.read_script.borrow_mut().pop_front().unwrap_or_default())
    }

    async fn write_characteristic(
        &self,
        handle: ConnHandle,
        key: &CharId,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), BridgeError> {
        self.record(BridgeCall::Write {
            handle,
            key: *key,
            data: data.to_vec(),
            mode,
        });
        match self.write_error.borrow().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn subscribe(&self, handle: ConnHandle, key: &CharId) -> Result<(), BridgeError> {
        self.record(BridgeCall::Subscribe(handle, *key));
        match self.subscribe_error.borrow().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn unsubscribe(&self, handle: ConnHandle, key: &CharId) -> Result<(), BridgeError> {
        self.record(BridgeCall::Unsubscribe(handle, *key));
        Ok(())
    }

    async fn next_event(&self) -> BridgeEvent {
        self.events.receive().await
    }
}

// ── Tests ────────────────────────────────────────────────────
