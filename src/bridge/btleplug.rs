//! Host bridge over the `btleplug` crate (BlueZ / CoreBluetooth /
//! WinRT).
//!
//! btleplug hands us parsed peripheral properties rather than raw
//! advertisement payloads, so this adapter re-encodes the fields the
//! link layer cares about (local name, manufacturer data) as standard
//! AD blocks before pushing a [`BridgeEvent::Discovered`].
//!
//! btleplug's backends need a tokio reactor and this bridge spawns
//! `!Send` forwarder tasks, so construct and use it inside a
//! `tokio::task::LocalSet` on a current-thread runtime.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use ::btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter, WriteType,
};
use ::btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;
use futures::StreamExt;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::advert::{AD_TYPE_COMPLETE_NAME, AD_TYPE_MANUFACTURER};

use super::{
    Advertisement, BluetoothBridge, BridgeError, BridgeEvent, CharId, ConnHandle, ConnectReply,
    HANDLE_NONE, ScanToken, WriteMode,
};

/// btleplug does not surface the negotiated MTU; assume the common
/// smartphone-stack default and let pacing keep receivers safe.
const DEFAULT_MTU: u16 = 185;

const EVENT_DEPTH: usize = 64;

type EventChannel = Channel<NoopRawMutex, BridgeEvent, EVENT_DEPTH>;

struct ConnEntry {
    peripheral: Peripheral,
    characteristics: Vec<Characteristic>,
}

struct State {
    next_handle: ConnHandle,
    by_handle: HashMap<ConnHandle, ConnEntry>,
    handle_by_id: HashMap<PeripheralId, ConnHandle>,
}

pub struct BtleplugBridge {
    adapter: Adapter,
    state: Rc<RefCell<State>>,
    events: Rc<EventChannel>,
    next_token: std::cell::Cell<u32>,
}

impl BtleplugBridge {
    /// Open the first Bluetooth adapter and start forwarding central
    /// events.
    pub async fn new() -> Result<Self, BridgeError> {
        let manager = Manager::new()
            .await
            .map_err(|_| BridgeError::Unavailable("bluetooth manager unavailable"))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|_| BridgeError::Unavailable("adapter enumeration failed"))?
            .into_iter()
            .next()
            .ok_or(BridgeError::Unavailable("no bluetooth adapter found"))?;

        let state = Rc::new(RefCell::new(State {
            next_handle: 1,
            by_handle: HashMap::new(),
            handle_by_id: HashMap::new(),
        }));
        let events: Rc<EventChannel> = Rc::new(Channel::new());

        let bridge = Self {
            adapter: adapter.clone(),
            state: state.clone(),
            events: events.clone(),
            next_token: std::cell::Cell::new(1),
        };

        let central_events = adapter
            .events()
            .await
            .map_err(|e| BridgeError::Rejected(e.to_string()))?;
        tokio::task::spawn_local(forward_central_events(
            adapter,
            central_events,
            state,
            events,
        ));
        Ok(bridge)
    }

    fn entry_char(
        &self,
        handle: ConnHandle,
        key: &CharId,
    ) -> Result<(Peripheral, Characteristic), BridgeError> {
        let state = self.state.borrow();
        let entry = state
            .by_handle
            .get(&handle)
            .ok_or_else(|| BridgeError::Rejected(format!("unknown handle {handle}")))?;
        let characteristic = entry
            .characteristics
            .iter()
            .find(|c| c.uuid == key.characteristic && c.service_uuid == key.service)
            .cloned()
            .ok_or_else(|| BridgeError::Rejected(format!("unknown characteristic {key}")))?;
        Ok((entry.peripheral.clone(), characteristic))
    }
}

impl BluetoothBridge for BtleplugBridge {
    async fn is_enabled(&self) -> bool {
        matches!(
            self.adapter.adapter_state().await,
            Ok(CentralState::PoweredOn)
        )
    }

    async fn start_scan(&self, active: bool, window: Duration) -> Result<ScanToken, BridgeError> {
        // BlueZ scans until told to stop; the coordinator owns the
        // window and issues the stop itself.
        let _ = (active, window);
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BridgeError::Rejected(e.to_string()))?;
        let token = ScanToken(self.next_token.get());
        self.next_token.set(token.0 + 1);
        Ok(token)
    }

    async fn stop_scan(&self, _token: ScanToken) -> Result<(), BridgeError> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| BridgeError::Io(e.to_string()))
    }

    async fn connect(&self, address: &str) -> Result<ConnectReply, BridgeError> {
        let peripheral = match find_by_address(&self.adapter, address).await? {
            Some(p) => p,
            None => {
                // Not discovered (yet). Same shape as the platforms
                // that never signal connect failure: sentinel + retry.
                debug!("connect {address}: peripheral not in adapter cache");
                return Ok(ConnectReply {
                    handle: HANDLE_NONE,
                    mtu: 0,
                });
            }
        };

        if let Err(e) = peripheral.connect().await {
            warn!("connect {address} failed at transport: {e}");
            return Ok(ConnectReply {
                handle: HANDLE_NONE,
                mtu: 0,
            });
        }
        peripheral
            .discover_services()
            .await
            .map_err(|e| BridgeError::Io(e.to_string()))?;
        let characteristics: Vec<Characteristic> =
            peripheral.characteristics().into_iter().collect();

        let handle = {
            let mut state = self.state.borrow_mut();
            let handle = state.next_handle;
            state.next_handle += 1;
            state.handle_by_id.insert(peripheral.id(), handle);
            state.by_handle.insert(
                handle,
                ConnEntry {
                    peripheral: peripheral.clone(),
                    characteristics,
                },
            );
            handle
        };
        info!("connected {address} as handle {handle}");

        // Forward this peripheral's notifications for the life of the
        // connection.
        match peripheral.notifications().await {
            Ok(stream) => {
                tokio::task::spawn_local(forward_notifications(
                    handle,
                    stream,
                    self.state.clone(),
                    self.events.clone(),
                ));
            }
            Err(e) => warn!("notification stream for handle {handle} unavailable: {e}"),
        }

        Ok(ConnectReply {
            handle,
            mtu: DEFAULT_MTU,
        })
    }

    async fn disconnect(&self, handle: ConnHandle) -> Result<(), BridgeError> {
        let peripheral = {
            let state = self.state.borrow();
            state.by_handle.get(&handle).map(|e| e.peripheral.clone())
        };
        match peripheral {
            Some(p) => p
                .disconnect()
                .await
                .map_err(|e| BridgeError::Io(e.to_string())),
            None => Ok(()),
        }
    }

    async fn read_characteristic(
        &self,
        handle: ConnHandle,
        key: &CharId,
    ) -> Result<Vec<u8>, BridgeError> {
        let (peripheral, characteristic) = self.entry_char(handle, key)?;
        peripheral
            .read(&characteristic)
            .await
            .map_err(|e| BridgeError::Io(e.to_string()))
    }

    async fn write_characteristic(
        &self,
        handle: ConnHandle,
        key: &CharId,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), BridgeError> {
        let (peripheral, characteristic) = self.entry_char(handle, key)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        peripheral
            .write(&characteristic, data, write_type)
            .await
            .map_err(|e| BridgeError::Io(e.to_string()))
    }

    async fn subscribe(&self, handle: ConnHandle, key: &CharId) -> Result<(), BridgeError> {
        let (peripheral, characteristic) = self.entry_char(handle, key)?;
        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| BridgeError::Io(e.to_string()))
    }

    async fn unsubscribe(&self, handle: ConnHandle, key: &CharId) -> Result<(), BridgeError> {
        let (peripheral, characteristic) = self.entry_char(handle, key)?;
        peripheral
            .unsubscribe(&characteristic)
            .await
            .map_err(|e| BridgeError::Io(e.to_string()))
    }

    async fn next_event(&self) -> BridgeEvent {
        self.events.receive().await
    }
}

// ── Forwarder tasks ───────────────────────────────────────────

async fn forward_central_events(
    adapter: Adapter,
    mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    state: Rc<RefCell<State>>,
    events: Rc<EventChannel>,
) {
    while let Some(event) = central_events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                let advertisement = Advertisement {
                    address: props.address.to_string(),
                    rssi: props.rssi.unwrap_or(0),
                    data: synthesize_ad_blocks(&props),
                };
                push(&events, BridgeEvent::Discovered(advertisement));
            }
            CentralEvent::DeviceDisconnected(id) => {
                let handle = {
                    let mut s = state.borrow_mut();
                    match s.handle_by_id.remove(&id) {
                        Some(h) => {
                            s.by_handle.remove(&h);
                            Some(h)
                        }
                        None => None,
                    }
                };
                if let Some(handle) = handle {
                    push(&events, BridgeEvent::Disconnected(handle));
                }
            }
            _ => {}
        }
    }
    debug!("central event stream ended");
}

async fn forward_notifications(
    handle: ConnHandle,
    mut notifications: std::pin::Pin<
        Box<dyn futures::Stream<Item = ::btleplug::api::ValueNotification> + Send>,
    >,
    state: Rc<RefCell<State>>,
    events: Rc<EventChannel>,
) {
    while let Some(notification) = notifications.next().await {
        let service = lookup_service(&state, handle, notification.uuid);
        let Some(service) = service else {
            debug!(
                "notification from unknown characteristic {} on handle {handle}",
                notification.uuid
            );
            continue;
        };
        push(
            &events,
            BridgeEvent::Notification {
                handle,
                key: CharId::new(service, notification.uuid),
                data: notification.value,
            },
        );
    }
    debug!("notification stream for handle {handle} ended");
}

fn lookup_service(state: &Rc<RefCell<State>>, handle: ConnHandle, uuid: Uuid) -> Option<Uuid> {
    let state = state.borrow();
    let entry = state.by_handle.get(&handle)?;
    entry
        .characteristics
        .iter()
        .find(|c| c.uuid == uuid)
        .map(|c| c.service_uuid)
}

fn push(events: &EventChannel, event: BridgeEvent) {
    if events.try_send(event).is_err() {
        warn!("bridge event queue full, dropping event");
    }
}

async fn find_by_address(
    adapter: &Adapter,
    address: &str,
) -> Result<Option<Peripheral>, BridgeError> {
    let peripherals = adapter
        .peripherals()
        .await
        .map_err(|e| BridgeError::Io(e.to_string()))?;
    for p in peripherals {
        if p.address().to_string().eq_ignore_ascii_case(address) {
            return Ok(Some(p));
        }
    }
    Ok(None)
}

/// Re-encode the parsed properties as standard AD blocks so the link
/// layer's advertisement parser sees the shape it expects.
fn synthesize_ad_blocks(props: &PeripheralProperties) -> Vec<u8> {
    let mut data = Vec::new();
    if let Some(name) = &props.local_name {
        let bytes = name.as_bytes();
        let take = bytes.len().min(29);
        data.push((take + 1) as u8);
        data.push(AD_TYPE_COMPLETE_NAME);
        data.extend_from_slice(&bytes[..take]);
    }
    for (company, payload) in &props.manufacturer_data {
        let take = payload.len().min(27);
        data.push((take + 3) as u8);
        data.push(AD_TYPE_MANUFACTURER);
        data.extend_from_slice(&company.to_le_bytes());
        data.extend_from_slice(&payload[..take]);
    }
    data
}
