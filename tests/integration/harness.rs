//! Shared test rig: mock bridge + virtual clock + link host on a
//! local executor.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use carelink::bridge::mock::MockBridge;
use carelink::clock::VirtualClock;
use carelink::{LinkConfig, LinkHost};
use edge_executor::LocalExecutor;
use futures_lite::future;

pub type Host = LinkHost<MockBridge, VirtualClock>;

pub struct Rig {
    pub bridge: Rc<MockBridge>,
    pub clock: Rc<VirtualClock>,
    pub host: Rc<Host>,
}

pub fn rig() -> Rig {
    rig_with(LinkConfig::default())
}

pub fn rig_with(config: LinkConfig) -> Rig {
    let bridge = Rc::new(MockBridge::new());
    let clock = Rc::new(VirtualClock::new());
    let host = Rc::new(LinkHost::new(bridge.clone(), clock.clone(), config));
    Rig {
        bridge,
        clock,
        host,
    }
}

pub fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

/// Spawn the host's pump/scan driver on the executor.
pub fn spawn_host<const N: usize>(ex: &LocalExecutor<'_, N>, host: &Rc<Host>) {
    let host = host.clone();
    ex.spawn(async move { host.run().await }).detach();
}

/// Let every ready task run to its next suspension point.
pub async fn settle() {
    for _ in 0..48 {
        future::yield_now().await;
    }
}

/// Slot for collecting a spawned task's result.
pub type Outcome<T> = Rc<RefCell<Option<T>>>;

pub fn outcome<T>() -> Outcome<T> {
    Rc::new(RefCell::new(None))
}

/// A diaper-sensor advertisement: complete local name + CareLink
/// manufacturer block.
pub fn diaper_adv() -> Vec<u8> {
    vec![
        0x05, 0x09, b'C', b'L', b'-', b'1', //
        0x05, 0xFF, 0x5A, 0x0C, 0x01, 0x07,
    ]
}
