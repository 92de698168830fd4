//! CareLink BLE link layer.
//!
//! Connects a host application to CareLink sensor peripherals (diaper
//! humidity sensors, thermometer patches, demeter environmental units)
//! over an unreliable platform Bluetooth bridge, and drives two
//! protocols across the resulting link: the line-oriented device shell
//! and the checksummed OTA packet stream.
//!
//! The platform bridge (native plugin or message-bus daemon) is
//! abstracted behind [`bridge::BluetoothBridge`]; everything above it
//! is written once. All timers come from an injected [`clock::Clock`]
//! so retry/restart/jitter behaviour is testable without real delays.
//!
//! The crate is single-sequence by design: no threads, no `Send`
//! bounds. Spawn [`session::LinkHost::run`] on a local executor and
//! drive the rest from the same thread.

#![deny(unused_must_use)]

pub mod advert;
pub mod bridge;
pub mod clock;
pub mod config;
pub mod connect;
pub mod crc;
pub mod error;
pub mod notify;
pub mod ota;
pub mod scan;
pub mod session;
pub mod shell;
pub mod writer;

pub use advert::{DeviceKind, DeviceRegistry, Peripheral};
pub use config::LinkConfig;
pub use connect::Connection;
pub use error::{Error, Result};
pub use session::LinkHost;
