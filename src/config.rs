//! Link configuration parameters.
//!
//! All tunable parameters for the BLE session layer. Values can be
//! overridden by the host application (loaded from its settings store
//! as JSON) before the link host is constructed.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ota::OtaEndian;

/// Top-level link configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkConfig {
    pub scan: ScanTuning,
    pub connect: ConnectTuning,
    pub shell: ShellTuning,
    pub ota: OtaTuning,
}

// ── Scanning ──────────────────────────────────────────────────

/// Scan cadence and teardown tuning.
///
/// The underlying transport scan has a finite lifetime and must be
/// restarted while subscribers remain. Opportunistic cycles carry a
/// random jitter so the radio does not lock step with periodically
/// advertising peripherals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTuning {
    /// Active-mode scan window (milliseconds).
    pub active_window_ms: u64,
    /// Pause between active-mode restarts (milliseconds).
    pub active_restart_pause_ms: u64,
    /// Opportunistic-mode scan window (milliseconds).
    pub opportunistic_window_ms: u64,
    /// Upper bound of the random jitter added to opportunistic cycles
    /// and on every discovery (milliseconds).
    pub opportunistic_jitter_max_ms: u64,
    /// Grace window after the last subscriber detaches before native
    /// scan resources are released (milliseconds).
    pub teardown_grace_ms: u64,
}

impl Default for ScanTuning {
    fn default() -> Self {
        Self {
            active_window_ms: 10_000,
            active_restart_pause_ms: 1_000,
            opportunistic_window_ms: 6_000,
            opportunistic_jitter_max_ms: 5_000,
            teardown_grace_ms: 5_000,
        }
    }
}

impl ScanTuning {
    pub fn active_window(&self) -> Duration {
        Duration::from_millis(self.active_window_ms)
    }

    pub fn active_restart_pause(&self) -> Duration {
        Duration::from_millis(self.active_restart_pause_ms)
    }

    pub fn opportunistic_window(&self) -> Duration {
        Duration::from_millis(self.opportunistic_window_ms)
    }

    pub fn opportunistic_jitter_max(&self) -> Duration {
        Duration::from_millis(self.opportunistic_jitter_max_ms)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }
}

// ── Connecting ────────────────────────────────────────────────

/// Connect retry tuning.
///
/// Some transports report "could not connect" as a sentinel handle
/// instead of an error callback, so the manager polls the connect call
/// at a fixed interval until success or the failure ceiling elapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectTuning {
    /// Interval between connect retries (milliseconds).
    pub retry_interval_ms: u64,
    /// Total elapsed time after which the attempt fails (milliseconds).
    pub failure_ceiling_ms: u64,
}

impl Default for ConnectTuning {
    fn default() -> Self {
        Self {
            retry_interval_ms: 1_000,
            failure_ceiling_ms: 8_100,
        }
    }
}

impl ConnectTuning {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn failure_ceiling(&self) -> Duration {
        Duration::from_millis(self.failure_ceiling_ms)
    }
}

// ── Shell protocol ────────────────────────────────────────────

/// Shell request tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellTuning {
    /// Inactivity timeout while waiting for a response line
    /// (milliseconds).
    pub response_timeout_ms: u64,
    /// Page size for generic data pushes (file transfers).
    pub push_page_size: usize,
    /// Inter-page delay for generic data pushes (milliseconds).
    pub push_page_interval_ms: u64,
}

impl Default for ShellTuning {
    fn default() -> Self {
        Self {
            response_timeout_ms: 10_000,
            push_page_size: 20,
            push_page_interval_ms: 10,
        }
    }
}

impl ShellTuning {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn push_page_interval(&self) -> Duration {
        Duration::from_millis(self.push_page_interval_ms)
    }
}

// ── OTA ───────────────────────────────────────────────────────

/// OTA transfer tuning.
///
/// Firmware pushes use a larger page and a longer inter-page delay
/// than generic pushes so the bootloader's flash write cycle is never
/// outrun.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtaTuning {
    /// Page size for the packet stream.
    pub page_size: usize,
    /// Inter-page delay (milliseconds).
    pub page_interval_ms: u64,
    /// Byte order of the packet header fields.
    pub endian: OtaEndian,
}

impl Default for OtaTuning {
    fn default() -> Self {
        Self {
            page_size: 240,
            page_interval_ms: 50,
            endian: OtaEndian::Big,
        }
    }
}

impl OtaTuning {
    pub fn page_interval(&self) -> Duration {
        Duration::from_millis(self.page_interval_ms)
    }
}

// ── Tests ────────────────────────────────────────────────────
