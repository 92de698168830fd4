//! Flow-controlled characteristic writes.
//!
//! BLE receivers on the other end of this link are small: a firmware
//! bootloader erasing flash between pages, a sensor draining a shallow
//! UART FIFO. The writer slices a buffer into transport-sized (or
//! caller-sized) pages, writes them strictly in sequence, and can wait
//! a configured interval between pages. Page *n+1* is never issued
//! before page *n*'s write call resolved.
//!
//! There is no retry here. The first write error stops the stream and
//! propagates; retry policy, if any, belongs to the protocol layer.

use std::rc::Rc;
use std::time::Duration;

use crate::bridge::{BluetoothBridge, BridgeError, CharId, WriteMode};
use crate::clock::Clock;
use crate::connect::Connection;
use crate::error::{Error, Result};

/// ATT write header overhead subtracted from the MTU when deriving the
/// default page size.
pub const ATT_WRITE_OVERHEAD: usize = 3;

/// Paging parameters for a buffer write.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowControl {
    /// Page size; defaults to MTU minus ATT overhead.
    pub page_size: Option<usize>,
    /// Delay between pages; `None` streams back-to-back.
    pub page_interval: Option<Duration>,
}

/// Writer bound to one characteristic of one connection.
pub struct CharWriter<B, C> {
    bridge: Rc<B>,
    clock: Rc<C>,
    conn: Connection,
    key: CharId,
    mode: WriteMode,
}

impl<B: BluetoothBridge, C: Clock> CharWriter<B, C> {
    pub fn new(
        bridge: Rc<B>,
        clock: Rc<C>,
        conn: Connection,
        key: CharId,
        mode: WriteMode,
    ) -> Self {
        Self {
            bridge,
            clock,
            conn,
            key,
            mode,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Largest single write the link accepts.
    pub fn page_limit(&self) -> usize {
        (self.conn.mtu() as usize).saturating_sub(ATT_WRITE_OVERHEAD).max(1)
    }

    /// Write at most `min(count or page_limit, buf.len() - offset)`
    /// bytes in one transport call. Returns the bytes written.
    pub async fn write(&self, buf: &[u8], count: Option<usize>, offset: usize) -> Result<usize> {
        if !self.conn.is_connected() {
            return Err(Error::Disconnected);
        }
        if offset >= buf.len() {
            return Ok(0);
        }
        let n = count
            .unwrap_or_else(|| self.page_limit())
            .min(buf.len() - offset);
        self.bridge
            .write_characteristic(
                self.conn.handle(),
                &self.key,
                &buf[offset..offset + n],
                self.mode,
            )
            .await
            .map_err(map_gatt_error)?;
        Ok(n)
    }

    /// Write the whole buffer as successive pages, reporting the
    /// cumulative byte count after each page. Stops at the first error.
    pub async fn write_all(
        &self,
        buf: &[u8],
        flow: FlowControl,
        mut on_progress: impl FnMut(usize),
    ) -> Result<usize> {
        let page = flow.page_size.unwrap_or_else(|| self.page_limit()).max(1);
        let mut sent = 0;
        while sent < buf.len() {
            let n = self.write(buf, Some(page), sent).await?;
            sent += n;
            on_progress(sent);
            if sent < buf.len() {
                if let Some(interval) = flow.page_interval {
                    self.clock.sleep(interval).await;
                }
            }
        }
        Ok(sent)
    }
}

/// A rejected or failed GATT operation on an established link means
/// the link is gone, whatever the platform called it.
pub(crate) fn map_gatt_error(e: BridgeError) -> Error {
    match e {
        BridgeError::Unavailable(msg) => Error::TransportUnavailable(msg.to_string()),
        BridgeError::Rejected(_) | BridgeError::Io(_) => Error::Disconnected,
    }
}

// ── Tests ────────────────────────────────────────────────────
