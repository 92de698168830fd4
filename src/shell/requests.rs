//! Concrete shell requests.
//!
//! Wire formats (ASCII, newline-terminated):
//!
//! ```text
//! cat <filename> -l=<length>          push a named blob, then body
//! trace <nowEpoch> <lastEpoch>        fetch history rows
//! export b=<0|1> t="<lo>" T="<hi>" h=<lo> H=<hi>
//! ```
//!
//! Responses follow the shared grammar: status `3` completes a
//! request, any other status code fails it, and multi-row responses
//! end with a bare empty line instead of a status.

use log::{debug, warn};

use crate::error::{DecodeError, Error, ProtocolError, Result};
use crate::writer::FlowControl;

use super::{STATUS_OK, ShellCommand, Transfer, Verdict, parse_status_line};

// ── cat: file push ────────────────────────────────────────────

/// Push a named blob to the peripheral's filesystem: the command line
/// announces name and length, the body streams page by page, and the
/// device answers with a terminal status once it has persisted the
/// bytes.
pub struct CatPush<'a> {
    filename: String,
    data: &'a [u8],
    flow: FlowControl,
}

impl<'a> CatPush<'a> {
    pub fn new(filename: impl Into<String>, data: &'a [u8], flow: FlowControl) -> Self {
        Self {
            filename: filename.into(),
            data,
            flow,
        }
    }
}

impl ShellCommand for CatPush<'_> {
    fn command_line(&self) -> String {
        format!("cat {} -l={}", self.filename, self.data.len())
    }

    fn immediate_transfer(&self) -> Option<Transfer<'_>> {
        Some(Transfer {
            data: self.data,
            flow: self.flow,
        })
    }

    fn on_line(&mut self, line: &str) -> Result<Verdict> {
        match parse_status_line(line) {
            Some((STATUS_OK, _)) => Ok(Verdict::Complete),
            Some((code, payload)) => {
                warn!("cat {} refused: {code}:{payload}", self.filename);
                Err(Error::ProtocolFailure(ProtocolError::Status(code)))
            }
            None => Err(Error::Decoding(DecodeError::MalformedLine(line.into()))),
        }
    }
}

// ── trace: history fetch ──────────────────────────────────────

/// One sampled history row.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceRow {
    /// Sample time, seconds since epoch.
    pub timestamp: u64,
    pub values: Vec<f32>,
}

/// Fetch sampled history since the last synchronization point.
///
/// The device answers with zero or more `<hexTimestamp> <v1>,<v2>,…`
/// rows followed by a bare empty line. Rows may arrive with
/// descending timestamps (firmware replays its ring buffer); only the
/// maximum is kept as the new synchronization point.
pub struct TraceHistory {
    now_epoch: u64,
    last_epoch: u64,
    pub rows: Vec<TraceRow>,
    pub latest_timestamp: u64,
}

impl TraceHistory {
    pub fn new(now_epoch: u64, last_epoch: u64) -> Self {
        Self {
            now_epoch,
            last_epoch,
            rows: Vec::new(),
            latest_timestamp: last_epoch,
        }
    }
}

impl ShellCommand for TraceHistory {
    fn command_line(&self) -> String {
        format!("trace {} {}", self.now_epoch, self.last_epoch)
    }

    fn on_line(&mut self, line: &str) -> Result<Verdict> {
        if line.trim().is_empty() {
            // End-of-data marker.
            return Ok(Verdict::Complete);
        }
        let Some((ts_field, values_field)) = line.split_once(' ') else {
            return Err(Error::Decoding(DecodeError::MalformedLine(line.into())));
        };
        let timestamp = u64::from_str_radix(ts_field, 16)
            .map_err(|_| Error::Decoding(DecodeError::BadTimestamp(ts_field.into())))?;
        let values = values_field
            .split(',')
            .map(|v| v.trim().parse::<f32>())
            .collect::<core::result::Result<Vec<f32>, _>>()
            .map_err(|_| Error::Decoding(DecodeError::MalformedLine(line.into())))?;

        if timestamp < self.latest_timestamp {
            // Ring-buffer replay order; keep accepting.
            debug!("trace row out of order ({timestamp} < {})", self.latest_timestamp);
        }
        self.latest_timestamp = self.latest_timestamp.max(timestamp);
        self.rows.push(TraceRow { timestamp, values });
        Ok(Verdict::Continue)
    }
}

// ── export: settings push ─────────────────────────────────────

/// Push alerting thresholds to the peripheral.
#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub buzzer: bool,
    pub temp_low: f32,
    pub temp_high: f32,
    pub humidity_low: u8,
    pub humidity_high: u8,
}

impl ShellCommand for ExportSettings {
    fn command_line(&self) -> String {
        format!(
            "export b={} t=\"{:.1}\" T=\"{:.1}\" h={} H={}",
            u8::from(self.buzzer),
            self.temp_low,
            self.temp_high,
            self.humidity_low,
            self.humidity_high,
        )
    }

    fn on_line(&mut self, line: &str) -> Result<Verdict> {
        match parse_status_line(line) {
            Some((STATUS_OK, _)) => Ok(Verdict::Complete),
            Some((code, _)) => Err(Error::ProtocolFailure(ProtocolError::Status(code))),
            None => Err(Error::Decoding(DecodeError::MalformedLine(line.into()))),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
