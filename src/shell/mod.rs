//! Line-oriented shell request protocol.
//!
//! Peripheral firmware exposes a tiny command shell over a write/notify
//! characteristic pair: the host writes one ASCII command line, the
//! device answers with newline-delimited response lines until a
//! terminal status. One [`ShellRequest`] run is one command lifecycle:
//!
//! ```text
//! Idle ─(start)─▶ Sent ─(line)─▶ Sent ─▶ … ─▶ Completed | Errored | Aborted
//! ```
//!
//! Response-line grammar (see the concrete requests in [`requests`]):
//! - `<status>:<payload>`  terminal-status style; `3` is success.
//! - `<hexTimestamp> <v1>,<v2>,…`  data-row style.
//! - an empty line         end-of-data marker.
//! - the literal `crc error`.
//!
//! A malformed line fails the request. A shell whose output cannot be
//! parsed cannot be trusted to resume, so there is no skip-and-hope.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::signal::Signal;
use futures_lite::future;
use log::{debug, warn};

use crate::bridge::BluetoothBridge;
use crate::clock::Clock;
use crate::config::ShellTuning;
use crate::error::{DecodeError, Error, Result};
use crate::notify::NotificationStream;
use crate::writer::{CharWriter, FlowControl};

pub mod requests;

// ── Status-line grammar ───────────────────────────────────────

/// Terminal success status.
pub const STATUS_OK: u32 = 3;
/// "Ready to receive, no transfer in progress".
pub const STATUS_READY: u32 = 0;
/// Fatal checksum complaint some firmware emits instead of a status.
pub const CRC_ERROR_LITERAL: &str = "crc error";

/// Split `<code>:<payload>`; `None` if the line is not status-shaped.
pub fn parse_status_line(line: &str) -> Option<(u32, &str)> {
    let (code, payload) = line.split_once(':')?;
    let code = code.trim().parse().ok()?;
    Some((code, payload))
}

// ── Line decoder ──────────────────────────────────────────────

/// A single response line never legitimately exceeds this.
const MAX_LINE: usize = 1024;

/// Streaming newline-delimited decoder. A notification may carry part
/// of a line, several lines, or bytes spanning a line boundary.
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed raw bytes; returns every line completed by this chunk.
    /// Trailing `\r` is stripped. Non-UTF-8 content is a decode error.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for &byte in data {
            if byte == b'\n' {
                let mut raw = core::mem::take(&mut self.buf);
                if raw.last() == Some(&b'\r') {
                    raw.pop();
                }
                let line =
                    String::from_utf8(raw).map_err(|_| Error::Decoding(DecodeError::NotUtf8))?;
                lines.push(line);
            } else {
                if self.buf.len() >= MAX_LINE {
                    return Err(Error::Decoding(DecodeError::LineTooLong));
                }
                self.buf.push(byte);
            }
        }
        Ok(lines)
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

// ── Request plumbing ──────────────────────────────────────────

/// Request lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Sent,
    Completed,
    Errored,
    Aborted,
}

/// What a response line means for the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// More lines expected.
    Continue,
    /// Terminal success.
    Complete,
    /// Device is ready; stream the gated body now.
    BeginTransfer,
}

/// A body to stream through the flow-controlled writer.
pub struct Transfer<'a> {
    pub data: &'a [u8],
    pub flow: FlowControl,
}

/// One concrete shell command: the line to transmit, optional body,
/// and a per-line response handler.
pub trait ShellCommand {
    /// Command line without the trailing newline.
    fn command_line(&self) -> String;

    /// Body streamed right after the command line, before any
    /// response handling (file pushes).
    fn immediate_transfer(&self) -> Option<Transfer<'_>> {
        None
    }

    /// Body streamed when [`Verdict::BeginTransfer`] is returned
    /// (OTA waits for the device-ready status first).
    fn gated_transfer(&self) -> Option<Transfer<'_>> {
        None
    }

    /// Handle one response line.
    fn on_line(&mut self, line: &str) -> Result<Verdict>;
}

/// Receives cumulative transfer progress.
pub trait ProgressSink {
    fn on_progress(&mut self, sent: usize, total: usize);
}

/// Progress sink that discards everything.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn on_progress(&mut self, _sent: usize, _total: usize) {}
}

/// Cloneable handle that aborts the in-flight request, effective even
/// mid-transfer and safe to use before the request starts.
#[derive(Clone)]
pub struct AbortHandle {
    flag: Rc<Cell<bool>>,
    wake: Rc<Signal<NoopRawMutex, ()>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.flag.set(true);
        self.wake.signal(());
    }
}

// ── Shell stream ──────────────────────────────────────────────

/// The byte stream a shell request runs over: write side is the
/// flow-controlled writer, read side a notification channel.
pub struct ShellStream<B, C> {
    writer: CharWriter<B, C>,
    rx: NotificationStream,
    clock: Rc<C>,
    response_timeout: Duration,
    decoder: LineDecoder,
    pending: VecDeque<String>,
    state: Cell<RequestState>,
    abort_flag: Rc<Cell<bool>>,
    abort_wake: Rc<Signal<NoopRawMutex, ()>>,
}

enum StreamEvent {
    Frame(Option<Vec<u8>>),
    TimedOut,
    Aborted,
}

impl<B: BluetoothBridge, C: Clock> ShellStream<B, C> {
    pub fn new(
        writer: CharWriter<B, C>,
        rx: NotificationStream,
        clock: Rc<C>,
        tuning: &ShellTuning,
    ) -> Self {
        Self {
            writer,
            rx,
            clock,
            response_timeout: tuning.response_timeout(),
            decoder: LineDecoder::new(),
            pending: VecDeque::new(),
            state: Cell::new(RequestState::Idle),
            abort_flag: Rc::new(Cell::new(false)),
            abort_wake: Rc::new(Signal::new()),
        }
    }

    pub fn state(&self) -> RequestState {
        self.state.get()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            flag: self.abort_flag.clone(),
            wake: self.abort_wake.clone(),
        }
    }

    /// Run one command to a terminal state. The stream is single-shot
    /// per request; response lines are processed strictly in arrival
    /// order and none are processed after the terminal transition.
    pub async fn run(
        &mut self,
        command: &mut impl ShellCommand,
        progress: &mut impl ProgressSink,
    ) -> Result<()> {
        let result = self.drive(command, progress).await;
        self.state.set(match &result {
            Ok(()) => RequestState::Completed,
            Err(Error::Aborted) => RequestState::Aborted,
            Err(_) => RequestState::Errored,
        });
        result
    }

    async fn drive(
        &mut self,
        command: &mut impl ShellCommand,
        progress: &mut impl ProgressSink,
    ) -> Result<()> {
        if self.abort_flag.get() {
            // Abort before start is legal; never touch the transport.
            return Err(Error::Aborted);
        }
        self.state.set(RequestState::Sent);

        let mut line = command.command_line();
        debug!("shell > {line}");
        line.push('\n');
        self.writer
            .write_all(line.as_bytes(), FlowControl::default(), |_| {})
            .await?;

        if let Some(transfer) = command.immediate_transfer() {
            self.send_transfer(&transfer, progress).await?;
        }

        loop {
            let line = self.next_line().await?;
            debug!("shell < {line}");
            match command.on_line(&line)? {
                Verdict::Continue => {}
                Verdict::Complete => return Ok(()),
                Verdict::BeginTransfer => match command.gated_transfer() {
                    Some(transfer) => self.send_transfer(&transfer, progress).await?,
                    None => warn!("command asked to begin a transfer but has no body"),
                },
            }
        }
    }

    async fn next_line(&mut self) -> Result<String> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(line);
            }
            if self.abort_flag.get() {
                return Err(Error::Aborted);
            }
            let event = {
                let frame = async { StreamEvent::Frame(self.rx.next().await) };
                let timeout = async {
                    self.clock.sleep(self.response_timeout).await;
                    StreamEvent::TimedOut
                };
                let aborted = async {
                    self.abort_wake.wait().await;
                    StreamEvent::Aborted
                };
                future::or(frame, future::or(timeout, aborted)).await
            };
            match event {
                StreamEvent::Frame(Some(bytes)) => {
                    let lines = self.decoder.feed(&bytes)?;
                    self.pending.extend(lines);
                }
                StreamEvent::Frame(None) => return Err(Error::Disconnected),
                StreamEvent::TimedOut => return Err(Error::ResponseTimeout),
                StreamEvent::Aborted => return Err(Error::Aborted),
            }
        }
    }

    async fn send_transfer(
        &self,
        transfer: &Transfer<'_>,
        progress: &mut impl ProgressSink,
    ) -> Result<()> {
        let total = transfer.data.len();
        let page = transfer
            .flow
            .page_size
            .unwrap_or_else(|| self.writer.page_limit())
            .max(1);
        let mut sent = 0;
        while sent < total {
            // Abort must bite between pages, mid-transfer included.
            if self.abort_flag.get() {
                return Err(Error::Aborted);
            }
            let n = self.writer.write(transfer.data, Some(page), sent).await?;
            sent += n;
            progress.on_progress(sent, total);
            if sent < total {
                if let Some(interval) = transfer.flow.page_interval {
                    self.clock.sleep(interval).await;
                }
            }
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────
