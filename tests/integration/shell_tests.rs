//! Shell protocol scenarios over the mock link: cat pushes, trace
//! fetches, timeouts, aborts, disconnect invalidation.

use crate::harness::{Rig, ms, outcome, rig, settle, spawn_host};

use carelink::Connection;
use carelink::error::{DecodeError, Error, ProtocolError};
use carelink::session::{shell_rx_char, shell_tx_char};
use carelink::shell::requests::{CatPush, ExportSettings, TraceHistory};
use carelink::shell::{NullProgress, ProgressSink};
use carelink::writer::FlowControl;
use edge_executor::LocalExecutor;
use futures_lite::future::block_on;

const HANDLE: i32 = 7;

async fn connected(r: &Rig) -> Connection {
    r.bridge.script_connect_success(HANDLE, 185);
    r.host.connect("AA:BB:CC:DD:EE:FF").await.unwrap()
}

fn respond(r: &Rig, line: &str) {
    r.bridge
        .emit_notification(HANDLE, shell_rx_char(), line.as_bytes());
}

struct Recorder(Vec<(usize, usize)>);

impl ProgressSink for Recorder {
    fn on_progress(&mut self, sent: usize, total: usize) {
        self.0.push((sent, total));
    }
}

#[test]
fn cat_push_completes_on_status_3() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let conn = connected(&r).await;
        let mut shell = r.host.shell(&conn).await;
        let result = outcome::<Result<(), Error>>();
        {
            let result = result.clone();
            ex.spawn(async move {
                let payload: Vec<u8> = (0u8..64).collect();
                let mut cat = CatPush::new(
                    "test.bin",
                    &payload,
                    FlowControl {
                        page_size: Some(20),
                        page_interval: None,
                    },
                );
                let mut progress = Recorder(Vec::new());
                let outcome = shell.run(&mut cat, &mut progress).await;
                assert_eq!(progress.0, vec![(20, 64), (40, 64), (60, 64), (64, 64)]);
                *result.borrow_mut() = Some(outcome);
            })
            .detach();
        }

        settle().await;
        // Command line and the whole body are on the wire.
        let written = r.bridge.written_bytes(&shell_tx_char());
        let expected_prefix: &[u8] = b"cat test.bin -l=64\n";
        assert_eq!(&written[..expected_prefix.len()], expected_prefix);
        assert_eq!(written.len(), expected_prefix.len() + 64);
        assert!(result.borrow().is_none());

        respond(&r, "3:\n");
        settle().await;
        assert!(matches!(result.borrow().as_ref(), Some(Ok(()))));
    }));
}

#[test]
fn cat_push_fails_on_error_status() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let conn = connected(&r).await;
        let mut shell = r.host.shell(&conn).await;
        let result = outcome::<Result<(), Error>>();
        {
            let result = result.clone();
            ex.spawn(async move {
                let mut cat = CatPush::new("test.bin", b"abc", FlowControl::default());
                *result.borrow_mut() = Some(shell.run(&mut cat, &mut NullProgress).await);
            })
            .detach();
        }
        settle().await;
        respond(&r, "1:bad\n");
        settle().await;
        assert!(matches!(
            result.borrow().as_ref(),
            Some(Err(Error::ProtocolFailure(ProtocolError::Status(1))))
        ));
    }));
}

#[test]
fn malformed_response_line_is_fatal() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let conn = connected(&r).await;
        let mut shell = r.host.shell(&conn).await;
        let result = outcome::<Result<(), Error>>();
        {
            let result = result.clone();
            ex.spawn(async move {
                let mut export = ExportSettings {
                    buzzer: true,
                    temp_low: 36.0,
                    temp_high: 38.5,
                    humidity_low: 40,
                    humidity_high: 80,
                };
                *result.borrow_mut() = Some(shell.run(&mut export, &mut NullProgress).await);
            })
            .detach();
        }
        settle().await;
        respond(&r, "this is not a status line\n");
        settle().await;
        assert!(matches!(
            result.borrow().as_ref(),
            Some(Err(Error::Decoding(DecodeError::MalformedLine(_))))
        ));
    }));
}

#[test]
fn trace_accumulates_rows_and_max_timestamp() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let conn = connected(&r).await;
        let mut shell = r.host.shell(&conn).await;
        let result = outcome::<(usize, u64, Result<(), Error>)>();
        {
            let result = result.clone();
            ex.spawn(async move {
                let mut trace = TraceHistory::new(1_700_000_100, 0);
                let run = shell.run(&mut trace, &mut NullProgress).await;
                *result.borrow_mut() = Some((trace.rows.len(), trace.latest_timestamp, run));
            })
            .detach();
        }
        settle().await;
        assert_eq!(
            r.bridge.written_bytes(&shell_tx_char()),
            b"trace 1700000100 0\n"
        );

        // Firmware replays its ring buffer: timestamps may descend.
        respond(&r, "65a0f264 36.5,52\n");
        respond(&r, "65a0f1a0 36.4,51\n65a0f2c8 36.6,54\n");
        respond(&r, "\n");
        settle().await;

        let borrowed = result.borrow();
        let (rows, latest, run) = borrowed.as_ref().unwrap();
        assert!(run.is_ok());
        assert_eq!(*rows, 3);
        assert_eq!(*latest, 0x65A0_F2C8);
    }));
}

#[test]
fn silence_times_out_the_request() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let conn = connected(&r).await;
        let mut shell = r.host.shell(&conn).await;
        let result = outcome::<Result<(), Error>>();
        {
            let result = result.clone();
            ex.spawn(async move {
                let mut trace = TraceHistory::new(100, 0);
                *result.borrow_mut() = Some(shell.run(&mut trace, &mut NullProgress).await);
            })
            .detach();
        }
        settle().await;
        assert!(result.borrow().is_none());

        r.clock.advance(ms(10_000));
        settle().await;
        assert!(matches!(
            result.borrow().as_ref(),
            Some(Err(Error::ResponseTimeout))
        ));
    }));
}

#[test]
fn abort_stops_transfer_mid_flight() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let conn = connected(&r).await;
        let mut shell = r.host.shell(&conn).await;
        let abort = shell.abort_handle();
        let result = outcome::<Result<(), Error>>();
        {
            let result = result.clone();
            ex.spawn(async move {
                let payload = vec![0u8; 100];
                let mut cat = CatPush::new(
                    "big.bin",
                    &payload,
                    FlowControl {
                        page_size: Some(20),
                        page_interval: Some(ms(30)),
                    },
                );
                *result.borrow_mut() = Some(shell.run(&mut cat, &mut NullProgress).await);
            })
            .detach();
        }

        // First page out, writer parked on the inter-page timer.
        settle().await;
        let writes_before = r.bridge.write_count(&shell_tx_char());
        assert_eq!(writes_before, 2); // command line + first page

        abort.abort();
        r.clock.advance(ms(30));
        settle().await;
        assert!(matches!(
            result.borrow().as_ref(),
            Some(Err(Error::Aborted))
        ));
        // No further pages went out after the abort.
        assert_eq!(r.bridge.write_count(&shell_tx_char()), writes_before);
    }));
}

#[test]
fn abort_before_start_never_touches_transport() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let conn = connected(&r).await;
        let mut shell = r.host.shell(&conn).await;
        shell.abort_handle().abort();

        let mut export = ExportSettings {
            buzzer: false,
            temp_low: 0.0,
            temp_high: 0.0,
            humidity_low: 0,
            humidity_high: 0,
        };
        let result = shell.run(&mut export, &mut NullProgress).await;
        assert!(matches!(result, Err(Error::Aborted)));
        assert_eq!(r.bridge.write_count(&shell_tx_char()), 0);
    }));
}

#[test]
fn disconnect_fails_outstanding_request() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let conn = connected(&r).await;
        let mut shell = r.host.shell(&conn).await;
        let result = outcome::<Result<(), Error>>();
        {
            let result = result.clone();
            ex.spawn(async move {
                let mut trace = TraceHistory::new(100, 0);
                *result.borrow_mut() = Some(shell.run(&mut trace, &mut NullProgress).await);
            })
            .detach();
        }
        settle().await;
        assert!(result.borrow().is_none());

        r.bridge.emit_disconnect(HANDLE);
        settle().await;
        assert!(matches!(
            result.borrow().as_ref(),
            Some(Err(Error::Disconnected))
        ));
    }));
}
