//! Notification router scenarios: one subscribe per key, ref-counted
//! teardown, complete-on-failure, defensive cleanup of leaked keys.

use std::cell::RefCell;
use std::rc::Rc;

use crate::harness::{rig, settle, spawn_host};

use carelink::Connection;
use carelink::bridge::{BridgeError, CharId};
use carelink::notify::NotificationStream;
use edge_executor::LocalExecutor;
use futures_lite::future::block_on;
use uuid::Uuid;

fn status_key() -> CharId {
    CharId::new(Uuid::from_u128(0xA0), Uuid::from_u128(0xA1))
}

/// Drain a stream into a shared vec; push a `None` marker on
/// completion.
fn collect<const N: usize>(
    ex: &LocalExecutor<'_, N>,
    stream: NotificationStream,
) -> Rc<RefCell<Vec<Option<Vec<u8>>>>> {
    let sink: Rc<RefCell<Vec<Option<Vec<u8>>>>> = Rc::new(RefCell::new(Vec::new()));
    let out = sink.clone();
    ex.spawn(async move {
        loop {
            match stream.next().await {
                Some(frame) => out.borrow_mut().push(Some(frame)),
                None => {
                    out.borrow_mut().push(None);
                    break;
                }
            }
        }
    })
    .detach();
    sink
}

async fn connected(r: &crate::harness::Rig) -> Connection {
    r.bridge.script_connect_success(7, 185);
    r.host.connect("AA:BB:CC:DD:EE:FF").await.unwrap()
}

#[test]
fn one_transport_subscribe_per_key() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let conn = connected(&r).await;
        let a = r.host.router().start(&conn, status_key()).await;
        let b = r.host.router().start(&conn, status_key()).await;
        assert_eq!(r.bridge.subscribe_count(&status_key()), 1);

        r.bridge.emit_notification(7, status_key(), b"one");
        r.bridge.emit_notification(7, status_key(), b"two");
        settle().await;

        let got_a = collect(&ex, a);
        let got_b = collect(&ex, b);
        settle().await;
        let expect = vec![Some(b"one".to_vec()), Some(b"two".to_vec())];
        assert_eq!(&got_a.borrow()[..], &expect[..]);
        assert_eq!(&got_b.borrow()[..], &expect[..]);
    }));
}

#[test]
fn unsubscribe_only_after_last_consumer_detaches() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let conn = connected(&r).await;
        let _a = r.host.router().start(&conn, status_key()).await;
        let _b = r.host.router().start(&conn, status_key()).await;

        r.host.router().stop(&conn, status_key()).await;
        assert_eq!(r.bridge.unsubscribe_count(&status_key()), 0);

        r.host.router().stop(&conn, status_key()).await;
        assert_eq!(r.bridge.unsubscribe_count(&status_key()), 1);

        // Extra stops are harmless.
        r.host.router().stop(&conn, status_key()).await;
        assert_eq!(r.bridge.unsubscribe_count(&status_key()), 1);
    }));
}

#[test]
fn resubscribe_after_full_stop_subscribes_again() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let conn = connected(&r).await;
        let _a = r.host.router().start(&conn, status_key()).await;
        r.host.router().stop(&conn, status_key()).await;
        let _b = r.host.router().start(&conn, status_key()).await;
        assert_eq!(r.bridge.subscribe_count(&status_key()), 2);
    }));
}

#[test]
fn failed_subscribe_completes_channel_cleanly() {
    let r = rig();
    r.bridge.fail_subscribes(BridgeError::Io("att error".into()));
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let conn = connected(&r).await;
        let stream = r.host.router().start(&conn, status_key()).await;
        let got = collect(&ex, stream);
        settle().await;
        // Completed, not errored: exactly one end-of-stream marker.
        assert_eq!(&got.borrow()[..], &[None][..]);
    }));
}

#[test]
fn unroutable_notification_gets_defensive_unsubscribe() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let conn = connected(&r).await;
        let _stream = r.host.router().start(&conn, status_key()).await;

        let leaked = CharId::new(Uuid::from_u128(0xB0), Uuid::from_u128(0xB1));
        r.bridge.emit_notification(7, leaked, b"??");
        settle().await;

        assert_eq!(r.bridge.unsubscribe_count(&leaked), 1);
        // The legitimate channel is untouched.
        assert_eq!(r.bridge.unsubscribe_count(&status_key()), 0);
    }));
}

#[test]
fn disconnect_completes_every_channel() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let conn = connected(&r).await;
        let other = CharId::new(Uuid::from_u128(0xC0), Uuid::from_u128(0xC1));
        let a = r.host.router().start(&conn, status_key()).await;
        let b = r.host.router().start(&conn, other).await;
        let got_a = collect(&ex, a);
        let got_b = collect(&ex, b);

        r.bridge.emit_notification(7, status_key(), b"last");
        r.bridge.emit_disconnect(7);
        settle().await;

        // Data delivered before the drop is drained, then both
        // streams end.
        assert_eq!(
            &got_a.borrow()[..],
            &[Some(b"last".to_vec()), None][..]
        );
        assert_eq!(&got_b.borrow()[..], &[None][..]);
    }));
}
