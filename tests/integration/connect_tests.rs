//! Connection manager scenarios: sentinel retry, deduplication under
//! concurrency, transport-disconnect teardown through the pump.

use crate::harness::{ms, outcome, rig, settle, spawn_host};

use carelink::Connection;
use carelink::bridge::CharId;
use carelink::error::Error;
use edge_executor::LocalExecutor;
use futures_lite::future::block_on;
use uuid::Uuid;

#[test]
fn sentinel_replies_retry_then_time_out() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let result = outcome::<Result<Connection, Error>>();
        {
            let host = r.host.clone();
            let result = result.clone();
            ex.spawn(async move {
                *result.borrow_mut() = Some(host.connect("AA:BB:CC:DD:EE:FF").await);
            })
            .detach();
        }

        settle().await;
        assert_eq!(r.bridge.connect_count(), 1);

        // Retry once per second while the sentinel keeps coming back.
        for expected in 2..=9 {
            r.clock.advance(ms(1_000));
            settle().await;
            assert_eq!(r.bridge.connect_count(), expected);
        }
        assert!(result.borrow().is_none());

        // One interval past the 8.1s ceiling the attempt fails, with
        // no further transport call.
        r.clock.advance(ms(1_000));
        settle().await;
        assert_eq!(r.bridge.connect_count(), 9);
        assert!(matches!(
            result.borrow().as_ref(),
            Some(Err(Error::ConnectTimeout))
        ));
    }));
}

#[test]
fn concurrent_connects_join_one_attempt() {
    let r = rig();
    // Two sentinels, then success: callers arriving during the retry
    // loop must all ride the same attempt.
    r.bridge.script_connect_sentinels(2);
    r.bridge.script_connect_success(7, 185);
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let first = outcome::<Result<Connection, Error>>();
        let second = outcome::<Result<Connection, Error>>();
        for slot in [&first, &second] {
            let host = r.host.clone();
            let slot = slot.clone();
            ex.spawn(async move {
                *slot.borrow_mut() = Some(host.connect("AA:BB:CC:DD:EE:FF").await);
            })
            .detach();
        }

        settle().await;
        assert_eq!(r.bridge.connect_count(), 1);

        r.clock.advance(ms(1_000));
        settle().await;
        r.clock.advance(ms(1_000));
        settle().await;
        assert_eq!(r.bridge.connect_count(), 3);

        let a = first.borrow_mut().take().unwrap().unwrap();
        let b = second.borrow_mut().take().unwrap().unwrap();
        assert_eq!(a.handle(), 7);
        assert_eq!(b.handle(), 7);

        // A third caller gets the live connection with no new call.
        let c = r.host.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
        assert_eq!(c.handle(), 7);
        assert_eq!(r.bridge.connect_count(), 3);
    }));
}

#[test]
fn transport_disconnect_event_invalidates_connection() {
    let r = rig();
    r.bridge.script_connect_success(4, 23);
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let conn = r.host.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
        assert!(conn.is_connected());

        r.bridge.emit_disconnect(4);
        settle().await;
        assert!(!conn.is_connected());
        assert!(r.host.connections().connection("AA:BB:CC:DD:EE:FF").is_none());

        // Reconnecting issues a fresh transport call.
        r.bridge.script_connect_success(5, 23);
        let again = r.host.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
        assert_eq!(again.handle(), 5);
        assert_eq!(r.bridge.connect_count(), 2);
    }));
}

#[test]
fn characteristic_read_on_live_connection() {
    let r = rig();
    r.bridge.script_connect_success(6, 185);
    r.bridge.script_read(vec![0x64]); // battery: 100%
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let conn = r.host.connect("AA:BB:CC:DD:EE:FF").await.unwrap();
        let key = CharId::new(Uuid::from_u128(0x180F), Uuid::from_u128(0x2A19));
        let value = r.host.read(&conn, key).await.unwrap();
        assert_eq!(value, vec![0x64]);

        // A dead connection fails the read without a transport call.
        r.bridge.emit_disconnect(6);
        settle().await;
        assert!(matches!(
            r.host.read(&conn, key).await,
            Err(Error::Disconnected)
        ));
    }));
}

#[test]
fn disconnect_event_for_unknown_handle_is_ignored() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        r.bridge.emit_disconnect(42);
        settle().await;
        // Nothing to assert beyond "no panic, no calls".
        assert_eq!(r.bridge.connect_count(), 0);
    }));
}
