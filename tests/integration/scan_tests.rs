//! Scan coordinator scenarios: restart-on-expiry, deferred teardown,
//! rejection surfacing, discovery through the event pump.

use crate::harness::{diaper_adv, ms, rig, rig_with, settle, spawn_host};

use carelink::error::Error;
use carelink::{DeviceKind, LinkConfig};
use edge_executor::LocalExecutor;
use futures_lite::future::block_on;

#[test]
fn active_scan_restarts_after_expiry() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let sub = r.host.scan();
        settle().await;
        assert_eq!(r.bridge.start_scan_count(), 1);
        assert_eq!(r.bridge.stop_scan_count(), 0);

        // Window expires at t=10s: exactly one stop, restart pending.
        r.clock.advance(ms(10_000));
        settle().await;
        assert_eq!(r.bridge.stop_scan_count(), 1);
        assert_eq!(r.bridge.start_scan_count(), 1);

        // Restart pause elapses: scan runs again.
        r.clock.advance(ms(1_000));
        settle().await;
        assert_eq!(r.bridge.start_scan_count(), 2);
        assert_eq!(r.host.scanner().restart_count(), 1);

        // The subscriber never saw a terminal frame.
        assert!(sub.try_next().is_none());
        assert!(!sub.is_ended());
    }));
}

#[test]
fn unsubscribe_then_resubscribe_within_grace_keeps_native_scan() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let sub = r.host.scan();
        settle().await;
        assert_eq!(r.bridge.start_scan_count(), 1);

        drop(sub);
        r.clock.advance(ms(3_000));
        settle().await;

        // New subscriber arrives inside the 5s grace window.
        let _sub2 = r.host.scan();
        r.clock.advance(ms(4_000));
        settle().await;

        // No teardown happened at all; still the original session.
        assert_eq!(r.bridge.stop_scan_count(), 0);
        assert_eq!(r.bridge.start_scan_count(), 1);
    }));
}

#[test]
fn scan_released_after_grace_with_no_subscribers() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let sub = r.host.scan();
        settle().await;
        assert_eq!(r.bridge.start_scan_count(), 1);

        drop(sub);
        settle().await;
        r.clock.advance(ms(5_000));
        settle().await;

        // Exactly one stop, and nothing restarts afterwards.
        assert_eq!(r.bridge.stop_scan_count(), 1);
        r.clock.advance(ms(30_000));
        settle().await;
        assert_eq!(r.bridge.start_scan_count(), 1);
    }));
}

#[test]
fn start_scan_rejection_terminates_stream_with_error() {
    let r = rig();
    r.bridge.reject_scans("adapter powered off");
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let sub = r.host.scan();
        settle().await;
        match sub.try_next() {
            Some(Err(Error::TransportUnavailable(msg))) => {
                assert!(msg.contains("adapter powered off"));
            }
            other => panic!("expected TransportUnavailable, got {other:?}"),
        }
        assert!(sub.is_ended());
    }));
}

#[test]
fn opportunistic_window_carries_jitter() {
    let r = rig();
    r.clock.set_jitter(ms(2_000));
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let _sub = r.host.opportunistic_scan();
        settle().await;
        assert_eq!(r.bridge.start_scan_count(), 1);

        // Base window 6s; fixed jitter stretches it to 8s.
        r.clock.advance(ms(6_000));
        settle().await;
        assert_eq!(r.bridge.stop_scan_count(), 0);

        r.clock.advance(ms(2_000));
        settle().await;
        assert_eq!(r.bridge.stop_scan_count(), 1);
    }));
}

#[test]
fn discovery_jitter_extends_opportunistic_window() {
    let mut config = LinkConfig::default();
    config.scan.opportunistic_window_ms = 6_000;
    config.scan.opportunistic_jitter_max_ms = 5_000;
    let r = rig_with(config);
    r.clock.set_jitter(ms(1_000));
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let _sub = r.host.opportunistic_scan();
        settle().await;
        assert_eq!(r.bridge.start_scan_count(), 1);

        // Base 6s window plus 1s cycle jitter; a discovery mid-window
        // nudges the cycle another 1s off the advertiser's period.
        r.clock.advance(ms(3_000));
        r.bridge.emit_advertisement("AA:BB:CC:DD:EE:01", -50, &diaper_adv());
        settle().await;

        r.clock.advance(ms(4_000));
        settle().await;
        assert_eq!(r.bridge.stop_scan_count(), 0);

        r.clock.advance(ms(1_000));
        settle().await;
        assert_eq!(r.bridge.stop_scan_count(), 1);
    }));
}

#[test]
fn pump_routes_discoveries_to_subscribers() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let sub = r.host.scan();
        settle().await;

        r.bridge.emit_advertisement("AA:BB:CC:DD:EE:01", -48, &diaper_adv());
        // RSSI 0 sentinel and an unclassifiable advertiser.
        r.bridge.emit_advertisement("AA:BB:CC:DD:EE:02", 0, &diaper_adv());
        r.bridge
            .emit_advertisement("AA:BB:CC:DD:EE:03", -30, &[0x04, 0xFF, 0x4C, 0x00, 0x02]);
        settle().await;

        let first = sub.try_next().unwrap().unwrap();
        assert_eq!(first.kind, DeviceKind::Diaper);
        assert_eq!(first.rssi, -48);
        assert_eq!(first.name.as_ref().unwrap().as_str(), "CL-1");

        let second = sub.try_next().unwrap().unwrap();
        assert_eq!(second.rssi, -100);

        // The foreign advertiser was classified out.
        assert!(sub.try_next().is_none());
    }));
}

#[test]
fn explicit_stop_scan_ends_subscriptions_immediately() {
    let r = rig();
    let ex: LocalExecutor<'_, 16> = LocalExecutor::new();
    spawn_host(&ex, &r.host);

    block_on(ex.run(async {
        let sub = r.host.scan();
        settle().await;
        assert_eq!(r.bridge.start_scan_count(), 1);

        r.host.stop_scan();
        settle().await;

        // No grace window for the explicit stop.
        assert_eq!(r.bridge.stop_scan_count(), 1);
        assert!(sub.try_next().is_none());
        assert!(sub.is_ended());
    }));
}
