//! carelink-probe: scan, classify, connect, fetch history.
//!
//! Thin field tool over the library. Scans for CareLink peripherals,
//! prints what it classified, and if given an address connects and
//! runs a `trace` request over the shell.
//!
//! ```text
//! carelink-probe                     # scan and list
//! carelink-probe AA:BB:CC:DD:EE:FF  # connect + trace
//! ```
//!
//! btleplug's BlueZ backend needs a tokio reactor, so this binary runs
//! a current-thread runtime with a LocalSet; the library itself is
//! executor-agnostic.

use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use log::{Level, LevelFilter, Metadata, Record, info};

use carelink::bridge::btleplug::BtleplugBridge;
use carelink::clock::SystemClock;
use carelink::shell::{NullProgress, requests::TraceHistory};
use carelink::{LinkConfig, LinkHost};

// ── Logging ───────────────────────────────────────────────────

struct StderrLogger;

impl log::Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:5}] {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

// ── Entry point ───────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Debug);

    let target = std::env::args().nth(1);

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            let bridge = Rc::new(BtleplugBridge::new().await.context("bridge init")?);
            let clock = Rc::new(SystemClock::new());
            let host = Rc::new(LinkHost::new(bridge, clock, LinkConfig::default()));

            {
                let host = host.clone();
                tokio::task::spawn_local(async move { host.run().await });
            }

            if !host.is_enabled().await {
                anyhow::bail!("bluetooth adapter is not enabled");
            }

            match target {
                None => list_devices(&host).await,
                Some(address) => trace_device(&host, &address).await,
            }
        })
        .await
}

async fn list_devices(host: &LinkHost<BtleplugBridge, SystemClock>) -> Result<()> {
    info!("scanning for 15 seconds");
    let sub = host.scan();
    let deadline = tokio::time::sleep(Duration::from_secs(15));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => break,
            found = sub.next() => match found {
                Some(Ok(p)) => {
                    let name = p.name.as_ref().map_or("<unnamed>", |n| n.as_str());
                    println!("{}  {}  {}  rssi {}", p.address, p.kind, name, p.rssi);
                }
                Some(Err(e)) => anyhow::bail!("scan failed: {e}"),
                None => break,
            },
        }
    }
    host.stop_scan();
    Ok(())
}

async fn trace_device(
    host: &LinkHost<BtleplugBridge, SystemClock>,
    address: &str,
) -> Result<()> {
    info!("connecting to {address}");
    let conn = host.connect(address).await.context("connect")?;
    info!("connected (mtu {})", conn.mtu());

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut shell = host.shell(&conn).await;
    let mut trace = TraceHistory::new(now, 0);
    shell.run(&mut trace, &mut NullProgress).await.context("trace")?;

    println!("{} rows, latest timestamp {}", trace.rows.len(), trace.latest_timestamp);
    for row in &trace.rows {
        let values: Vec<String> = row.values.iter().map(|v| format!("{v:.2}")).collect();
        println!("{:>12}  {}", row.timestamp, values.join(","));
    }

    host.disconnect(address).await;
    Ok(())
}
