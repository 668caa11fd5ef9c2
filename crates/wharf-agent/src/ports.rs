//! Listening-port scanner.
//!
//! A tick-driven collector that enumerates listening TCP sockets from
//! `/proc/net/tcp` and `/proc/net/tcp6`, diffs against the previous
//! snapshot and publishes open/close deltas on a broadcast channel.
//! Enumeration failures leave the snapshot untouched; they never stop the
//! scanner.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, warn};

const PROC_TCP: &str = "/proc/net/tcp";
const PROC_TCP6: &str = "/proc/net/tcp6";
/// Socket state column value for LISTEN.
const TCP_LISTEN: &str = "0A";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortChange {
    Opened,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct PortEvent {
    pub port: u16,
    pub change: PortChange,
}

pub struct PortScanner {
    interval: Duration,
    excluded: BTreeSet<u16>,
    tx: broadcast::Sender<PortEvent>,
}

impl PortScanner {
    pub fn new(interval: Duration, excluded: impl IntoIterator<Item = u16>) -> Self {
        let (tx, _) = broadcast::channel(256);
        PortScanner {
            interval,
            excluded: excluded.into_iter().collect(),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PortEvent> {
        self.tx.subscribe()
    }

    /// Run the scan loop until the process exits. Within one tick all
    /// opened ports are published before any closed port.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut prev = BTreeSet::new();
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let current = match enumerate().await {
                    Ok(ports) => ports
                        .into_iter()
                        .filter(|p| !self.excluded.contains(p))
                        .collect::<BTreeSet<u16>>(),
                    Err(err) => {
                        warn!(%err, "port enumeration failed, keeping previous snapshot");
                        continue;
                    }
                };
                let (added, removed) = diff(&prev, &current);
                for port in added {
                    debug!(port, "port opened");
                    let _ = self.tx.send(PortEvent {
                        port,
                        change: PortChange::Opened,
                    });
                }
                for port in removed {
                    debug!(port, "port closed");
                    let _ = self.tx.send(PortEvent {
                        port,
                        change: PortChange::Closed,
                    });
                }
                prev = current;
            }
        })
    }
}

/// Snapshot delta: ports newly present, then ports that disappeared. Both
/// lists come out in ascending order, which keeps a tick deterministic.
pub fn diff(prev: &BTreeSet<u16>, current: &BTreeSet<u16>) -> (Vec<u16>, Vec<u16>) {
    let added = current.difference(prev).copied().collect();
    let removed = prev.difference(current).copied().collect();
    (added, removed)
}

async fn enumerate() -> std::io::Result<BTreeSet<u16>> {
    let mut ports = BTreeSet::new();
    for path in [PROC_TCP, PROC_TCP6] {
        let contents = tokio::fs::read_to_string(path).await?;
        ports.extend(parse_proc_net_tcp(&contents));
    }
    Ok(ports)
}

/// Parse the kernel's proc net table: one socket per line, local address
/// as `HEXADDR:HEXPORT`, state in the fourth column.
fn parse_proc_net_tcp(contents: &str) -> BTreeSet<u16> {
    let mut ports = BTreeSet::new();
    for line in contents.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let _sl = fields.next();
        let local = match fields.next() {
            Some(f) => f,
            None => continue,
        };
        let _remote = fields.next();
        let state = match fields.next() {
            Some(f) => f,
            None => continue,
        };
        if state != TCP_LISTEN {
            continue;
        }
        if let Some((_, port_hex)) = local.rsplit_once(':') {
            if let Ok(port) = u16::from_str_radix(port_hex, 16) {
                ports.insert(port);
            }
        }
    }
    ports
}
