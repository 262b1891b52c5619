//! Multilink bundle simulator.
//!
//! Runs a sender and a receiver bundle connected by simulated links. Each
//! link serialises frames at its configured bandwidth, adds its latency and
//! optionally drops frames, always keeping its own frame order. Datagrams
//! pushed into the sender are checked on the receiver side, then both
//! bundles' statistics are printed as JSON.
//!
//! # Usage
//!
//! ```bash
//! MP_SIM_CONFIG=bundle.json MP_SIM_DATAGRAMS=500 MP_SIM_LOSS=0.01 cargo run --bin mp-sim
//! ```
//!
//! Without `MP_SIM_CONFIG` two unequal links are used. Setting
//! `MP_SIM_STATS_PORT` serves `/stats` after the run until Ctrl+C.

use log::{debug, error, info, warn};
use ppp_multilink::reassembly::STALE_AFTER;
use ppp_multilink::{
    Bundle, BundleHandle, ChannelTransport, InboundLink, LinkConfig, NodeConfig, StatsServer,
};
use rand_core::{OsRng, RngCore};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Datagrams sent when `MP_SIM_DATAGRAMS` is unset.
const DEFAULT_DATAGRAMS: usize = 200;

/// Largest generated datagram; fits the default link MRU whole.
const MAX_DATAGRAM_LEN: usize = 1400;

/// Give up waiting once nothing was delivered for this long.
const IDLE_TIMEOUT: Duration = Duration::from_secs(4);

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}", name, value);
            default
        }),
        Err(_) => default,
    }
}

fn load_config() -> Result<NodeConfig, String> {
    let Ok(path) = std::env::var("MP_SIM_CONFIG") else {
        return Ok(NodeConfig::multilink(vec![
            LinkConfig::enabled(10_000, 5),
            LinkConfig::enabled(4_000, 20),
        ]));
    };
    let text = std::fs::read_to_string(&path).map_err(|e| format!("{}: {}", path, e))?;
    NodeConfig::from_json(&text).map_err(|e| format!("{}: {}", path, e))
}

/// Distinct, variable-length datagrams; each starts with its index.
fn make_datagrams(count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            let len = 4 + (OsRng.next_u32() as usize % (MAX_DATAGRAM_LEN - 4));
            let mut datagram = (i as u32).to_be_bytes().to_vec();
            datagram.resize(len, i as u8);
            datagram
        })
        .collect()
}

/// Forward frames from the sender's side of a link to the receiver.
async fn simulate_link(
    config: LinkConfig,
    mut wire: mpsc::UnboundedReceiver<Vec<u8>>,
    inbound: InboundLink,
    loss: f64,
) {
    let link = inbound.link();
    let bandwidth = u64::from(config.bandwidth.max(1));
    let latency = Duration::from_millis(u64::from(config.latency_ms));
    let (in_flight, mut arriving) = mpsc::unbounded_channel::<(Instant, Vec<u8>)>();

    // Frames propagate concurrently; only serialisation is sequential
    let receiver = tokio::spawn(async move {
        while let Some((due, frame)) = arriving.recv().await {
            tokio::time::sleep_until(due).await;
            if inbound.deliver(frame).await.is_err() {
                break;
            }
        }
    });

    let mut busy_until = Instant::now();
    while let Some(frame) = wire.recv().await {
        if loss > 0.0 && f64::from(OsRng.next_u32()) / f64::from(u32::MAX) < loss {
            debug!("link {}: frame lost", link);
            continue;
        }
        // Bandwidth is in units of 10 bytes/sec
        let airtime = Duration::from_micros(frame.len() as u64 * 100_000 / bandwidth);
        busy_until = busy_until.max(Instant::now()) + airtime;
        if in_flight.send((busy_until + latency, frame)).is_err() {
            break;
        }
    }
    drop(in_flight);
    let _ = receiver.await;
    debug!("link {}: closed", link);
}

/// True if `received` is an in-order subsequence of `sent`.
fn in_order_subset(sent: &[Vec<u8>], received: &[Vec<u8>]) -> bool {
    let mut sent = sent.iter();
    received.iter().all(|d| sent.any(|s| s == d))
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    let count = env_or("MP_SIM_DATAGRAMS", DEFAULT_DATAGRAMS);
    let loss = env_or("MP_SIM_LOSS", 0.0f64).clamp(0.0, 1.0);
    let stats_port: Option<u16> = std::env::var("MP_SIM_STATS_PORT")
        .ok()
        .and_then(|p| p.parse().ok());

    let (sender, receiver) = match (
        Bundle::new("sender", config.clone()),
        Bundle::new("receiver", config.clone()),
    ) {
        (Ok(s), Ok(r)) => (s, r),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to create bundle: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "=== mp-sim: {} datagrams over {} links, loss {:.1}% ===",
        count,
        config.enabled_links(),
        loss * 100.0
    );

    // Receiver side
    let (delivered_tx, mut delivered_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let rx_handle = BundleHandle::spawn(receiver, ChannelTransport::new(), delivered_tx);

    // Simulated links between the two
    let mut transport = ChannelTransport::new();
    let mut links = Vec::new();
    for (id, link) in config.links.iter().enumerate().filter(|(_, l)| l.enabled) {
        let wire = transport.connect(id);
        links.push(tokio::spawn(simulate_link(
            *link,
            wire,
            rx_handle.inbound(id),
            loss,
        )));
    }

    // Sender side; it never receives, so its datagrams go nowhere
    let (sender_sink, _) = mpsc::unbounded_channel::<Vec<u8>>();
    let tx_handle = BundleHandle::spawn(sender, transport, sender_sink);

    let stats_server = stats_port.and_then(|port| {
        let bundles = vec![tx_handle.stats().clone(), rx_handle.stats().clone()];
        match StatsServer::start(None, port, bundles) {
            Ok(server) => Some(server),
            Err(e) => {
                warn!("Failed to start stats server: {}", e);
                None
            }
        }
    });

    let datagrams = make_datagrams(count);
    let started = Instant::now();
    let mut sent = Vec::new();
    for datagram in datagrams {
        match tx_handle.send(datagram.clone()).await {
            Ok(_) => sent.push(datagram),
            Err(e) => warn!("Send failed: {}", e),
        }
    }

    let mut received = Vec::new();
    while received.len() < sent.len() {
        match tokio::time::timeout(IDLE_TIMEOUT, delivered_rx.recv()).await {
            Ok(Some(datagram)) => received.push(datagram),
            Ok(None) => break,
            Err(_) => {
                // Anything left is older than the staleness threshold by now
                debug!("No delivery for {:?} (stale after {:?})", IDLE_TIMEOUT, STALE_AFTER);
                break;
            }
        }
    }
    let elapsed = started.elapsed();

    let ordered = in_order_subset(&sent, &received);
    let complete = received.len() == sent.len();
    info!(
        "Delivered {}/{} datagrams ({} not sent) in {:.2}s, order {}",
        received.len(),
        sent.len(),
        count - sent.len(),
        elapsed.as_secs_f64(),
        if ordered { "preserved" } else { "BROKEN" }
    );

    println!("{}", tx_handle.stats().to_json());
    println!("{}", rx_handle.stats().to_json());

    if stats_server.is_some() {
        info!("Serving stats (Ctrl+C to exit)...");
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to wait for Ctrl+C: {}", e);
        }
    }

    let _ = tx_handle.shutdown().await;
    let _ = rx_handle.shutdown().await;
    for link in links {
        let _ = link.await;
    }

    if !ordered || (loss <= 0.0 && !complete) {
        error!("Verification failed");
        std::process::exit(1);
    }
}
