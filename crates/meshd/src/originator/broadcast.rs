//! Periodic originator advertisements and latency probes.
//!
//! Each round sends this node's advertisement, with a fresh sequence
//! number, to the all-nodes group on every link.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::time;

use mesh_services::OriginatorProtocol;

use super::{send, Links};

/// Advertise this node on every link at a fixed interval.
///
/// Runs forever. Cancel by dropping the task handle.
pub async fn broadcast_loop(
    protocol: Arc<OriginatorProtocol>,
    socket: Arc<UdpSocket>,
    links: Arc<Links>,
    every: Duration,
) {
    let mut interval = time::interval(every);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    tracing::info!(
        origin = %protocol.local(),
        links = links.len(),
        interval_ms = every.as_millis() as u64,
        "originator broadcast starting"
    );

    loop {
        interval.tick().await;

        let advert = protocol.next_advertisement();
        for link in links.iter() {
            let bytes = protocol.outgoing(advert, link.id);
            send(&socket, &bytes, links.multicast_dest(link)).await;
        }
        tracing::trace!(seq = advert.sequence, "originator advertised");
    }
}

/// Probe neighbours on every link so link latency stays current.
///
/// Runs forever. Cancel by dropping the task handle.
pub async fn probe_loop(
    protocol: Arc<OriginatorProtocol>,
    socket: Arc<UdpSocket>,
    links: Arc<Links>,
    every: Duration,
) {
    let mut interval = time::interval(every);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        for link in links.iter() {
            let probe = protocol.make_probe(Instant::now());
            send(&socket, &probe, links.multicast_dest(link)).await;
        }
    }
}
