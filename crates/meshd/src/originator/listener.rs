//! Mesh frame listener and route expiry.
//!
//! Every datagram on the mesh socket goes through the originator protocol.
//! Accepted advertisements are re-emitted on every link except the one they
//! arrived on; probes are answered straight back to the sender.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use mesh_services::{OriginatorProtocol, Reaction};

use super::{send, Links};

/// Receive and handle mesh frames.
///
/// Runs forever. Cancel by dropping the task handle.
pub async fn listener_loop(
    protocol: Arc<OriginatorProtocol>,
    socket: Arc<UdpSocket>,
    links: Arc<Links>,
) {
    let mut buf = vec![0u8; 1500];

    tracing::info!(links = links.len(), "originator listener starting");

    loop {
        let (len, peer_addr) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "recv_from failed");
                continue;
            }
        };

        let scope_id = match peer_addr {
            SocketAddr::V6(v6) => v6.scope_id(),
            SocketAddr::V4(_) => {
                tracing::warn!("received IPv4 datagram on IPv6 socket, ignoring");
                continue;
            }
        };
        let Some(link) = links.by_scope(scope_id) else {
            tracing::trace!(%peer_addr, "datagram from an unknown link");
            continue;
        };

        match protocol.handle_datagram(&buf[..len], link.id, Instant::now()) {
            Ok(Reaction::Forward(message)) => {
                for other in links.iter().filter(|l| l.id != link.id) {
                    let bytes = protocol.outgoing(message, other.id);
                    send(&socket, &bytes, links.multicast_dest(other)).await;
                }
            }
            Ok(Reaction::Reply(bytes)) => send(&socket, &bytes, peer_addr).await,
            Ok(Reaction::Nothing) => {}
            Err(e) => tracing::trace!(error = %e, %peer_addr, "dropped datagram"),
        }
    }
}

/// Evict routes that have not been refreshed within the staleness window.
///
/// Runs forever. Cancel by dropping the task handle.
pub async fn sweep_loop(protocol: Arc<OriginatorProtocol>, every: Duration) {
    let mut interval = tokio::time::interval(every);

    loop {
        interval.tick().await;

        let evicted = protocol.sweep(Instant::now());
        if !evicted.is_empty() {
            tracing::debug!(removed = evicted.len(), "expired route table entries");
        }
    }
}
