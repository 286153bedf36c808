//! Originator transport: carries protocol frames over the physical links.
//!
//! One UDP socket serves every link. It is joined to ff02::1 on each
//! interface; the scope id of a link-local sender tells us which link a
//! datagram arrived on, and the scope id on a multicast destination picks
//! the link it leaves on.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use mesh_core::wire::MULTICAST_ADDR;
use mesh_services::LinkId;

pub mod broadcast;
pub mod listener;

/// A physical link the mesh runs over.
#[derive(Debug, Clone)]
pub struct MeshLink {
    pub id: LinkId,
    pub name: String,
    /// OS interface index, from `if_nametoindex`.
    pub index: u32,
}

/// Every link this node is attached to, plus where frames go on each.
#[derive(Debug)]
pub struct Links {
    links: Vec<MeshLink>,
    group: Ipv6Addr,
    port: u16,
}

impl Links {
    /// Resolve interface names. Names that do not exist are skipped with a
    /// warning; at least one must resolve.
    pub fn resolve(names: &[String], port: u16) -> Result<Self> {
        let group: Ipv6Addr = MULTICAST_ADDR.parse().context("multicast group address")?;
        let mut links = Vec::new();
        for name in names {
            match if_index(name) {
                Ok(index) => {
                    let id = LinkId(links.len() as u32);
                    tracing::info!(interface = %name, index, link = id.0, "mesh link");
                    links.push(MeshLink {
                        id,
                        name: name.clone(),
                        index,
                    });
                }
                Err(e) => tracing::warn!(interface = %name, error = %e, "skipping interface"),
            }
        }
        if links.is_empty() {
            anyhow::bail!("none of the interfaces {:?} exist", names);
        }
        Ok(Self { links, group, port })
    }

    pub fn iter(&self) -> impl Iterator<Item = &MeshLink> {
        self.links.iter()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// The link a link-local datagram with this scope id arrived on.
    pub fn by_scope(&self, scope_id: u32) -> Option<&MeshLink> {
        self.links.iter().find(|l| l.index == scope_id)
    }

    /// All-nodes multicast destination on `link`.
    pub fn multicast_dest(&self, link: &MeshLink) -> SocketAddr {
        SocketAddr::V6(SocketAddrV6::new(self.group, self.port, 0, link.index))
    }

    /// Create the shared mesh socket, joined to the group on every link.
    pub fn bind(&self) -> Result<UdpSocket> {
        let socket =
            Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

        socket.set_reuse_address(true).context("SO_REUSEADDR")?;
        socket.set_only_v6(true).context("IPV6_V6ONLY")?;
        socket.set_nonblocking(true).context("set_nonblocking")?;
        // Link-local only; our own frames never need to come back to us.
        socket.set_multicast_hops_v6(1).context("IPV6_MULTICAST_HOPS")?;
        socket.set_multicast_loop_v6(false).context("IPV6_MULTICAST_LOOP")?;

        let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, self.port, 0, 0);
        socket.bind(&bind_addr.into()).context("bind()")?;

        for link in &self.links {
            socket
                .join_multicast_v6(&self.group, link.index)
                .with_context(|| format!("IPV6_JOIN_GROUP on {}", link.name))?;
        }

        UdpSocket::from_std(socket.into()).context("failed to convert to tokio UdpSocket")
    }
}

/// Get the OS interface index for a named network interface.
pub fn if_index(name: &str) -> Result<u32> {
    let name_cstr = std::ffi::CString::new(name).context("interface name contains null byte")?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if index == 0 {
        anyhow::bail!("interface '{}' not found", name);
    }
    Ok(index)
}

/// Send one datagram, logging rather than failing.
pub async fn send(socket: &UdpSocket, bytes: &[u8], dest: SocketAddr) {
    match socket.send_to(bytes, dest).await {
        Ok(n) => tracing::trace!(bytes = n, %dest, "frame sent"),
        Err(e) => tracing::warn!(error = %e, %dest, "frame send failed"),
    }
}
