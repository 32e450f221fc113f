//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::HashMap;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::{LazyLock, Mutex};
use std::time::Instant;

use bytes::Bytes;
use tokio::net::UdpSocket;

// Link-local multicast group and UDP port used for neighbor discovery.
pub const DISCOVERY_GROUP: Ipv6Addr =
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);
pub const DISCOVERY_PORT: u16 = 6666;

// A received datagram, together with the interface it arrived on and its
// receive timestamp.
#[derive(Clone, Debug)]
pub struct RxPacket {
    pub ifname: String,
    pub data: Bytes,
    pub recv_ts_us: u64,
}

// Destination of an outgoing datagram.
#[derive(Clone, Copy, Debug)]
pub enum PacketDest {
    // The discovery multicast group.
    Multicast,
    // A specific peer, by its link-local address.
    Unicast(Ipv6Addr),
}

/// Packet I/O provider.
///
/// The engine sends and receives all datagrams through this seam, which
/// lets tests substitute a simulated network with configurable per-link
/// delays for the real sockets.
pub trait PacketIo: Send + Sync + 'static {
    /// Starts receiving discovery traffic on the given interface.
    fn bind_interface(
        &self,
        ifname: &str,
        ifindex: u32,
    ) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Stops receiving discovery traffic on the given interface.
    fn unbind_interface(
        &self,
        ifname: &str,
    ) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Sends a datagram out the given interface.
    fn send_packet(
        &self,
        ifname: &str,
        dst: PacketDest,
        data: Bytes,
    ) -> impl Future<Output = std::io::Result<()>> + Send;

    /// Receives the next datagram from any bound interface.
    fn recv_packet(
        &self,
    ) -> impl Future<Output = std::io::Result<RxPacket>> + Send;
}

// Returns the current monotonic timestamp, in microseconds since process
// start. RTT math only ever subtracts timestamps taken from the same
// clock, so the epoch is arbitrary.
pub fn now_us() -> u64 {
    static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);
    EPOCH.elapsed().as_micros() as u64
}

/// Packet I/O over UDP and IPv6 link-local multicast.
#[derive(Debug)]
pub struct UdpPacketIo {
    socket: UdpSocket,
    // Interface name <-> ifindex mappings for bound interfaces.
    by_name: Mutex<HashMap<String, u32>>,
    by_index: Mutex<HashMap<u32, String>>,
}

// ===== impl UdpPacketIo =====

impl UdpPacketIo {
    pub async fn new() -> std::io::Result<UdpPacketIo> {
        let socket =
            UdpSocket::bind((Ipv6Addr::UNSPECIFIED, DISCOVERY_PORT)).await?;
        socket.set_multicast_loop_v6(false)?;

        Ok(UdpPacketIo {
            socket,
            by_name: Default::default(),
            by_index: Default::default(),
        })
    }
}

impl PacketIo for UdpPacketIo {
    async fn bind_interface(
        &self,
        ifname: &str,
        ifindex: u32,
    ) -> std::io::Result<()> {
        self.socket.join_multicast_v6(&DISCOVERY_GROUP, ifindex)?;
        self.by_name
            .lock()
            .unwrap()
            .insert(ifname.to_owned(), ifindex);
        self.by_index
            .lock()
            .unwrap()
            .insert(ifindex, ifname.to_owned());
        Ok(())
    }

    async fn unbind_interface(&self, ifname: &str) -> std::io::Result<()> {
        if let Some(ifindex) = self.by_name.lock().unwrap().remove(ifname) {
            self.by_index.lock().unwrap().remove(&ifindex);
            self.socket.leave_multicast_v6(&DISCOVERY_GROUP, ifindex)?;
        }
        Ok(())
    }

    async fn send_packet(
        &self,
        ifname: &str,
        dst: PacketDest,
        data: Bytes,
    ) -> std::io::Result<()> {
        let Some(ifindex) = self.by_name.lock().unwrap().get(ifname).copied()
        else {
            return Err(std::io::Error::from(std::io::ErrorKind::NotFound));
        };

        let addr = match dst {
            PacketDest::Multicast => DISCOVERY_GROUP,
            PacketDest::Unicast(addr) => addr,
        };
        let sockaddr = SocketAddrV6::new(addr, DISCOVERY_PORT, 0, ifindex);
        self.socket.send_to(&data, sockaddr).await?;
        Ok(())
    }

    async fn recv_packet(&self) -> std::io::Result<RxPacket> {
        let mut buf = [0; 4096];

        loop {
            let (num_bytes, src) = self.socket.recv_from(&mut buf).await?;

            // Link-local sources carry the arrival ifindex as their scope ID.
            let SocketAddr::V6(src) = src else {
                continue;
            };
            let Some(ifname) = self
                .by_index
                .lock()
                .unwrap()
                .get(&src.scope_id())
                .cloned()
            else {
                continue;
            };

            return Ok(RxPacket {
                ifname,
                data: Bytes::copy_from_slice(&buf[..num_bytes]),
                recv_ts_us: now_us(),
            });
        }
    }
}
