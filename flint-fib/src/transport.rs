//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;

use bitflags::bitflags;
use derive_new::new;
use flint_utils::UnboundedReceiver;
use flint_utils::southbound::{KernelNexthop, KernelRoute, KernelRouteKey};
use futures::{StreamExt, TryStreamExt};
use ipnetwork::IpNetwork;
use netlink_packet_core::NetlinkPayload;
use netlink_packet_route::constants::{
    AF_INET, AF_INET6, ARPHRD_LOOPBACK, IFF_RUNNING, RTNLGRP_NEIGH,
    RTN_BLACKHOLE,
};
use netlink_packet_route::rtnl::RtnlMessage;
use netlink_packet_route::route::nlas::Nla as RouteNla;
use netlink_sys::{AsyncSocket, SocketAddr};
use rtnetlink::{Handle, IpVersion, new_connection};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, trace};

use crate::error::Error;
use crate::route;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct LinkFlags: u8 {
        const LOOPBACK = 0x01;
        const OPERATIVE = 0x02;
    }
}

// One entry of the kernel link table.
#[derive(Clone, Debug, Eq, PartialEq, new)]
pub struct LinkInfo {
    pub ifname: String,
    pub ifindex: u32,
    pub flags: LinkFlags,
}

// Kernel neighbor table change, re-exported to registered observers.
#[derive(Clone, Debug, Default, new)]
#[derive(Deserialize, Serialize)]
pub struct NeighborUpdate {
    pub added: Vec<IpAddr>,
    pub removed: Vec<IpAddr>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteTableKind {
    Unicast,
    Mpls,
}

/// Kernel route programming transport.
///
/// The facade drives all kernel interaction through this seam; unit tests
/// substitute an in-memory mock for the real netlink connection.
pub trait FibTransport: Send + Sync + 'static {
    /// Adds or replaces one route.
    fn add_route(
        &self,
        route: &KernelRoute,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Deletes one route.
    fn del_route(
        &self,
        protocol_id: u8,
        key: &KernelRouteKey,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Replaces the whole route set of one protocol ID, computing the
    /// difference against the kernel's current state.
    fn sync_routes(
        &self,
        protocol_id: u8,
        kind: RouteTableKind,
        routes: Vec<KernelRoute>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// Reads back the routes installed under one protocol ID.
    fn get_routes(
        &self,
        protocol_id: u8,
        kind: RouteTableKind,
    ) -> impl Future<Output = Result<Vec<KernelRoute>, Error>> + Send;

    /// Counts the routes installed by this agent.
    fn route_count(&self) -> impl Future<Output = Result<i64, Error>> + Send;

    /// Enumerates the kernel link table.
    fn get_all_links(
        &self,
    ) -> impl Future<Output = Result<Vec<LinkInfo>, Error>> + Send;

    /// Returns the stream of kernel neighbor table changes. Only the
    /// first subscription receives updates.
    fn subscribe_neighbors(&self) -> UnboundedReceiver<NeighborUpdate>;
}

/// The real transport, over rtnetlink.
#[derive(Debug)]
pub struct NetlinkTransport {
    handle: Handle,
    neighbor_rx: Mutex<Option<UnboundedReceiver<NeighborUpdate>>>,
}

// ===== impl NetlinkTransport =====

impl NetlinkTransport {
    /// Creates the netlink connections and starts the neighbor monitor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn init() -> NetlinkTransport {
        // Create netlink socket.
        let (conn, handle, _) =
            new_connection().expect("Failed to create netlink socket");

        // Serve requests initiated by the netlink handle on a separate
        // thread.
        std::thread::spawn(|| futures::executor::block_on(conn));

        // Start the neighbor monitor on a second connection subscribed to
        // the neighbor multicast group.
        let (mut conn, _, mut monitor) =
            new_connection().expect("Failed to create netlink socket");
        let groups = 1 << (RTNLGRP_NEIGH - 1);
        let addr = SocketAddr::new(0, groups);
        conn.socket_mut()
            .socket_mut()
            .bind(&addr)
            .expect("Failed to bind netlink socket");
        tokio::spawn(conn);

        let (neighbor_tx, neighbor_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some((msg, _)) = monitor.next().await {
                let NetlinkPayload::InnerMessage(msg) = msg.payload else {
                    continue;
                };
                let update = match msg {
                    RtnlMessage::NewNeighbour(msg) => {
                        trace!(?msg, "received RTM_NEWNEIGH message");
                        neighbour_addr(&msg)
                            .map(|addr| NeighborUpdate::new(vec![addr], vec![]))
                    }
                    RtnlMessage::DelNeighbour(msg) => {
                        trace!(?msg, "received RTM_DELNEIGH message");
                        neighbour_addr(&msg)
                            .map(|addr| NeighborUpdate::new(vec![], vec![addr]))
                    }
                    _ => None,
                };
                if let Some(update) = update
                    && neighbor_tx.send(update).is_err()
                {
                    return;
                }
            }
        });

        NetlinkTransport {
            handle,
            neighbor_rx: Mutex::new(Some(neighbor_rx)),
        }
    }

    async fn get_routes_af(
        &self,
        protocol_id: u8,
        ip_version: IpVersion,
    ) -> Result<Vec<KernelRoute>, Error> {
        let mut routes = Vec::new();

        let mut stream = self.handle.route().get(ip_version).execute();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|error| Error::NetlinkFailure(error.to_string()))?
        {
            if msg.header.protocol != protocol_id {
                continue;
            }

            // Fetch route attributes.
            let mut destination = None;
            let mut gateway = None;
            let mut oif = None;
            let mut priority = route::UNKNOWN_ADMIN_DISTANCE;
            for nla in msg.nlas.iter() {
                match nla {
                    RouteNla::Destination(bytes) => {
                        destination = parse_ip(msg.header.address_family, bytes)
                    }
                    RouteNla::Gateway(bytes) => {
                        gateway = parse_ip(msg.header.address_family, bytes)
                    }
                    RouteNla::Oif(ifindex) => oif = Some(*ifindex),
                    RouteNla::Priority(metric) => priority = *metric as u8,
                    _ => (),
                }
            }
            let Some(destination) = destination else {
                continue;
            };
            let Ok(prefix) = IpNetwork::new(
                destination,
                msg.header.destination_prefix_length,
            ) else {
                continue;
            };

            let nexthops = match (msg.header.kind == RTN_BLACKHOLE, gateway) {
                (true, _) | (false, None) => Vec::new(),
                (false, Some(gateway)) => {
                    vec![KernelNexthop::new(gateway, oif, None, 0)]
                }
            };
            routes.push(KernelRoute::new(
                protocol_id,
                priority,
                KernelRouteKey::Unicast(prefix),
                nexthops,
            ));
        }

        Ok(routes)
    }
}

impl FibTransport for NetlinkTransport {
    async fn add_route(&self, route: &KernelRoute) -> Result<(), Error> {
        match &route.key {
            KernelRouteKey::Unicast(prefix) => {
                // Create netlink request.
                let mut request = self.handle.route().add();
                request = request.protocol(route.protocol_id);

                match prefix {
                    IpNetwork::V4(prefix) => {
                        let mut request = request
                            .v4()
                            .replace()
                            .destination_prefix(prefix.ip(), prefix.prefix());
                        request
                            .message_mut()
                            .nlas
                            .push(RouteNla::Priority(route.priority as u32));
                        if route.is_blackhole() {
                            request.message_mut().header.kind = RTN_BLACKHOLE;
                        }
                        for nexthop in route.nexthops.iter() {
                            if let IpAddr::V4(gateway) = nexthop.gateway {
                                request = request.gateway(gateway);
                            }
                            if let Some(ifindex) = nexthop.ifindex {
                                request = request.output_interface(ifindex);
                            }
                        }

                        // Execute request.
                        request.execute().await.map_err(|error| {
                            Error::NetlinkFailure(error.to_string())
                        })
                    }
                    IpNetwork::V6(prefix) => {
                        let mut request = request
                            .v6()
                            .replace()
                            .destination_prefix(prefix.ip(), prefix.prefix());
                        request
                            .message_mut()
                            .nlas
                            .push(RouteNla::Priority(route.priority as u32));
                        if route.is_blackhole() {
                            request.message_mut().header.kind = RTN_BLACKHOLE;
                        }
                        for nexthop in route.nexthops.iter() {
                            if let IpAddr::V6(gateway) = nexthop.gateway {
                                request = request.gateway(gateway);
                            }
                            if let Some(ifindex) = nexthop.ifindex {
                                request = request.output_interface(ifindex);
                            }
                        }

                        // Execute request.
                        request.execute().await.map_err(|error| {
                            Error::NetlinkFailure(error.to_string())
                        })
                    }
                }
            }
            KernelRouteKey::Mpls(label) => {
                // TODO: not supported by the `rtnetlink` crate yet.
                trace!(%label, "skipping MPLS route install");
                Ok(())
            }
        }
    }

    async fn del_route(
        &self,
        protocol_id: u8,
        key: &KernelRouteKey,
    ) -> Result<(), Error> {
        match key {
            KernelRouteKey::Unicast(prefix) => {
                // Create netlink request.
                let mut request = self.handle.route().add();
                request = request.protocol(protocol_id);

                match prefix {
                    IpNetwork::V4(prefix) => {
                        let mut request = request
                            .v4()
                            .destination_prefix(prefix.ip(), prefix.prefix());

                        // Execute request.
                        let request = self
                            .handle
                            .route()
                            .del(request.message_mut().clone());
                        request.execute().await.map_err(|error| {
                            Error::NetlinkFailure(error.to_string())
                        })
                    }
                    IpNetwork::V6(prefix) => {
                        let mut request = request
                            .v6()
                            .destination_prefix(prefix.ip(), prefix.prefix());

                        // Execute request.
                        let request = self
                            .handle
                            .route()
                            .del(request.message_mut().clone());
                        request.execute().await.map_err(|error| {
                            Error::NetlinkFailure(error.to_string())
                        })
                    }
                }
            }
            KernelRouteKey::Mpls(label) => {
                // TODO: not supported by the `rtnetlink` crate yet.
                trace!(%label, "skipping MPLS route uninstall");
                Ok(())
            }
        }
    }

    async fn sync_routes(
        &self,
        protocol_id: u8,
        kind: RouteTableKind,
        routes: Vec<KernelRoute>,
    ) -> Result<(), Error> {
        let current = self.get_routes(protocol_id, kind).await?;
        let target = routes
            .into_iter()
            .map(|route| (route.key, route))
            .collect::<BTreeMap<_, _>>();

        // Uninstall stale routes, then add/replace the target set.
        for route in current
            .iter()
            .filter(|route| !target.contains_key(&route.key))
        {
            self.del_route(protocol_id, &route.key).await?;
        }
        for route in target.values() {
            self.add_route(route).await?;
        }

        Ok(())
    }

    async fn get_routes(
        &self,
        protocol_id: u8,
        kind: RouteTableKind,
    ) -> Result<Vec<KernelRoute>, Error> {
        match kind {
            RouteTableKind::Unicast => {
                let mut routes =
                    self.get_routes_af(protocol_id, IpVersion::V4).await?;
                routes.extend(
                    self.get_routes_af(protocol_id, IpVersion::V6).await?,
                );
                Ok(routes)
            }
            RouteTableKind::Mpls => {
                // TODO: not supported by the `rtnetlink` crate yet.
                Ok(Vec::new())
            }
        }
    }

    async fn route_count(&self) -> Result<i64, Error> {
        let mut count = 0;
        for ip_version in [IpVersion::V4, IpVersion::V6] {
            let mut stream = self.handle.route().get(ip_version).execute();
            while let Some(msg) = stream
                .try_next()
                .await
                .map_err(|error| Error::NetlinkFailure(error.to_string()))?
            {
                if route::PROTOCOL_ID_RANGE.contains(&msg.header.protocol) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    async fn get_all_links(&self) -> Result<Vec<LinkInfo>, Error> {
        use netlink_packet_route::link::nlas::Nla;

        let mut links = Vec::new();

        let mut stream = self.handle.link().get().execute();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|error| Error::NetlinkFailure(error.to_string()))?
        {
            let ifindex = msg.header.index;
            let mut flags = LinkFlags::empty();
            if msg.header.link_layer_type == ARPHRD_LOOPBACK {
                flags.insert(LinkFlags::LOOPBACK);
            }
            if msg.header.flags & IFF_RUNNING != 0 {
                flags.insert(LinkFlags::OPERATIVE);
            }
            let mut ifname = None;
            for nla in msg.nlas.into_iter() {
                match nla {
                    Nla::IfName(nla_ifname) => ifname = Some(nla_ifname),
                    _ => (),
                }
            }
            let Some(ifname) = ifname else {
                continue;
            };

            links.push(LinkInfo::new(ifname, ifindex, flags));
        }

        Ok(links)
    }

    fn subscribe_neighbors(&self) -> UnboundedReceiver<NeighborUpdate> {
        match self.neighbor_rx.lock().unwrap().take() {
            Some(neighbor_rx) => neighbor_rx,
            None => {
                error!("kernel neighbor updates already subscribed");
                mpsc::unbounded_channel().1
            }
        }
    }
}

// ===== helper functions =====

fn neighbour_addr(
    msg: &netlink_packet_route::NeighbourMessage,
) -> Option<IpAddr> {
    use netlink_packet_route::neighbour::nlas::Nla;

    for nla in msg.nlas.iter() {
        if let Nla::Destination(bytes) = nla {
            return parse_ip(msg.header.family, bytes);
        }
    }
    None
}

fn parse_ip(family: u8, bytes: &[u8]) -> Option<IpAddr> {
    match family as u16 {
        AF_INET => {
            let addr: [u8; 4] = bytes.try_into().ok()?;
            Some(Ipv4Addr::from(addr).into())
        }
        AF_INET6 => {
            let addr: [u8; 16] = bytes.try_into().ok()?;
            Some(Ipv6Addr::from(addr).into())
        }
        _ => None,
    }
}
