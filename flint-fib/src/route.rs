//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

use flint_utils::mpls::Label;
use flint_utils::southbound::{
    KernelMplsAction, KernelNexthop, KernelRoute, KernelRouteKey, MplsAction,
    MplsActionCode, MplsRoute, NextHop, UnicastRoute,
};

use crate::error::Error;
use crate::interface::InterfaceCache;
use crate::transport::FibTransport;

// Route programming clients, as they identify themselves on the wire.
pub const CLIENT_ID_BGP: i16 = 0;
pub const CLIENT_ID_STATIC: i16 = 64;
pub const CLIENT_ID_LINK_STATE: i16 = 786;

// Kernel route protocol IDs assigned to each client.
const PROTO_BGP: u8 = 253;
const PROTO_STATIC: u8 = 97;
const PROTO_LINK_STATE: u8 = 99;

// iproute2 protocol IDs in the kernel are a shared resource; the bands
// outside this range belong to well-known protocols and must not be
// claimed by routing agents.
pub(crate) const PROTOCOL_ID_RANGE: std::ops::RangeInclusive<u8> = 17..=253;

// Admin distance assigned to routes whose protocol ID has no entry in the
// static table.
pub(crate) const UNKNOWN_ADMIN_DISTANCE: u8 = 255;

// ===== client and protocol tables =====

// Maps a client ID to its kernel protocol ID.
pub(crate) fn client_to_protocol(client_id: i16) -> Result<u8, Error> {
    let protocol_id = match client_id {
        CLIENT_ID_BGP => PROTO_BGP,
        CLIENT_ID_STATIC => PROTO_STATIC,
        CLIENT_ID_LINK_STATE => PROTO_LINK_STATE,
        _ => return Err(Error::InvalidClient(client_id)),
    };
    check_protocol_id(protocol_id)
}

// Rejects protocol IDs outside the usable kernel range.
pub(crate) fn check_protocol_id(protocol_id: u8) -> Result<u8, Error> {
    if !PROTOCOL_ID_RANGE.contains(&protocol_id) {
        return Err(Error::InvalidProtocolId(protocol_id));
    }
    Ok(protocol_id)
}

// Maps a protocol ID to its kernel priority (admin distance).
pub(crate) fn protocol_to_priority(protocol_id: u8) -> u8 {
    match protocol_id {
        PROTO_LINK_STATE => 10,
        PROTO_BGP => 20,
        PROTO_STATIC => 30,
        _ => UNKNOWN_ADMIN_DISTANCE,
    }
}

// ===== client route -> kernel route =====

pub(crate) async fn build_unicast_route<T: FibTransport>(
    cache: &InterfaceCache,
    transport: &T,
    protocol_id: u8,
    route: &UnicastRoute,
) -> Result<KernelRoute, Error> {
    let nexthops = build_nexthops(cache, transport, &route.nexthops).await?;
    Ok(KernelRoute::new(
        protocol_id,
        protocol_to_priority(protocol_id),
        KernelRouteKey::Unicast(route.dest),
        nexthops,
    ))
}

pub(crate) async fn build_mpls_route<T: FibTransport>(
    cache: &InterfaceCache,
    transport: &T,
    protocol_id: u8,
    route: &MplsRoute,
) -> Result<KernelRoute, Error> {
    if Label::new(route.top_label).is_none() {
        return Err(Error::MalformedRoute("invalid MPLS top label"));
    }

    let nexthops = build_nexthops(cache, transport, &route.nexthops).await?;
    Ok(KernelRoute::new(
        protocol_id,
        protocol_to_priority(protocol_id),
        KernelRouteKey::Mpls(route.top_label),
        nexthops,
    ))
}

// An empty nexthop list translates to a blackhole route; anything else
// resolves interfaces and validates the MPLS action payloads.
async fn build_nexthops<T: FibTransport>(
    cache: &InterfaceCache,
    transport: &T,
    nexthops: &[NextHop],
) -> Result<Vec<KernelNexthop>, Error> {
    let mut kernel_nexthops = Vec::with_capacity(nexthops.len());

    for nexthop in nexthops {
        let mut ifindex = None;
        if let Some(ifname) = &nexthop.ifname {
            ifindex = Some(
                cache.resolve_ifindex(transport, ifname).await.ok_or_else(
                    || Error::UnresolvableInterface(ifname.clone()),
                )?,
            );
        }

        let mpls = match &nexthop.mpls_action {
            Some(action) => {
                Some(build_mpls_action(cache, transport, action, &mut ifindex).await?)
            }
            None => None,
        };

        kernel_nexthops.push(KernelNexthop::new(
            nexthop.address,
            ifindex,
            mpls,
            nexthop.weight,
        ));
    }

    Ok(kernel_nexthops)
}

async fn build_mpls_action<T: FibTransport>(
    cache: &InterfaceCache,
    transport: &T,
    action: &MplsAction,
    ifindex: &mut Option<u32>,
) -> Result<KernelMplsAction, Error> {
    match action.code {
        MplsActionCode::Swap => match action.swap_label {
            Some(label) => Ok(KernelMplsAction::Swap(label)),
            None => Err(Error::MalformedRoute("swap label not provided")),
        },
        MplsActionCode::Push => match &action.push_labels {
            Some(labels) if !labels.is_empty() => {
                Ok(KernelMplsAction::Push(labels.clone()))
            }
            _ => Err(Error::MalformedRoute("push label(s) not provided")),
        },
        MplsActionCode::Php => Ok(KernelMplsAction::Php),
        MplsActionCode::PopAndLookup => {
            // Popped packets are looked up again through the loopback.
            let loopback =
                cache.resolve_loopback(transport).await.ok_or_else(|| {
                    Error::UnresolvableInterface("loopback".to_owned())
                })?;
            *ifindex = Some(loopback);
            Ok(KernelMplsAction::PopAndLookup)
        }
    }
}

// ===== kernel route -> client route =====

pub(crate) async fn to_unicast_routes<T: FibTransport>(
    cache: &InterfaceCache,
    transport: &T,
    routes: Vec<KernelRoute>,
) -> Vec<UnicastRoute> {
    let mut unicast_routes = Vec::with_capacity(routes.len());

    for route in routes {
        let KernelRouteKey::Unicast(dest) = route.key else {
            continue;
        };
        let nexthops = to_nexthops(cache, transport, route.nexthops).await;
        unicast_routes.push(UnicastRoute::new(dest, nexthops));
    }

    unicast_routes
}

pub(crate) async fn to_mpls_routes<T: FibTransport>(
    cache: &InterfaceCache,
    transport: &T,
    routes: Vec<KernelRoute>,
) -> Vec<MplsRoute> {
    let mut mpls_routes = Vec::with_capacity(routes.len());

    for route in routes {
        let KernelRouteKey::Mpls(top_label) = route.key else {
            continue;
        };
        let nexthops = to_nexthops(cache, transport, route.nexthops).await;
        mpls_routes.push(MplsRoute::new(top_label, nexthops));
    }

    mpls_routes
}

async fn to_nexthops<T: FibTransport>(
    cache: &InterfaceCache,
    transport: &T,
    nexthops: Vec<KernelNexthop>,
) -> Vec<NextHop> {
    let mut client_nexthops = Vec::with_capacity(nexthops.len());

    for nexthop in nexthops {
        let mut ifname = None;
        if let Some(ifindex) = nexthop.ifindex {
            ifname = cache.resolve_ifname(transport, ifindex).await;
        }

        let mpls_action = nexthop.mpls.map(|mpls| match mpls {
            KernelMplsAction::Push(labels) => {
                MplsAction::new(MplsActionCode::Push, None, Some(labels))
            }
            KernelMplsAction::Swap(label) => {
                MplsAction::new(MplsActionCode::Swap, Some(label), None)
            }
            KernelMplsAction::Php => {
                MplsAction::new(MplsActionCode::Php, None, None)
            }
            KernelMplsAction::PopAndLookup => {
                MplsAction::new(MplsActionCode::PopAndLookup, None, None)
            }
        });

        let mut client_nexthop = NextHop::new(nexthop.gateway, ifname, mpls_action);
        client_nexthop.weight = nexthop.weight;
        client_nexthops.push(client_nexthop);
    }

    client_nexthops
}

// ===== tests =====
