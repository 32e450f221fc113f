//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use flint_utils::ip::Ipv4NetworkExt;

use crate::debug::Debug;
use crate::error::{Error, IoError};
use crate::instance::{
    COUNTER_HELLO_RX, COUNTER_INVALID_PACKETS, SparkInstance,
};
use crate::interface::{InterfaceBinding, SparkInterface};
use crate::io::{PacketIo, RxPacket};
use crate::neighbor::{NeighborEventKind, SparkNeighState, SparkNeighbor};
use crate::packet::{
    HandshakeMsg, HeartbeatMsg, HelloMsg, PacketBody, PacketEnvelope,
    ReflectedInfo,
};
use crate::tasks;
use crate::tasks::messages::input::ProtocolMsg;

// ===== message dispatch =====

pub(crate) async fn process_protocol_msg<IO: PacketIo>(
    instance: &mut SparkInstance<IO>,
    msg: ProtocolMsg,
) -> Result<(), Error> {
    match msg {
        // Received packet.
        ProtocolMsg::RxPacket(msg) => {
            process_packet(instance, msg.packet).await?;
        }
        // Hello emission timer ticked.
        ProtocolMsg::HelloTimer(msg) => {
            process_hello_timer(instance, &msg.ifname).await;
        }
        // Handshake retransmission timer ticked.
        ProtocolMsg::HandshakeTimer(msg) => {
            process_handshake_timer(instance, &msg.ifname, &msg.node_name)
                .await;
        }
        // Heartbeat emission timer ticked.
        ProtocolMsg::HeartbeatTimer(msg) => {
            instance.send_heartbeat(&msg.ifname).await;
        }
        // Neighbor liveness deadline expired.
        ProtocolMsg::HoldTimer(msg) => {
            process_hold_timer_expiry(instance, &msg.ifname, &msg.node_name);
        }
        // Negotiation deadline expired.
        ProtocolMsg::NegotiateTimer(msg) => {
            process_negotiate_timer_expiry(
                instance,
                &msg.ifname,
                &msg.node_name,
            );
        }
        // Graceful-restart deadline expired.
        ProtocolMsg::GrTimer(msg) => {
            process_gr_timer_expiry(instance, &msg.ifname, &msg.node_name);
        }
    }

    Ok(())
}

// ===== packet input =====

async fn process_packet<IO: PacketIo>(
    instance: &mut SparkInstance<IO>,
    packet: RxPacket,
) -> Result<(), Error> {
    // Ignore traffic on interfaces we no longer track.
    if !instance.interfaces.contains_key(&packet.ifname) {
        return Ok(());
    }

    // Decode the envelope, dropping malformed datagrams.
    let envelope = match PacketEnvelope::decode(&packet.data) {
        Ok(envelope) => envelope,
        Err(error) => {
            instance.counter_inc(COUNTER_INVALID_PACKETS);
            return Err(Error::PacketDecodeError(error));
        }
    };

    // Datagrams from the predecessor protocol, and everything received
    // while this engine itself runs the predecessor protocol, take the
    // legacy processing path.
    let legacy = envelope.is_legacy() || !instance.config.enable_spark2;

    match envelope.body {
        PacketBody::Hello(hello) => {
            process_hello(instance, &packet.ifname, hello, legacy, packet.recv_ts_us)
                .await
        }
        PacketBody::Handshake(handshake) => {
            process_handshake(instance, &packet.ifname, handshake).await
        }
        PacketBody::Heartbeat(heartbeat) => {
            process_heartbeat(instance, &packet.ifname, heartbeat)
        }
    }
}

async fn process_hello<IO: PacketIo>(
    instance: &mut SparkInstance<IO>,
    ifname: &str,
    hello: HelloMsg,
    legacy: bool,
    recv_ts_us: u64,
) -> Result<(), Error> {
    instance.counter_inc(COUNTER_HELLO_RX);
    let my_node_name = instance.config.node_name.clone();

    // A looped-back hello carries our own node name. Drop it without
    // creating any state.
    if hello.node_name == my_node_name {
        instance.counter_inc(COUNTER_INVALID_PACKETS);
        return Ok(());
    }

    // Domain gate.
    if hello.domain_name != instance.config.domain_name {
        instance.counter_inc(COUNTER_INVALID_PACKETS);
        return Err(Error::DomainMismatch(hello.node_name, hello.domain_name));
    }

    // Version gate.
    if !instance
        .config
        .version
        .intersects(hello.version, hello.supported_version)
    {
        instance.counter_inc(COUNTER_INVALID_PACKETS);
        return Err(Error::VersionMismatch(hello.node_name, hello.version));
    }

    Debug::PacketRx(ifname, &hello.node_name, "hello").log();

    // First hello from a candidate peer creates the neighbor entry. A
    // shutdown announcement from a peer we never tracked is not a
    // candidate.
    if instance.neighbors.get(ifname, &hello.node_name).is_none() {
        if hello.restarting {
            return Ok(());
        }
        // Area gate: with a non-empty area config, a peer matching no
        // area never becomes a neighbor.
        let area = if instance.areas.is_empty() {
            None
        } else {
            match instance.areas.match_peer(&hello.node_name, ifname) {
                Some(area) => Some(area.to_owned()),
                None => {
                    instance.counter_inc(COUNTER_INVALID_PACKETS);
                    return Err(Error::AreaMismatch(hello.node_name));
                }
            }
        };

        let nbr = SparkNeighbor::new(
            ifname.to_owned(),
            hello.node_name.clone(),
            hello.domain_name.clone(),
            hello.ifname.clone(),
            hello.version,
            hello.supported_version,
            legacy,
            area,
        );
        instance.neighbors.insert(nbr);
    }

    // Refresh neighbor data carried by every hello, taking the RTT sample
    // and capturing the previous sequence number for restart detection.
    let contains_me = hello.neighbor_infos.contains_key(&my_node_name);
    let (old_seq_num, peer_reflected, state) = {
        let Some(nbr) = instance.neighbors.get_mut(ifname, &hello.node_name)
        else {
            return Ok(());
        };
        let old_seq_num = nbr.last_seq_num();

        nbr.legacy = legacy;
        nbr.remote_ifname = hello.ifname.clone();
        if hello.transport_v4.is_some() {
            nbr.transport_v4 = hello.transport_v4;
        }
        nbr.transport_v6 = Some(hello.transport_v6);
        nbr.version = hello.version;
        nbr.supported_version = hello.supported_version;
        if legacy || nbr.hold_time.is_zero() {
            nbr.hold_time = hello.hold_time;
        }
        nbr.gr_hold_time = hello.gr_hold_time;

        // RTT sample from the echoed timestamps: both subtractions stay
        // within a single clock, so peer clock offset cancels out.
        if let Some(info) = hello.neighbor_infos.get(&my_node_name)
            && info.sent_ts_us > 0
            && info.recv_ts_us > 0
        {
            let rtt_us = (recv_ts_us as i128 - info.sent_ts_us as i128)
                - (hello.sent_ts_us as i128 - info.recv_ts_us as i128);
            if rtt_us > 0 {
                nbr.rtt.update(hello.seq_num, rtt_us as u64);
            }
        }

        nbr.reflected =
            ReflectedInfo::new(hello.seq_num, hello.sent_ts_us, recv_ts_us);

        (old_seq_num, nbr.peer_reflected, nbr.state)
    };

    // Report RTT movement on established adjacencies.
    if state == SparkNeighState::Established
        && let Some(nbr) = instance.neighbors.get_mut(ifname, &hello.node_name)
        && nbr.rtt.deviated()
    {
        nbr.rtt.mark_reported();
        let event = nbr.event(NeighborEventKind::NeighborRttChange);
        instance.emit_event(event);
    }

    // FSM.
    match state {
        SparkNeighState::Warm | SparkNeighState::Negotiate => {
            // A peer announcing shutdown doesn't get a new session.
            if contains_me && !hello.restarting {
                if legacy {
                    // The predecessor protocol has no negotiation stage:
                    // bidirectionality in the hello is the whole contract,
                    // and the session lands in the default area.
                    if let Some(nbr) =
                        instance.neighbors.get_mut(ifname, &hello.node_name)
                    {
                        nbr.area = None;
                    }
                    establish_neighbor(instance, ifname, &hello.node_name)
                        .await;
                } else if state == SparkNeighState::Warm {
                    // Bidirectionality confirmed, start negotiating.
                    let negotiate_timer = tasks::negotiate_timer(
                        ifname,
                        &hello.node_name,
                        instance.config.timers.negotiate_hold_time,
                        &instance.tx.negotiate_timer,
                    );
                    let handshake_interval = tasks::handshake_interval(
                        ifname,
                        &hello.node_name,
                        instance.config.timers.handshake_time,
                        &instance.tx.handshake_timer,
                    );
                    if let Some(nbr) =
                        instance.neighbors.get_mut(ifname, &hello.node_name)
                    {
                        nbr.state_update(SparkNeighState::Negotiate);
                        nbr.peer_reflected = true;
                        nbr.negotiate_timer = Some(negotiate_timer);
                        nbr.handshake_interval = Some(handshake_interval);
                    }
                } else if let Some(nbr) =
                    instance.neighbors.get_mut(ifname, &hello.node_name)
                {
                    nbr.peer_reflected = true;
                }
            }
        }
        SparkNeighState::Established => {
            if hello.restarting {
                // The peer announced a graceful restart.
                let gr_timer = tasks::gr_timer(
                    ifname,
                    &hello.node_name,
                    instance.config.timers.gr_hold_time,
                    &instance.tx.gr_timer,
                );
                if let Some(nbr) =
                    instance.neighbors.get_mut(ifname, &hello.node_name)
                {
                    nbr.state_update(SparkNeighState::Restarting);
                    nbr.hold_timer = None;
                    nbr.gr_timer = Some(gr_timer);
                    let event =
                        nbr.event(NeighborEventKind::NeighborRestarting);
                    instance.emit_event(event);
                }
            } else if hello.seq_num < old_seq_num {
                // The sequence moved backwards: the peer restarted
                // without announcing it. Adopt the new origin and keep
                // the adjacency.
                if let Some(nbr) =
                    instance.neighbors.get_mut(ifname, &hello.node_name)
                {
                    nbr.peer_reflected = contains_me;
                    nbr.rtt.reset_origin();
                    let event =
                        nbr.event(NeighborEventKind::NeighborRestarted);
                    instance.emit_event(event);
                }
                arm_hold_timer(instance, ifname, &hello.node_name);
            } else if !contains_me && peer_reflected {
                // The peer stopped reflecting us: it lost this adjacency.
                if let Some(nbr) =
                    instance.neighbors.remove(ifname, &hello.node_name)
                {
                    let event = nbr.event(NeighborEventKind::NeighborDown);
                    drop(nbr);
                    instance.emit_event(event);
                }
            } else {
                if contains_me
                    && let Some(nbr) =
                        instance.neighbors.get_mut(ifname, &hello.node_name)
                {
                    nbr.peer_reflected = true;
                }
                arm_hold_timer(instance, ifname, &hello.node_name);
            }
        }
        SparkNeighState::Restarting => {
            if !hello.restarting {
                // The peer came back with a fresh hello stream.
                if let Some(nbr) =
                    instance.neighbors.get_mut(ifname, &hello.node_name)
                {
                    nbr.state_update(SparkNeighState::Established);
                    nbr.gr_timer = None;
                    nbr.peer_reflected = contains_me;
                    nbr.rtt.reset_origin();
                    let event =
                        nbr.event(NeighborEventKind::NeighborRestarted);
                    instance.emit_event(event);
                }
                arm_hold_timer(instance, ifname, &hello.node_name);
            }
        }
    }

    // Answer solicited hellos right away to speed up mutual discovery.
    if hello.solicit_response {
        instance.send_hello(ifname, false, false).await;
    }

    Ok(())
}

async fn process_handshake<IO: PacketIo>(
    instance: &mut SparkInstance<IO>,
    ifname: &str,
    handshake: HandshakeMsg,
) -> Result<(), Error> {
    if handshake.node_name == instance.config.node_name {
        return Ok(());
    }

    Debug::PacketRx(ifname, &handshake.node_name, "handshake").log();

    // Handshakes for unknown neighbors are ignored; discovery is
    // hello-driven.
    let Some(state) = instance
        .neighbors
        .get(ifname, &handshake.node_name)
        .map(|nbr| nbr.state)
    else {
        return Ok(());
    };

    // Record the session parameters the peer advertised.
    if let Some(nbr) = instance.neighbors.get_mut(ifname, &handshake.node_name)
    {
        if handshake.transport_v4.is_some() {
            nbr.transport_v4 = handshake.transport_v4;
        }
        nbr.transport_v6 = Some(handshake.transport_v6);
        nbr.hold_time = handshake.hold_time;
        nbr.gr_hold_time = handshake.gr_hold_time;
        nbr.version = handshake.version;
        nbr.supported_version = handshake.supported_version;
    }

    match state {
        SparkNeighState::Negotiate => {
            match validate_handshake(instance, ifname, &handshake) {
                Ok(()) => {
                    establish_neighbor(instance, ifname, &handshake.node_name)
                        .await;
                    // Let the peer complete its own negotiation.
                    if !handshake.established {
                        instance
                            .send_handshake(ifname, &handshake.node_name, true)
                            .await;
                    }
                }
                Err(error) => {
                    // Fall back to WARM; later hellos may carry corrected
                    // information and re-enter negotiation.
                    if let Some(nbr) = instance
                        .neighbors
                        .get_mut(ifname, &handshake.node_name)
                    {
                        nbr.state_update(SparkNeighState::Warm);
                        nbr.negotiate_timer = None;
                        nbr.handshake_interval = None;
                    }
                    return Err(error);
                }
            }
        }
        SparkNeighState::Established => {
            // A peer re-negotiating after restart still needs our half of
            // the handshake.
            if !handshake.established {
                instance
                    .send_handshake(ifname, &handshake.node_name, true)
                    .await;
            }
        }
        SparkNeighState::Warm | SparkNeighState::Restarting => {}
    }

    Ok(())
}

fn process_heartbeat<IO: PacketIo>(
    instance: &mut SparkInstance<IO>,
    ifname: &str,
    heartbeat: HeartbeatMsg,
) -> Result<(), Error> {
    if heartbeat.node_name == instance.config.node_name {
        return Ok(());
    }

    Debug::PacketRx(ifname, &heartbeat.node_name, "heartbeat").log();

    // Heartbeats only refresh established adjacencies.
    if instance
        .neighbors
        .get(ifname, &heartbeat.node_name)
        .is_some_and(|nbr| nbr.state == SparkNeighState::Established)
    {
        arm_hold_timer(instance, ifname, &heartbeat.node_name);
    }

    Ok(())
}

// Validation gates applied during NEGOTIATE.
fn validate_handshake<IO: PacketIo>(
    instance: &SparkInstance<IO>,
    ifname: &str,
    handshake: &HandshakeMsg,
) -> Result<(), Error> {
    // Protocol version ranges must intersect.
    if !instance
        .config
        .version
        .intersects(handshake.version, handshake.supported_version)
    {
        return Err(Error::VersionMismatch(
            handshake.node_name.clone(),
            handshake.version,
        ));
    }

    // The peer's v4 address must share the interface subnet.
    if instance.config.enable_v4
        && let Some(iface) = instance.interfaces.get(ifname)
        && let Some(local_v4) = iface.binding.v4_cidr
        && !handshake
            .transport_v4
            .is_some_and(|peer_v4| local_v4.same_subnet(&peer_v4))
    {
        return Err(Error::SubnetMismatch(handshake.node_name.clone()));
    }

    // Area agreement: what we computed for the peer must equal what the
    // peer computed for us. A side without area support falls back to the
    // well-known default area.
    let my_area = instance
        .neighbors
        .get(ifname, &handshake.node_name)
        .and_then(|nbr| nbr.area.clone());
    match (&my_area, &handshake.neighbor_area) {
        (None, _) | (_, None) => Ok(()),
        (Some(mine), Some(theirs)) if mine == theirs => Ok(()),
        _ => Err(Error::NegotiationFailure(handshake.node_name.clone())),
    }
}

// ===== timer expiries =====

async fn process_hello_timer<IO: PacketIo>(
    instance: &mut SparkInstance<IO>,
    ifname: &str,
) {
    let Some(fast_init) =
        instance.interfaces.get(ifname).map(|iface| iface.fast_init)
    else {
        return;
    };
    // Solicitation belongs to the fast-init burst of the current
    // protocol.
    let solicit_response = fast_init && instance.config.enable_spark2;
    instance.send_hello(ifname, false, solicit_response).await;
}

async fn process_handshake_timer<IO: PacketIo>(
    instance: &mut SparkInstance<IO>,
    ifname: &str,
    node_name: &str,
) {
    // The interval task is dropped on state exit; a stale tick can still
    // be queued behind it.
    if instance
        .neighbors
        .get(ifname, node_name)
        .is_some_and(|nbr| nbr.state == SparkNeighState::Negotiate)
    {
        instance.send_handshake(ifname, node_name, false).await;
    }
}

fn process_hold_timer_expiry<IO: PacketIo>(
    instance: &mut SparkInstance<IO>,
    ifname: &str,
    node_name: &str,
) {
    if !instance
        .neighbors
        .get(ifname, node_name)
        .is_some_and(|nbr| nbr.state == SparkNeighState::Established)
    {
        return;
    }

    if let Some(nbr) = instance.neighbors.remove(ifname, node_name) {
        let event = nbr.event(NeighborEventKind::NeighborDown);
        drop(nbr);
        instance.emit_event(event);
    }
}

fn process_negotiate_timer_expiry<IO: PacketIo>(
    instance: &mut SparkInstance<IO>,
    ifname: &str,
    node_name: &str,
) {
    if let Some(nbr) = instance.neighbors.get_mut(ifname, node_name)
        && nbr.state == SparkNeighState::Negotiate
    {
        nbr.state_update(SparkNeighState::Warm);
        nbr.negotiate_timer = None;
        nbr.handshake_interval = None;
    }
}

fn process_gr_timer_expiry<IO: PacketIo>(
    instance: &mut SparkInstance<IO>,
    ifname: &str,
    node_name: &str,
) {
    if !instance
        .neighbors
        .get(ifname, node_name)
        .is_some_and(|nbr| nbr.state == SparkNeighState::Restarting)
    {
        return;
    }

    if let Some(nbr) = instance.neighbors.remove(ifname, node_name) {
        let event = nbr.event(NeighborEventKind::NeighborDown);
        drop(nbr);
        instance.emit_event(event);
    }
}

// ===== interface database updates =====

pub(crate) async fn process_interface_update<IO: PacketIo>(
    instance: &mut SparkInstance<IO>,
    interfaces: Vec<InterfaceBinding>,
) {
    let new: BTreeMap<String, InterfaceBinding> = interfaces
        .into_iter()
        .map(|binding| (binding.ifname.clone(), binding))
        .collect();

    // Removals tear down anchored neighbors immediately, outranking any
    // already-queued timer expiry for them.
    let removed = instance
        .interfaces
        .keys()
        .filter(|ifname| !new.contains_key(*ifname))
        .cloned()
        .collect::<Vec<_>>();
    for ifname in removed {
        let neighbors = instance.neighbors.remove_by_ifname(&ifname);
        let events = neighbors
            .iter()
            .filter(|nbr| {
                matches!(
                    nbr.state,
                    SparkNeighState::Established | SparkNeighState::Restarting
                )
            })
            .map(|nbr| nbr.event(NeighborEventKind::NeighborDown))
            .collect::<Vec<_>>();
        drop(neighbors);
        for event in events {
            instance.emit_event(event);
        }

        instance.interfaces.remove(&ifname);
        if let Err(error) = instance.io.unbind_interface(&ifname).await {
            IoError::BindError(error).log();
        }
    }

    // Additions start hello emission; changed bindings are refreshed in
    // place without disturbing neighbor state.
    for (ifname, binding) in new {
        match instance.interfaces.get_mut(&ifname) {
            Some(iface) => {
                iface.binding = binding;
            }
            None => {
                if let Err(error) =
                    instance.io.bind_interface(&ifname, binding.ifindex).await
                {
                    IoError::BindError(error).log();
                    continue;
                }

                let mut iface = SparkInterface::new(binding);
                let period = instance.hello_period(true);
                iface.hello_interval = Some(tasks::hello_interval(
                    &ifname,
                    period,
                    &instance.tx.hello_timer,
                ));
                instance.interfaces.insert(ifname, iface);
            }
        }
    }
}

// ===== helper functions =====

// Moves a neighbor to ESTABLISHED and performs the interface-level side
// effects of the first adjacency.
async fn establish_neighbor<IO: PacketIo>(
    instance: &mut SparkInstance<IO>,
    ifname: &str,
    node_name: &str,
) {
    {
        let Some(nbr) = instance.neighbors.get_mut(ifname, node_name) else {
            return;
        };
        nbr.state_update(SparkNeighState::Established);
        nbr.peer_reflected = true;
        nbr.negotiate_timer = None;
        nbr.handshake_interval = None;
        nbr.rtt.mark_reported();
        let event = nbr.event(NeighborEventKind::NeighborUp);
        instance.emit_event(event);
    }
    arm_hold_timer(instance, ifname, node_name);

    let enable_spark2 = instance.config.enable_spark2;
    let increase_hello_interval = instance.config.increase_hello_interval;
    let hello_time = instance.config.timers.hello_time;
    let heartbeat_time = instance.config.timers.heartbeat_time;

    // Start heartbeat emission with the first adjacency.
    if enable_spark2
        && instance
            .interfaces
            .get(ifname)
            .is_some_and(|iface| iface.heartbeat_interval.is_none())
    {
        let task = tasks::heartbeat_interval(
            ifname,
            heartbeat_time,
            &instance.tx.heartbeat_timer,
        );
        if let Some(iface) = instance.interfaces.get_mut(ifname) {
            iface.heartbeat_interval = Some(task);
        }
    }

    // End the fast-init hello burst.
    if enable_spark2
        && increase_hello_interval
        && let Some(iface) = instance.interfaces.get_mut(ifname)
        && iface.fast_init
    {
        iface.fast_init = false;
        if let Some(hello_interval) = &mut iface.hello_interval {
            hello_interval.reset(Some(hello_time));
        }
    }
}

// (Re)arms the liveness deadline for a neighbor, using the hold time it
// advertised (falling back to the local default).
fn arm_hold_timer<IO: PacketIo>(
    instance: &mut SparkInstance<IO>,
    ifname: &str,
    node_name: &str,
) {
    let Some(holdtime) = instance.neighbors.get(ifname, node_name).map(|nbr| {
        if nbr.hold_time.is_zero() {
            instance.config.timers.heartbeat_hold_time
        } else {
            nbr.hold_time
        }
    }) else {
        return;
    };

    let timer =
        tasks::hold_timer(ifname, node_name, holdtime, &instance.tx.hold_timer);
    if let Some(nbr) = instance.neighbors.get_mut(ifname, node_name) {
        nbr.hold_timer = Some(timer);
    }
}
