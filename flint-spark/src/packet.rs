//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use std::time::Duration;

use derive_new::new;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

//
// Every datagram is a versioned envelope carrying exactly one message.
//
// Version 2 is the current protocol: multicast hellos for discovery,
// unicast handshakes during negotiation, unicast heartbeats for
// liveness. Version 1 is the predecessor protocol, whose only message is
// a self-contained hello (identity, transport addresses and hold times
// all in one datagram); peers speaking it skip negotiation entirely.
//
pub const PACKET_VERSION: u32 = 2;
pub const PACKET_VERSION_LEGACY: u32 = 1;

// The well-known area used when a node carries no area configuration.
pub const DEFAULT_AREA_ID: &str = "0";

#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct PacketEnvelope {
    pub version: u32,
    pub body: PacketBody,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum PacketBody {
    Hello(HelloMsg),
    Handshake(HandshakeMsg),
    Heartbeat(HeartbeatMsg),
}

// Per-neighbor information reflected back in outgoing hellos, allowing a
// peer to confirm the sender has seen its hellos and to compute RTT from
// the echoed timestamps.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct ReflectedInfo {
    // Last sequence number seen from this neighbor.
    pub seq_num: u64,
    // Send timestamp carried by the neighbor's last hello (its clock).
    pub sent_ts_us: u64,
    // Local receive timestamp of that hello (our clock).
    pub recv_ts_us: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct HelloMsg {
    pub node_name: String,
    pub domain_name: String,
    pub version: u32,
    pub supported_version: u32,
    pub ifname: String,
    pub transport_v4: Option<Ipv4Network>,
    pub transport_v6: Ipv6Addr,
    pub seq_num: u64,
    // Reflected neighbor map, keyed by node name.
    pub neighbor_infos: BTreeMap<String, ReflectedInfo>,
    pub hold_time: Duration,
    pub gr_hold_time: Duration,
    pub solicit_response: bool,
    pub restarting: bool,
    pub sent_ts_us: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct HandshakeMsg {
    pub node_name: String,
    pub version: u32,
    pub supported_version: u32,
    pub ifname: String,
    pub transport_v4: Option<Ipv4Network>,
    pub transport_v6: Ipv6Addr,
    pub hold_time: Duration,
    pub gr_hold_time: Duration,
    // The area the sender computed for the recipient. `None` means the
    // sender has no area support.
    pub neighbor_area: Option<String>,
    // Set once the sender considers the adjacency established.
    pub established: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct HeartbeatMsg {
    pub node_name: String,
    pub seq_num: u64,
}

// Packet decode errors.
#[derive(Debug, Eq, PartialEq)]
pub enum DecodeError {
    Malformed,
    UnknownVersion(u32),
    LegacyNonHello,
}

// ===== impl PacketEnvelope =====

impl PacketEnvelope {
    // Encodes the envelope into a byte buffer.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("packet types are always encodable")
    }

    // Decodes an envelope from a received datagram.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let envelope: PacketEnvelope =
            bincode::deserialize(data).map_err(|_| DecodeError::Malformed)?;

        match envelope.version {
            PACKET_VERSION => Ok(envelope),
            // The predecessor protocol only ever put hellos on the wire.
            PACKET_VERSION_LEGACY => match envelope.body {
                PacketBody::Hello(_) => Ok(envelope),
                _ => Err(DecodeError::LegacyNonHello),
            },
            version => Err(DecodeError::UnknownVersion(version)),
        }
    }

    pub fn is_legacy(&self) -> bool {
        self.version == PACKET_VERSION_LEGACY
    }
}

// ===== impl PacketBody =====

impl PacketBody {
    // Returns the message kind as a display label.
    pub fn kind(&self) -> &'static str {
        match self {
            PacketBody::Hello(_) => "hello",
            PacketBody::Handshake(_) => "handshake",
            PacketBody::Heartbeat(_) => "heartbeat",
        }
    }
}

// ===== impl DecodeError =====

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Malformed => {
                write!(f, "malformed packet")
            }
            DecodeError::UnknownVersion(version) => {
                write!(f, "unknown envelope version: {version}")
            }
            DecodeError::LegacyNonHello => {
                write!(f, "unexpected message in legacy envelope")
            }
        }
    }
}

impl std::error::Error for DecodeError {}
