//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::warn;

// FIB errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    // Client ID not present in the static mapping.
    InvalidClient(i16),
    // Protocol ID outside the usable kernel range.
    InvalidProtocolId(u8),
    // Nexthop interface absent from the cache even after refresh.
    UnresolvableInterface(String),
    // Missing required field for the declared MPLS action.
    MalformedRoute(&'static str),
    // Transport-level error from the kernel interface.
    NetlinkFailure(String),
    // FIB synchronization exceeded its deadline.
    SyncTimeout,
    // The facade event loop is gone.
    AgentClosed,
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::InvalidClient(client_id) => {
                warn!(%client_id, "{}", self);
            }
            Error::InvalidProtocolId(protocol_id) => {
                warn!(%protocol_id, "{}", self);
            }
            Error::UnresolvableInterface(ifname) => {
                warn!(%ifname, "{}", self);
            }
            Error::MalformedRoute(reason) => {
                warn!(%reason, "{}", self);
            }
            Error::NetlinkFailure(error) => {
                warn!(%error, "{}", self);
            }
            Error::SyncTimeout | Error::AgentClosed => {
                warn!("{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidClient(client_id) => {
                write!(f, "invalid client ID: {client_id}")
            }
            Error::InvalidProtocolId(protocol_id) => {
                write!(f, "invalid protocol ID: {protocol_id}")
            }
            Error::UnresolvableInterface(ifname) => {
                write!(f, "failed to resolve interface: {ifname}")
            }
            Error::MalformedRoute(reason) => {
                write!(f, "malformed route: {reason}")
            }
            Error::NetlinkFailure(error) => {
                write!(f, "netlink request failed: {error}")
            }
            Error::SyncTimeout => {
                write!(f, "FIB synchronization timed out")
            }
            Error::AgentClosed => {
                write!(f, "FIB agent is no longer running")
            }
        }
    }
}

impl std::error::Error for Error {}
