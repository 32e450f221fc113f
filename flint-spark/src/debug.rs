//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::{debug, debug_span};

use crate::interface::InterfaceBinding;
use crate::neighbor::SparkNeighState;

// Spark debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    InterfaceAdd(&'a InterfaceBinding),
    InterfaceDelete(&'a InterfaceBinding),
    NeighborCreate(&'a str, &'a str),
    NeighborDelete(&'a str, &'a str),
    FsmTransition(&'a str, &'a str, SparkNeighState, SparkNeighState),
    PacketTx(&'a str, &'a str),
    PacketRx(&'a str, &'a str, &'a str),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::InterfaceAdd(binding) | Debug::InterfaceDelete(binding) => {
                debug_span!("interface", name = %binding.ifname).in_scope(
                    || {
                        debug!(ifindex = %binding.ifindex, "{}", self);
                    },
                );
            }
            Debug::NeighborCreate(ifname, node_name)
            | Debug::NeighborDelete(ifname, node_name) => {
                debug_span!("neighbor", interface = %ifname, node = %node_name)
                    .in_scope(|| {
                        debug!("{}", self);
                    });
            }
            Debug::FsmTransition(ifname, node_name, old_state, new_state) => {
                debug_span!("neighbor", interface = %ifname, node = %node_name)
                    .in_scope(|| {
                        debug!(%old_state, %new_state, "{}", self);
                    });
            }
            Debug::PacketTx(ifname, kind) => {
                debug_span!("output", interface = %ifname).in_scope(|| {
                    debug!(%kind, "{}", self);
                });
            }
            Debug::PacketRx(ifname, node_name, kind) => {
                debug_span!("input", interface = %ifname, node = %node_name)
                    .in_scope(|| {
                        debug!(%kind, "{}", self);
                    });
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::InterfaceAdd(..) => {
                write!(f, "interface added")
            }
            Debug::InterfaceDelete(..) => {
                write!(f, "interface deleted")
            }
            Debug::NeighborCreate(..) => {
                write!(f, "neighbor created")
            }
            Debug::NeighborDelete(..) => {
                write!(f, "neighbor deleted")
            }
            Debug::FsmTransition(..) => {
                write!(f, "state transition")
            }
            Debug::PacketTx(..) => {
                write!(f, "packet sent")
            }
            Debug::PacketRx(..) => {
                write!(f, "packet received")
            }
        }
    }
}
