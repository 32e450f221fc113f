//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use derive_new::new;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::mpls::Label;

// Default nexthop weight (ECMP equal-cost).
pub const DEFAULT_NH_WEIGHT: u32 = 0;

//
// Client-facing route model.
//
// These types mirror what routing clients submit over the programming
// interface: MPLS actions are loosely typed (action code plus optional
// payloads) and are validated during translation to the kernel form.
//

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum MplsActionCode {
    Push,
    Swap,
    Php,
    PopAndLookup,
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd, new)]
#[derive(Deserialize, Serialize)]
pub struct MplsAction {
    pub code: MplsActionCode,
    pub swap_label: Option<Label>,
    pub push_labels: Option<Vec<Label>>,
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd, new)]
#[derive(Deserialize, Serialize)]
pub struct NextHop {
    pub address: IpAddr,
    pub ifname: Option<String>,
    pub mpls_action: Option<MplsAction>,
    #[new(value = "DEFAULT_NH_WEIGHT")]
    pub weight: u32,
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd, new)]
#[derive(Deserialize, Serialize)]
pub struct UnicastRoute {
    pub dest: IpNetwork,
    pub nexthops: Vec<NextHop>,
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd, new)]
#[derive(Deserialize, Serialize)]
pub struct MplsRoute {
    pub top_label: u32,
    pub nexthops: Vec<NextHop>,
}

//
// Kernel-level route form.
//
// The result of translating a client route: protocol ID and admin distance
// resolved, interface names resolved to indexes, MPLS actions strongly
// typed. An empty nexthop list is a blackhole route.
//

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum KernelMplsAction {
    Push(Vec<Label>),
    Swap(Label),
    Php,
    PopAndLookup,
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd, new)]
#[derive(Deserialize, Serialize)]
pub struct KernelNexthop {
    pub gateway: IpAddr,
    pub ifindex: Option<u32>,
    pub mpls: Option<KernelMplsAction>,
    pub weight: u32,
}

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum KernelRouteKey {
    Unicast(IpNetwork),
    Mpls(u32),
}

#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd, new)]
#[derive(Deserialize, Serialize)]
pub struct KernelRoute {
    pub protocol_id: u8,
    pub priority: u8,
    pub key: KernelRouteKey,
    pub nexthops: Vec<KernelNexthop>,
}

// ===== impl KernelRoute =====

impl KernelRoute {
    // Returns whether this route drops matching packets.
    pub fn is_blackhole(&self) -> bool {
        self.nexthops.is_empty()
    }
}

// ===== impl KernelRouteKey =====

impl std::fmt::Display for KernelRouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelRouteKey::Unicast(prefix) => write!(f, "{prefix}"),
            KernelRouteKey::Mpls(label) => write!(f, "label {label}"),
        }
    }
}
