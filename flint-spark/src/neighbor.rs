//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flint_utils::task::{IntervalTask, TimeoutTask};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::debug::Debug;
use crate::packet::{DEFAULT_AREA_ID, ReflectedInfo};

// Per-neighbor FSM states. A neighbor that has never been heard from has
// no entry at all (the implicit idle state).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum SparkNeighState {
    Warm,
    Negotiate,
    Established,
    Restarting,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum NeighborEventKind {
    NeighborUp,
    NeighborDown,
    NeighborRestarting,
    NeighborRestarted,
    NeighborRttChange,
}

// Adjacency lifecycle event, as reported to the rest of the routing
// daemon. Events concerning a single neighbor are emitted in transition
// order.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct NeighborEvent {
    pub kind: NeighborEventKind,
    pub ifname: String,
    pub node_name: String,
    pub remote_ifname: String,
    pub transport_v4: Option<Ipv4Network>,
    pub transport_v6: Option<Ipv6Addr>,
    pub rtt_us: u64,
    pub area: String,
}

// Round-trip latency estimator.
//
// Samples are only accepted from strictly newer hello sequence numbers,
// and are smoothed with an EWMA (new sample weight 1/2).
#[derive(Clone, Copy, Debug, Default)]
pub struct RttEstimator {
    ewma_us: Option<u64>,
    reported_us: u64,
    last_sample_seq: u64,
}

#[derive(Debug)]
pub struct SparkNeighbor {
    pub node_name: String,
    pub domain_name: String,
    pub ifname: String,
    pub remote_ifname: String,
    pub version: u32,
    pub supported_version: u32,
    pub state: SparkNeighState,
    // Neighbor speaks the predecessor protocol.
    pub legacy: bool,
    pub transport_v4: Option<Ipv4Network>,
    pub transport_v6: Option<Ipv6Addr>,
    // Best-matching local area for this peer (`None` = no area config).
    pub area: Option<String>,
    // Whether the peer's current incarnation has named us in its
    // reflected map.
    pub peer_reflected: bool,
    // Data about the peer's last hello, echoed back in our own hellos.
    pub reflected: ReflectedInfo,
    // Hold times advertised by the peer.
    pub hold_time: Duration,
    pub gr_hold_time: Duration,
    pub rtt: RttEstimator,
    pub created: DateTime<Utc>,
    pub last_state_change: Option<DateTime<Utc>>,
    // Timers.
    pub negotiate_timer: Option<TimeoutTask>,
    pub handshake_interval: Option<IntervalTask>,
    pub hold_timer: Option<TimeoutTask>,
    pub gr_timer: Option<TimeoutTask>,
}

// Neighbor table, keyed by (local interface, neighbor node name).
#[derive(Debug, Default)]
pub struct Neighbors {
    tree: BTreeMap<(String, String), SparkNeighbor>,
}

// ===== impl SparkNeighState =====

impl std::fmt::Display for SparkNeighState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SparkNeighState::Warm => write!(f, "WARM"),
            SparkNeighState::Negotiate => write!(f, "NEGOTIATE"),
            SparkNeighState::Established => write!(f, "ESTABLISHED"),
            SparkNeighState::Restarting => write!(f, "RESTARTING"),
        }
    }
}

// ===== impl NeighborEventKind =====

impl std::fmt::Display for NeighborEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NeighborEventKind::NeighborUp => write!(f, "NEIGHBOR_UP"),
            NeighborEventKind::NeighborDown => write!(f, "NEIGHBOR_DOWN"),
            NeighborEventKind::NeighborRestarting => {
                write!(f, "NEIGHBOR_RESTARTING")
            }
            NeighborEventKind::NeighborRestarted => {
                write!(f, "NEIGHBOR_RESTARTED")
            }
            NeighborEventKind::NeighborRttChange => {
                write!(f, "NEIGHBOR_RTT_CHANGE")
            }
        }
    }
}

// ===== impl RttEstimator =====

impl RttEstimator {
    // Feeds a new sample, keyed by the hello sequence number it was
    // computed from.
    pub(crate) fn update(&mut self, seq_num: u64, sample_us: u64) {
        if seq_num <= self.last_sample_seq {
            return;
        }
        self.last_sample_seq = seq_num;
        self.ewma_us = Some(match self.ewma_us {
            Some(ewma) => (ewma + sample_us) / 2,
            None => sample_us,
        });
    }

    pub(crate) fn current(&self) -> u64 {
        self.ewma_us.unwrap_or(0)
    }

    // Whether the smoothed value deviates from the last reported value by
    // more than 10%.
    pub(crate) fn deviated(&self) -> bool {
        let current = self.current();
        current > 0 && current.abs_diff(self.reported_us) * 10 > self.reported_us
    }

    pub(crate) fn mark_reported(&mut self) {
        self.reported_us = self.current();
    }

    // Accepts samples from a fresh sequence origin after the peer
    // restarted.
    pub(crate) fn reset_origin(&mut self) {
        self.last_sample_seq = 0;
    }
}

// ===== impl SparkNeighbor =====

impl SparkNeighbor {
    pub(crate) fn new(
        ifname: String,
        node_name: String,
        domain_name: String,
        remote_ifname: String,
        version: u32,
        supported_version: u32,
        legacy: bool,
        area: Option<String>,
    ) -> SparkNeighbor {
        Debug::NeighborCreate(&ifname, &node_name).log();

        SparkNeighbor {
            node_name,
            domain_name,
            ifname,
            remote_ifname,
            version,
            supported_version,
            state: SparkNeighState::Warm,
            legacy,
            transport_v4: None,
            transport_v6: None,
            area,
            peer_reflected: false,
            reflected: Default::default(),
            hold_time: Duration::ZERO,
            gr_hold_time: Duration::ZERO,
            rtt: Default::default(),
            created: Utc::now(),
            last_state_change: None,
            negotiate_timer: None,
            handshake_interval: None,
            hold_timer: None,
            gr_timer: None,
        }
    }

    // Updates the FSM state of the neighbor.
    pub(crate) fn state_update(&mut self, state: SparkNeighState) {
        let old_state = self.state;
        self.state = state;
        self.last_state_change = Some(Utc::now());

        Debug::FsmTransition(&self.ifname, &self.node_name, old_state, state)
            .log();
    }

    pub(crate) fn last_seq_num(&self) -> u64 {
        self.reflected.seq_num
    }

    // Builds a lifecycle event for this neighbor.
    pub(crate) fn event(&self, kind: NeighborEventKind) -> NeighborEvent {
        NeighborEvent {
            kind,
            ifname: self.ifname.clone(),
            node_name: self.node_name.clone(),
            remote_ifname: self.remote_ifname.clone(),
            transport_v4: self.transport_v4,
            transport_v6: self.transport_v6,
            rtt_us: self.rtt.current(),
            area: self
                .area
                .clone()
                .unwrap_or_else(|| DEFAULT_AREA_ID.to_owned()),
        }
    }
}

impl Drop for SparkNeighbor {
    fn drop(&mut self) {
        Debug::NeighborDelete(&self.ifname, &self.node_name).log();
    }
}

// ===== impl Neighbors =====

impl Neighbors {
    pub(crate) fn insert(&mut self, nbr: SparkNeighbor) -> &mut SparkNeighbor {
        let key = (nbr.ifname.clone(), nbr.node_name.clone());
        self.tree.entry(key).or_insert(nbr)
    }

    pub(crate) fn get(
        &self,
        ifname: &str,
        node_name: &str,
    ) -> Option<&SparkNeighbor> {
        self.tree.get(&(ifname.to_owned(), node_name.to_owned()))
    }

    pub(crate) fn get_mut(
        &mut self,
        ifname: &str,
        node_name: &str,
    ) -> Option<&mut SparkNeighbor> {
        self.tree.get_mut(&(ifname.to_owned(), node_name.to_owned()))
    }

    pub(crate) fn remove(
        &mut self,
        ifname: &str,
        node_name: &str,
    ) -> Option<SparkNeighbor> {
        self.tree.remove(&(ifname.to_owned(), node_name.to_owned()))
    }

    // Removes and returns all neighbors anchored to the given interface.
    pub(crate) fn remove_by_ifname(
        &mut self,
        ifname: &str,
    ) -> Vec<SparkNeighbor> {
        let keys = self
            .tree
            .keys()
            .filter(|(nbr_ifname, _)| nbr_ifname == ifname)
            .cloned()
            .collect::<Vec<_>>();
        keys.into_iter()
            .filter_map(|key| self.tree.remove(&key))
            .collect()
    }

    // Returns an iterator visiting all neighbors discovered on the given
    // interface.
    pub(crate) fn iter_by_ifname<'a>(
        &'a self,
        ifname: &'a str,
    ) -> impl Iterator<Item = &'a SparkNeighbor> + 'a {
        self.tree.values().filter(move |nbr| nbr.ifname == ifname)
    }
}
