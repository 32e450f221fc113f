//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv6Addr;

use derive_new::new;
use flint_utils::task::IntervalTask;
use ipnetwork::Ipv4Network;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::debug::Debug;

// Hello sequence numbers restart from a fresh random origin on process
// start; peers detect restarts by seeing the sequence move backwards. The
// origin range is kept small so a fresh origin compares below any counter
// that has been running for a while.
const SEQ_NUM_ORIGIN_RANGE: std::ops::RangeInclusive<u64> = 1..=1024;

// An interface the engine was told to track, as reported by the link
// monitor.
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct InterfaceBinding {
    pub ifname: String,
    pub ifindex: u32,
    pub v4_cidr: Option<Ipv4Network>,
    pub v6_link_local: Ipv6Addr,
}

// Engine-side state for a tracked interface.
#[derive(Debug)]
pub(crate) struct SparkInterface {
    pub(crate) binding: InterfaceBinding,
    // Hello sequence counter, shared by hellos and heartbeats sent out
    // this interface.
    pub(crate) seq_num: u64,
    // Hellos are emitted at an accelerated rate until the first neighbor
    // on this interface reaches ESTABLISHED.
    pub(crate) fast_init: bool,
    pub(crate) hello_interval: Option<IntervalTask>,
    pub(crate) heartbeat_interval: Option<IntervalTask>,
}

// ===== impl SparkInterface =====

impl SparkInterface {
    pub(crate) fn new(binding: InterfaceBinding) -> SparkInterface {
        Debug::InterfaceAdd(&binding).log();

        SparkInterface {
            binding,
            seq_num: rand::rng().random_range(SEQ_NUM_ORIGIN_RANGE),
            fast_init: true,
            hello_interval: None,
            heartbeat_interval: None,
        }
    }

    pub(crate) fn next_seq_num(&mut self) -> u64 {
        self.seq_num = self.seq_num.wrapping_add(1);
        self.seq_num
    }
}

impl Drop for SparkInterface {
    fn drop(&mut self) {
        Debug::InterfaceDelete(&self.binding).log();
    }
}
