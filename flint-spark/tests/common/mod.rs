//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use flint_spark::io::{PacketDest, PacketIo, RxPacket, now_us};
use flint_spark::{InterfaceBinding, Spark, SparkConfig};
use ipnetwork::Ipv4Network;
use tokio::sync::mpsc;

pub const IFACE1: &str = "iface1";
pub const IFACE2: &str = "iface2";
pub const IF_INDEX1: u32 = 1;
pub const IF_INDEX2: u32 = 2;

// Domain name shared by most scenarios.
pub const DOMAIN_NAME: &str = "Fire_and_Blood";

// Timers compressed for testing.
pub const GR_HOLD_TIME: Duration = Duration::from_millis(500);
pub const KEEP_ALIVE_TIME: Duration = Duration::from_millis(50);
pub const HELLO_TIME: Duration = Duration::from_millis(200);
pub const FAST_INIT_HELLO_TIME: Duration = Duration::from_millis(50);
pub const HANDSHAKE_TIME: Duration = Duration::from_millis(50);
pub const HEARTBEAT_TIME: Duration = Duration::from_millis(50);
pub const NEGOTIATE_HOLD_TIME: Duration = Duration::from_millis(500);
pub const HEARTBEAT_HOLD_TIME: Duration = Duration::from_millis(200);

// Wait windows for event assertions.
pub const EVENT_STEP: Duration = Duration::from_millis(100);
pub const EVENT_WAIT: Duration = Duration::from_secs(5);

pub fn ip1_v4() -> Ipv4Network {
    "192.168.0.1/24".parse().unwrap()
}

pub fn ip2_v4() -> Ipv4Network {
    "192.168.0.2/24".parse().unwrap()
}

pub fn ip1_v6() -> Ipv6Addr {
    "fe80::1".parse().unwrap()
}

pub fn ip2_v6() -> Ipv6Addr {
    "fe80::2".parse().unwrap()
}

pub fn iface1_binding() -> InterfaceBinding {
    InterfaceBinding::new(IFACE1.to_owned(), IF_INDEX1, Some(ip1_v4()), ip1_v6())
}

pub fn iface2_binding() -> InterfaceBinding {
    InterfaceBinding::new(IFACE2.to_owned(), IF_INDEX2, Some(ip2_v4()), ip2_v6())
}

pub fn test_config(domain_name: &str, node_name: &str) -> SparkConfig {
    let mut config = SparkConfig::new(node_name, domain_name);
    config.timers.hello_time = HELLO_TIME;
    config.timers.fast_init_hello_time = FAST_INIT_HELLO_TIME;
    config.timers.keep_alive_time = KEEP_ALIVE_TIME;
    config.timers.handshake_time = HANDSHAKE_TIME;
    config.timers.heartbeat_time = HEARTBEAT_TIME;
    config.timers.negotiate_hold_time = NEGOTIATE_HOLD_TIME;
    config.timers.heartbeat_hold_time = HEARTBEAT_HOLD_TIME;
    config.timers.gr_hold_time = GR_HOLD_TIME;
    config
}

pub fn spawn_node(net: &SimNet, domain_name: &str, node_name: &str) -> Spark {
    Spark::spawn(test_config(domain_name, node_name), net.endpoint()).unwrap()
}

//
// Simulated network.
//
// Interfaces are connected by directed links with a configurable one-way
// delay in milliseconds, so RTT and loss scenarios are reproducible.
//

type Inbox = mpsc::UnboundedSender<RxPacket>;

// One transmitted datagram, as observed on the simulated wire.
#[derive(Clone, Debug)]
pub struct TxRecord {
    pub ifname: String,
    pub dst: PacketDest,
    pub data: Bytes,
}

#[derive(Clone, Default)]
pub struct SimNet {
    inner: Arc<Mutex<SimNetInner>>,
}

#[derive(Default)]
struct SimNetInner {
    // Sending interface -> [(receiving interface, one-way delay ms)].
    links: HashMap<String, Vec<(String, u64)>>,
    // Bound interface -> inbox of the owning endpoint.
    endpoints: HashMap<String, Inbox>,
    // Every transmission, in send order.
    tx_log: Vec<TxRecord>,
}

// One engine's view of the simulated network.
pub struct SimIo {
    net: SimNet,
    inbox_tx: Inbox,
    inbox_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RxPacket>>,
}

impl SimNet {
    pub fn new() -> SimNet {
        Default::default()
    }

    // Replaces the whole link table.
    pub fn set_connected_pairs(&self, pairs: &[(&str, &[(&str, u64)])]) {
        let links = pairs
            .iter()
            .map(|(from, to)| {
                let to = to
                    .iter()
                    .map(|(ifname, delay)| ((*ifname).to_owned(), *delay))
                    .collect();
                ((*from).to_owned(), to)
            })
            .collect();
        self.inner.lock().unwrap().links = links;
    }

    // Returns everything sent so far, regardless of delivery.
    pub fn tx_log(&self) -> Vec<TxRecord> {
        self.inner.lock().unwrap().tx_log.clone()
    }

    // Creates a new endpoint; each engine instance gets its own.
    pub fn endpoint(&self) -> SimIo {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        SimIo {
            net: self.clone(),
            inbox_tx,
            inbox_rx: tokio::sync::Mutex::new(inbox_rx),
        }
    }
}

impl PacketIo for SimIo {
    async fn bind_interface(
        &self,
        ifname: &str,
        _ifindex: u32,
    ) -> std::io::Result<()> {
        self.net
            .inner
            .lock()
            .unwrap()
            .endpoints
            .insert(ifname.to_owned(), self.inbox_tx.clone());
        Ok(())
    }

    async fn unbind_interface(&self, ifname: &str) -> std::io::Result<()> {
        self.net.inner.lock().unwrap().endpoints.remove(ifname);
        Ok(())
    }

    async fn send_packet(
        &self,
        ifname: &str,
        dst: PacketDest,
        data: Bytes,
    ) -> std::io::Result<()> {
        // Snapshot the deliveries under the lock, then apply the one-way
        // delays off it.
        let deliveries = {
            let mut inner = self.net.inner.lock().unwrap();
            inner.tx_log.push(TxRecord {
                ifname: ifname.to_owned(),
                dst,
                data: data.clone(),
            });
            inner
                .links
                .get(ifname)
                .into_iter()
                .flatten()
                .filter_map(|(to, delay)| {
                    inner
                        .endpoints
                        .get(to)
                        .map(|inbox| (to.clone(), *delay, inbox.clone()))
                })
                .collect::<Vec<_>>()
        };

        for (ifname, delay, inbox) in deliveries {
            let data = data.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let _ = inbox.send(RxPacket {
                    ifname,
                    data,
                    recv_ts_us: now_us(),
                });
            });
        }

        Ok(())
    }

    async fn recv_packet(&self) -> std::io::Result<RxPacket> {
        match self.inbox_rx.lock().await.recv().await {
            Some(packet) => Ok(packet),
            // The inbox can't close while this endpoint holds its sender.
            None => std::future::pending().await,
        }
    }
}
