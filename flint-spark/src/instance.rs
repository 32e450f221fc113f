//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flint_utils::task::Task;
use flint_utils::{
    Receiver, Responder, Sender, UnboundedReceiver, UnboundedSender,
};
use regex::{Regex, RegexBuilder};
use tokio::sync::{mpsc, oneshot};

use crate::debug::Debug;
use crate::error::{Error, IoError};
use crate::events;
use crate::interface::{InterfaceBinding, SparkInterface};
use crate::io::{PacketDest, PacketIo, now_us};
use crate::neighbor::{
    NeighborEvent, NeighborEventKind, Neighbors, SparkNeighState,
};
use crate::packet::{
    HandshakeMsg, HelloMsg, HeartbeatMsg, PACKET_VERSION,
    PACKET_VERSION_LEGACY, PacketBody, PacketEnvelope,
};
use crate::tasks::{self, InputChannelsRx, InputChannelsTx};

// Counter names.
pub(crate) const COUNTER_HELLO_RX: &str = "spark.hello_packet_recv";
pub(crate) const COUNTER_HELLO_TX: &str = "spark.hello_packet_sent";
pub(crate) const COUNTER_INVALID_PACKETS: &str =
    "spark.invalid_keepalive_packets";
pub(crate) const COUNTER_NEIGHBOR_UP: &str = "spark.neighbor_up";
pub(crate) const COUNTER_NEIGHBOR_DOWN: &str = "spark.neighbor_down";
pub(crate) const COUNTER_NEIGHBOR_RESTART: &str = "spark.neighbor_restart";
pub(crate) const COUNTER_NEIGHBOR_RTT_CHANGE: &str =
    "spark.neighbor_rtt_change";

// Protocol version pair advertised in every message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct VersionInfo {
    pub version: u32,
    pub supported_version: u32,
}

// Engine timing knobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SparkTimers {
    // Baseline hello emission period.
    pub hello_time: Duration,
    // Accelerated hello period used until the first adjacency forms.
    pub fast_init_hello_time: Duration,
    // Hello period of the predecessor protocol.
    pub keep_alive_time: Duration,
    // Handshake retransmission period during negotiation.
    pub handshake_time: Duration,
    // Heartbeat emission period.
    pub heartbeat_time: Duration,
    // Maximum time to remain in NEGOTIATE.
    pub negotiate_hold_time: Duration,
    // Liveness deadline for established neighbors.
    pub heartbeat_hold_time: Duration,
    // Maximum time to remain in RESTARTING.
    pub gr_hold_time: Duration,
}

// One administrative area: neighbors whose node name matches one of the
// neighbor regexes, seen over an interface matching one of the interface
// regexes, belong to it. The first matching area in configuration order
// wins.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AreaConfig {
    pub area_id: String,
    pub neighbor_regexes: Vec<String>,
    pub interface_regexes: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct SparkConfig {
    pub node_name: String,
    pub domain_name: String,
    pub enable_v4: bool,
    pub enable_spark2: bool,
    pub increase_hello_interval: bool,
    pub version: VersionInfo,
    pub areas: Vec<AreaConfig>,
    pub timers: SparkTimers,
}

// Area configuration with compiled regexes.
#[derive(Debug)]
pub(crate) struct CompiledAreas(Vec<CompiledArea>);

#[derive(Debug)]
struct CompiledArea {
    area_id: String,
    neighbor_res: Vec<Regex>,
    interface_res: Vec<Regex>,
}

// Commands from the handle to the engine task.
#[derive(Debug)]
pub(crate) enum CommandMsg {
    UpdateInterfaceDb {
        interfaces: Vec<InterfaceBinding>,
        responder: Responder<()>,
    },
    GetNeighborState {
        ifname: String,
        node_name: String,
        responder: Responder<Option<SparkNeighState>>,
    },
    GetCounters {
        responder: Responder<BTreeMap<String, i64>>,
    },
    Stop {
        graceful: bool,
        responder: Responder<()>,
    },
}

/// Handle to a running Spark engine.
///
/// Dropping the handle shuts the engine down gracefully (restarting
/// hellos are emitted on every tracked interface, so peers enter their
/// graceful-restart window instead of waiting for hold expiry).
#[derive(Debug)]
pub struct Spark {
    cmd_tx: Sender<CommandMsg>,
    event_rx: UnboundedReceiver<NeighborEvent>,
}

// The engine itself, owned by its event-loop task.
pub(crate) struct SparkInstance<IO> {
    pub(crate) config: SparkConfig,
    pub(crate) areas: CompiledAreas,
    pub(crate) io: Arc<IO>,
    // Tracked interfaces.
    pub(crate) interfaces: BTreeMap<String, SparkInterface>,
    // Discovered neighbors.
    pub(crate) neighbors: Neighbors,
    pub(crate) counters: BTreeMap<String, i64>,
    // Outbound event stream.
    pub(crate) event_tx: UnboundedSender<NeighborEvent>,
    // Engine input channels.
    pub(crate) tx: InputChannelsTx,
    _packet_rx_task: Task<()>,
}

// ===== impl VersionInfo =====

impl VersionInfo {
    // Returns whether the peer's [supported, current] version range
    // intersects the local one.
    pub(crate) fn intersects(
        &self,
        peer_version: u32,
        peer_supported_version: u32,
    ) -> bool {
        peer_version >= self.supported_version
            && self.version >= peer_supported_version
    }
}

impl Default for VersionInfo {
    fn default() -> VersionInfo {
        VersionInfo {
            version: 20,
            supported_version: 18,
        }
    }
}

// ===== impl SparkTimers =====

impl Default for SparkTimers {
    fn default() -> SparkTimers {
        SparkTimers {
            hello_time: Duration::from_secs(20),
            fast_init_hello_time: Duration::from_millis(500),
            keep_alive_time: Duration::from_secs(2),
            handshake_time: Duration::from_millis(500),
            heartbeat_time: Duration::from_secs(3),
            negotiate_hold_time: Duration::from_secs(10),
            heartbeat_hold_time: Duration::from_secs(10),
            gr_hold_time: Duration::from_secs(30),
        }
    }
}

// ===== impl AreaConfig =====

impl AreaConfig {
    pub fn new(
        area_id: impl Into<String>,
        neighbor_regexes: Vec<String>,
        interface_regexes: Vec<String>,
    ) -> AreaConfig {
        AreaConfig {
            area_id: area_id.into(),
            neighbor_regexes,
            interface_regexes,
        }
    }
}

// ===== impl SparkConfig =====

impl SparkConfig {
    pub fn new(
        node_name: impl Into<String>,
        domain_name: impl Into<String>,
    ) -> SparkConfig {
        SparkConfig {
            node_name: node_name.into(),
            domain_name: domain_name.into(),
            enable_v4: true,
            enable_spark2: true,
            increase_hello_interval: true,
            version: Default::default(),
            areas: Vec::new(),
            timers: Default::default(),
        }
    }
}

// ===== impl CompiledAreas =====

impl CompiledAreas {
    fn compile(areas: &[AreaConfig]) -> Result<CompiledAreas, Error> {
        let compile_set = |patterns: &[String]| {
            patterns
                .iter()
                // Patterns match whole names, case-insensitively.
                .map(|pattern| {
                    RegexBuilder::new(&format!("^(?:{pattern})$"))
                        .case_insensitive(true)
                        .build()
                        .map_err(Error::InvalidAreaRegex)
                })
                .collect::<Result<Vec<_>, _>>()
        };

        let mut compiled = Vec::new();
        for area in areas {
            compiled.push(CompiledArea {
                area_id: area.area_id.clone(),
                neighbor_res: compile_set(&area.neighbor_regexes)?,
                interface_res: compile_set(&area.interface_regexes)?,
            });
        }
        Ok(CompiledAreas(compiled))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    // Returns the first area accepting both the peer's node name and the
    // local interface name.
    pub(crate) fn match_peer(
        &self,
        node_name: &str,
        ifname: &str,
    ) -> Option<&str> {
        self.0
            .iter()
            .find(|area| {
                area.neighbor_res.iter().any(|re| re.is_match(node_name))
                    && area.interface_res.iter().any(|re| re.is_match(ifname))
            })
            .map(|area| area.area_id.as_str())
    }
}

// ===== impl Spark =====

impl Spark {
    /// Starts a new Spark engine over the given packet I/O provider.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<IO: PacketIo>(
        config: SparkConfig,
        io: IO,
    ) -> Result<Spark, Error> {
        let areas = CompiledAreas::compile(&config.areas)?;
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = tasks::input_channels();

        let io = Arc::new(io);
        let packet_rx_task = tasks::packet_rx(io.clone(), &input_tx.rx_packet);

        let instance = SparkInstance {
            config,
            areas,
            io,
            interfaces: Default::default(),
            neighbors: Default::default(),
            counters: Default::default(),
            event_tx,
            tx: input_tx,
            _packet_rx_task: packet_rx_task,
        };

        // The engine task is detached so that dropping the handle still
        // runs the graceful shutdown path.
        let mut task = Task::spawn(instance.run(cmd_rx, input_rx));
        task.detach();

        Ok(Spark { cmd_tx, event_rx })
    }

    /// Replaces the authoritative set of tracked interfaces.
    ///
    /// Additions start hello emission; removals instantly tear down all
    /// neighbors anchored there.
    pub async fn update_interface_db(
        &self,
        interfaces: Vec<InterfaceBinding>,
    ) -> Result<(), Error> {
        let (responder, rx) = oneshot::channel();
        self.cmd_tx
            .send(CommandMsg::UpdateInterfaceDb {
                interfaces,
                responder,
            })
            .await
            .map_err(|_| Error::EngineClosed)?;
        rx.await.map_err(|_| Error::EngineClosed)
    }

    /// Returns the FSM state of the given neighbor, if it is known.
    pub async fn get_neighbor_state(
        &self,
        ifname: &str,
        node_name: &str,
    ) -> Option<SparkNeighState> {
        let (responder, rx) = oneshot::channel();
        self.cmd_tx
            .send(CommandMsg::GetNeighborState {
                ifname: ifname.to_owned(),
                node_name: node_name.to_owned(),
                responder,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Returns a snapshot of the engine counters.
    pub async fn get_counters(&self) -> Result<BTreeMap<String, i64>, Error> {
        let (responder, rx) = oneshot::channel();
        self.cmd_tx
            .send(CommandMsg::GetCounters { responder })
            .await
            .map_err(|_| Error::EngineClosed)?;
        rx.await.map_err(|_| Error::EngineClosed)
    }

    /// Receives the next neighbor event, waiting up to `timeout`.
    pub async fn recv_neighbor_event(
        &mut self,
        timeout: Duration,
    ) -> Option<NeighborEvent> {
        tokio::time::timeout(timeout, self.event_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Waits for an event of the given kind, discarding others.
    ///
    /// Each receive attempt waits up to `at_least`; the overall scan stops
    /// after `at_most`.
    pub async fn wait_for_event(
        &mut self,
        kind: NeighborEventKind,
        at_least: Duration,
        at_most: Duration,
    ) -> Option<NeighborEvent> {
        let deadline = tokio::time::Instant::now() + at_most;

        loop {
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let step = std::cmp::min(at_least, deadline - now);
            match tokio::time::timeout(step, self.event_rx.recv()).await {
                Ok(Some(event)) if event.kind == kind => return Some(event),
                Ok(Some(_)) => continue,
                Ok(None) => return None,
                Err(_) => continue,
            }
        }
    }

    /// Shuts the engine down gracefully, emitting restarting hellos.
    pub async fn stop(self) {
        let (responder, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(CommandMsg::Stop {
                graceful: true,
                responder,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Tears the engine down without notifying peers, as a crash would.
    pub async fn abort(self) {
        let (responder, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(CommandMsg::Stop {
                graceful: false,
                responder,
            })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

// ===== impl SparkInstance =====

impl<IO: PacketIo> SparkInstance<IO> {
    async fn run(
        mut self,
        mut cmd_rx: Receiver<CommandMsg>,
        mut input_rx: InputChannelsRx,
    ) {
        loop {
            tokio::select! {
                msg = cmd_rx.recv() => match msg {
                    Some(CommandMsg::UpdateInterfaceDb { interfaces, responder }) => {
                        events::process_interface_update(&mut self, interfaces)
                            .await;
                        let _ = responder.send(());
                    }
                    Some(CommandMsg::GetNeighborState { ifname, node_name, responder }) => {
                        let state = self
                            .neighbors
                            .get(&ifname, &node_name)
                            .map(|nbr| nbr.state);
                        let _ = responder.send(state);
                    }
                    Some(CommandMsg::GetCounters { responder }) => {
                        let _ = responder.send(self.counters.clone());
                    }
                    Some(CommandMsg::Stop { graceful, responder }) => {
                        if graceful {
                            self.send_restarting_hellos().await;
                        }
                        let _ = responder.send(());
                        return;
                    }
                    // The handle is gone.
                    None => {
                        self.send_restarting_hellos().await;
                        return;
                    }
                },
                Some(msg) = input_rx.recv() => {
                    if let Err(error) =
                        events::process_protocol_msg(&mut self, msg).await
                    {
                        error.log();
                    }
                }
            }
        }
    }

    pub(crate) fn counter_inc(&mut self, name: &str) {
        *self.counters.entry(name.to_owned()).or_default() += 1;
    }

    // Emits a neighbor lifecycle event.
    pub(crate) fn emit_event(&mut self, event: NeighborEvent) {
        let counter = match event.kind {
            NeighborEventKind::NeighborUp => COUNTER_NEIGHBOR_UP,
            NeighborEventKind::NeighborDown => COUNTER_NEIGHBOR_DOWN,
            NeighborEventKind::NeighborRestarting
            | NeighborEventKind::NeighborRestarted => COUNTER_NEIGHBOR_RESTART,
            NeighborEventKind::NeighborRttChange => {
                COUNTER_NEIGHBOR_RTT_CHANGE
            }
        };
        self.counter_inc(counter);
        let _ = self.event_tx.send(event);
    }

    // Returns the current hello emission period for an interface.
    pub(crate) fn hello_period(&self, fast_init: bool) -> Duration {
        if !self.config.enable_spark2 {
            self.config.timers.keep_alive_time
        } else if fast_init {
            self.config.timers.fast_init_hello_time
        } else {
            self.config.timers.hello_time
        }
    }

    // Encodes and sends one message out the given interface.
    pub(crate) async fn send_packet(
        &self,
        ifname: &str,
        dst: PacketDest,
        envelope: PacketEnvelope,
    ) {
        Debug::PacketTx(ifname, envelope.body.kind()).log();

        let data = Bytes::from(envelope.encode());
        if let Err(error) = self.io.send_packet(ifname, dst, data).await {
            IoError::SendError(error).log();
        }
    }

    // Sends a hello out the given interface, reflecting every neighbor
    // discovered there.
    pub(crate) async fn send_hello(
        &mut self,
        ifname: &str,
        restarting: bool,
        solicit_response: bool,
    ) {
        let Some(iface) = self.interfaces.get_mut(ifname) else {
            return;
        };
        let seq_num = iface.next_seq_num();
        let binding = iface.binding.clone();

        let neighbor_infos = self
            .neighbors
            .iter_by_ifname(ifname)
            .map(|nbr| (nbr.node_name.clone(), nbr.reflected))
            .collect();

        let timers = &self.config.timers;
        let (version, hold_time) = if self.config.enable_spark2 {
            (PACKET_VERSION, timers.heartbeat_hold_time)
        } else {
            // The predecessor protocol is hello-based; it advertises its
            // full hold window in every hello.
            (PACKET_VERSION_LEGACY, timers.gr_hold_time)
        };

        let hello = HelloMsg {
            node_name: self.config.node_name.clone(),
            domain_name: self.config.domain_name.clone(),
            version: self.config.version.version,
            supported_version: self.config.version.supported_version,
            ifname: ifname.to_owned(),
            transport_v4: self.config.enable_v4.then_some(binding.v4_cidr).flatten(),
            transport_v6: binding.v6_link_local,
            seq_num,
            neighbor_infos,
            hold_time,
            gr_hold_time: timers.gr_hold_time,
            solicit_response,
            restarting,
            sent_ts_us: now_us(),
        };

        self.counter_inc(COUNTER_HELLO_TX);
        let envelope = PacketEnvelope::new(version, PacketBody::Hello(hello));
        self.send_packet(ifname, PacketDest::Multicast, envelope).await;
    }

    // Sends a handshake towards the given negotiating neighbor.
    pub(crate) async fn send_handshake(
        &mut self,
        ifname: &str,
        node_name: &str,
        established: bool,
    ) {
        let Some(iface) = self.interfaces.get(ifname) else {
            return;
        };
        let binding = iface.binding.clone();
        let Some(nbr) = self.neighbors.get(ifname, node_name) else {
            return;
        };
        let dst = nbr
            .transport_v6
            .map(PacketDest::Unicast)
            .unwrap_or(PacketDest::Multicast);
        let neighbor_area = nbr.area.clone();

        let timers = &self.config.timers;
        let handshake = HandshakeMsg {
            node_name: self.config.node_name.clone(),
            version: self.config.version.version,
            supported_version: self.config.version.supported_version,
            ifname: ifname.to_owned(),
            transport_v4: self.config.enable_v4.then_some(binding.v4_cidr).flatten(),
            transport_v6: binding.v6_link_local,
            hold_time: timers.heartbeat_hold_time,
            gr_hold_time: timers.gr_hold_time,
            neighbor_area,
            established,
        };

        let envelope = PacketEnvelope::new(
            PACKET_VERSION,
            PacketBody::Handshake(handshake),
        );
        self.send_packet(ifname, dst, envelope).await;
    }

    // Sends heartbeats out the given interface, one unicast per
    // established neighbor.
    pub(crate) async fn send_heartbeat(&mut self, ifname: &str) {
        let Some(iface) = self.interfaces.get_mut(ifname) else {
            return;
        };
        let seq_num = iface.next_seq_num();

        let dsts = self
            .neighbors
            .iter_by_ifname(ifname)
            .filter(|nbr| nbr.state == SparkNeighState::Established)
            .map(|nbr| {
                nbr.transport_v6
                    .map(PacketDest::Unicast)
                    .unwrap_or(PacketDest::Multicast)
            })
            .collect::<Vec<_>>();

        for dst in dsts {
            let heartbeat = HeartbeatMsg {
                node_name: self.config.node_name.clone(),
                seq_num,
            };
            let envelope = PacketEnvelope::new(
                PACKET_VERSION,
                PacketBody::Heartbeat(heartbeat),
            );
            self.send_packet(ifname, dst, envelope).await;
        }
    }

    // Announces a graceful shutdown on every tracked interface.
    async fn send_restarting_hellos(&mut self) {
        let ifnames = self.interfaces.keys().cloned().collect::<Vec<_>>();
        for ifname in ifnames {
            self.send_hello(&ifname, true, false).await;
        }
    }
}
