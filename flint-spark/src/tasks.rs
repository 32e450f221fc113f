//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::Arc;
use std::time::Duration;

use flint_utils::Sender;
use flint_utils::task::{IntervalTask, Task, TimeoutTask};
use tokio::sync::mpsc;

use crate::error::IoError;
use crate::io::PacketIo;

//
// Spark tasks diagram:
//
//                                 +--------------+
//                 packet_rx (1x) -> |            | <- (1x) commands
//             hello_interval (Nx) ->|            |
//         heartbeat_interval (Nx) ->|   engine   | -> neighbor events
//         handshake_interval (Nx) ->|            |
//  hold/negotiate/gr timers (Nx) -> |            |
//                                 +--------------+
//

// Spark inter-task message types.
pub(crate) mod messages {
    // Input messages (child task -> engine task).
    pub(crate) mod input {
        use crate::io::RxPacket;

        #[derive(Debug)]
        pub(crate) enum ProtocolMsg {
            RxPacket(RxPacketMsg),
            HelloTimer(HelloTimerMsg),
            HandshakeTimer(HandshakeTimerMsg),
            HeartbeatTimer(HeartbeatTimerMsg),
            HoldTimer(HoldTimerMsg),
            NegotiateTimer(NegotiateTimerMsg),
            GrTimer(GrTimerMsg),
        }

        #[derive(Debug)]
        pub(crate) struct RxPacketMsg {
            pub(crate) packet: RxPacket,
        }

        #[derive(Debug)]
        pub(crate) struct HelloTimerMsg {
            pub(crate) ifname: String,
        }

        #[derive(Debug)]
        pub(crate) struct HandshakeTimerMsg {
            pub(crate) ifname: String,
            pub(crate) node_name: String,
        }

        #[derive(Debug)]
        pub(crate) struct HeartbeatTimerMsg {
            pub(crate) ifname: String,
        }

        #[derive(Debug)]
        pub(crate) struct HoldTimerMsg {
            pub(crate) ifname: String,
            pub(crate) node_name: String,
        }

        #[derive(Debug)]
        pub(crate) struct NegotiateTimerMsg {
            pub(crate) ifname: String,
            pub(crate) node_name: String,
        }

        #[derive(Debug)]
        pub(crate) struct GrTimerMsg {
            pub(crate) ifname: String,
            pub(crate) node_name: String,
        }
    }
}

use messages::input::*;

// Engine input channels (Tx side, cloned into child tasks).
#[derive(Clone, Debug)]
pub(crate) struct InputChannelsTx {
    pub(crate) rx_packet: Sender<RxPacketMsg>,
    pub(crate) hello_timer: Sender<HelloTimerMsg>,
    pub(crate) handshake_timer: Sender<HandshakeTimerMsg>,
    pub(crate) heartbeat_timer: Sender<HeartbeatTimerMsg>,
    pub(crate) hold_timer: Sender<HoldTimerMsg>,
    pub(crate) negotiate_timer: Sender<NegotiateTimerMsg>,
    pub(crate) gr_timer: Sender<GrTimerMsg>,
}

// Engine input channels (Rx side, owned by the engine task).
#[derive(Debug)]
pub(crate) struct InputChannelsRx {
    rx_packet: tokio::sync::mpsc::Receiver<RxPacketMsg>,
    hello_timer: tokio::sync::mpsc::Receiver<HelloTimerMsg>,
    handshake_timer: tokio::sync::mpsc::Receiver<HandshakeTimerMsg>,
    heartbeat_timer: tokio::sync::mpsc::Receiver<HeartbeatTimerMsg>,
    hold_timer: tokio::sync::mpsc::Receiver<HoldTimerMsg>,
    negotiate_timer: tokio::sync::mpsc::Receiver<NegotiateTimerMsg>,
    gr_timer: tokio::sync::mpsc::Receiver<GrTimerMsg>,
}

// ===== impl InputChannelsRx =====

impl InputChannelsRx {
    pub(crate) async fn recv(&mut self) -> Option<ProtocolMsg> {
        tokio::select! {
            msg = self.rx_packet.recv() => {
                msg.map(ProtocolMsg::RxPacket)
            }
            msg = self.hello_timer.recv() => {
                msg.map(ProtocolMsg::HelloTimer)
            }
            msg = self.handshake_timer.recv() => {
                msg.map(ProtocolMsg::HandshakeTimer)
            }
            msg = self.heartbeat_timer.recv() => {
                msg.map(ProtocolMsg::HeartbeatTimer)
            }
            msg = self.hold_timer.recv() => {
                msg.map(ProtocolMsg::HoldTimer)
            }
            msg = self.negotiate_timer.recv() => {
                msg.map(ProtocolMsg::NegotiateTimer)
            }
            msg = self.gr_timer.recv() => {
                msg.map(ProtocolMsg::GrTimer)
            }
        }
    }
}

// ===== global functions =====

pub(crate) fn input_channels() -> (InputChannelsTx, InputChannelsRx) {
    let (rx_packetp, rx_packetc) = mpsc::channel(64);
    let (hello_timerp, hello_timerc) = mpsc::channel(4);
    let (handshake_timerp, handshake_timerc) = mpsc::channel(4);
    let (heartbeat_timerp, heartbeat_timerc) = mpsc::channel(4);
    let (hold_timerp, hold_timerc) = mpsc::channel(4);
    let (negotiate_timerp, negotiate_timerc) = mpsc::channel(4);
    let (gr_timerp, gr_timerc) = mpsc::channel(4);

    let tx = InputChannelsTx {
        rx_packet: rx_packetp,
        hello_timer: hello_timerp,
        handshake_timer: handshake_timerp,
        heartbeat_timer: heartbeat_timerp,
        hold_timer: hold_timerp,
        negotiate_timer: negotiate_timerp,
        gr_timer: gr_timerp,
    };
    let rx = InputChannelsRx {
        rx_packet: rx_packetc,
        hello_timer: hello_timerc,
        handshake_timer: handshake_timerc,
        heartbeat_timer: heartbeat_timerc,
        hold_timer: hold_timerc,
        negotiate_timer: negotiate_timerc,
        gr_timer: gr_timerc,
    };

    (tx, rx)
}

// ===== Spark tasks =====

// Packet Rx task.
pub(crate) fn packet_rx<IO: PacketIo>(
    io: Arc<IO>,
    rx_packetp: &Sender<RxPacketMsg>,
) -> Task<()> {
    let rx_packetp = rx_packetp.clone();
    Task::spawn(async move {
        loop {
            let packet = match io.recv_packet().await {
                Ok(packet) => packet,
                Err(error) => {
                    IoError::RecvError(error).log();
                    continue;
                }
            };

            let msg = RxPacketMsg { packet };
            if rx_packetp.send(msg).await.is_err() {
                // Engine is gone.
                return;
            }
        }
    })
}

// Periodic hello emission for one interface.
pub(crate) fn hello_interval(
    ifname: &str,
    period: Duration,
    hello_timerp: &Sender<HelloTimerMsg>,
) -> IntervalTask {
    let ifname = ifname.to_owned();
    let hello_timerp = hello_timerp.clone();
    IntervalTask::new(period, true, move || {
        let ifname = ifname.clone();
        let hello_timerp = hello_timerp.clone();
        async move {
            let msg = HelloTimerMsg { ifname };
            let _ = hello_timerp.send(msg).await;
        }
    })
}

// Periodic handshake transmission towards one negotiating neighbor.
pub(crate) fn handshake_interval(
    ifname: &str,
    node_name: &str,
    period: Duration,
    handshake_timerp: &Sender<HandshakeTimerMsg>,
) -> IntervalTask {
    let ifname = ifname.to_owned();
    let node_name = node_name.to_owned();
    let handshake_timerp = handshake_timerp.clone();
    IntervalTask::new(period, true, move || {
        let ifname = ifname.clone();
        let node_name = node_name.clone();
        let handshake_timerp = handshake_timerp.clone();
        async move {
            let msg = HandshakeTimerMsg { ifname, node_name };
            let _ = handshake_timerp.send(msg).await;
        }
    })
}

// Periodic heartbeat emission for one interface.
pub(crate) fn heartbeat_interval(
    ifname: &str,
    period: Duration,
    heartbeat_timerp: &Sender<HeartbeatTimerMsg>,
) -> IntervalTask {
    let ifname = ifname.to_owned();
    let heartbeat_timerp = heartbeat_timerp.clone();
    IntervalTask::new(period, true, move || {
        let ifname = ifname.clone();
        let heartbeat_timerp = heartbeat_timerp.clone();
        async move {
            let msg = HeartbeatTimerMsg { ifname };
            let _ = heartbeat_timerp.send(msg).await;
        }
    })
}

// Liveness deadline for an established neighbor.
pub(crate) fn hold_timer(
    ifname: &str,
    node_name: &str,
    holdtime: Duration,
    hold_timerp: &Sender<HoldTimerMsg>,
) -> TimeoutTask {
    let ifname = ifname.to_owned();
    let node_name = node_name.to_owned();
    let hold_timerp = hold_timerp.clone();
    TimeoutTask::new(holdtime, move || async move {
        let msg = HoldTimerMsg { ifname, node_name };
        let _ = hold_timerp.send(msg).await;
    })
}

// Deadline for the negotiation stage.
pub(crate) fn negotiate_timer(
    ifname: &str,
    node_name: &str,
    holdtime: Duration,
    negotiate_timerp: &Sender<NegotiateTimerMsg>,
) -> TimeoutTask {
    let ifname = ifname.to_owned();
    let node_name = node_name.to_owned();
    let negotiate_timerp = negotiate_timerp.clone();
    TimeoutTask::new(holdtime, move || async move {
        let msg = NegotiateTimerMsg { ifname, node_name };
        let _ = negotiate_timerp.send(msg).await;
    })
}

// Graceful-restart deadline for a restarting neighbor.
pub(crate) fn gr_timer(
    ifname: &str,
    node_name: &str,
    holdtime: Duration,
    gr_timerp: &Sender<GrTimerMsg>,
) -> TimeoutTask {
    let ifname = ifname.to_owned();
    let node_name = node_name.to_owned();
    let gr_timerp = gr_timerp.clone();
    TimeoutTask::new(holdtime, move || async move {
        let msg = GrTimerMsg { ifname, node_name };
        let _ = gr_timerp.send(msg).await;
    })
}
