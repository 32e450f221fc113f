//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod debug;
pub mod error;
mod events;
pub mod instance;
pub mod interface;
pub mod io;
pub mod neighbor;
pub mod packet;
mod tasks;

pub use error::Error;
pub use instance::{AreaConfig, Spark, SparkConfig, SparkTimers, VersionInfo};
pub use interface::InterfaceBinding;
pub use io::{PacketIo, RxPacket};
pub use neighbor::{NeighborEvent, NeighborEventKind, SparkNeighState};
