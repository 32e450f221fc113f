//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

use flint_utils::{UnboundedReceiver, UnboundedSender};
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::NeighborUpdate;

// Registry of neighbor-change observers.
//
// Fanout is message-passing: every subscriber owns an inbox channel and
// the facade enqueues a copy of each update, so no subscriber code ever
// runs inside the facade's loop. A subscriber whose inbox is gone is
// evicted before the next fanout.
#[derive(Debug, Default)]
pub(crate) struct ObserverRegistry {
    subscribers: Vec<UnboundedSender<NeighborUpdate>>,
}

// ===== impl ObserverRegistry =====

impl ObserverRegistry {
    pub(crate) fn register(&mut self) -> UnboundedReceiver<NeighborUpdate> {
        debug!("registered neighbor observer");

        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub(crate) fn notify(&mut self, update: &NeighborUpdate) {
        self.subscribers.retain(|subscriber| {
            let delivered = subscriber.send(update.clone()).is_ok();
            if !delivered {
                debug!("evicting broken neighbor observer");
            }
            delivered
        });
    }
}
