//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flint_fib::transport::{
    FibTransport, LinkFlags, LinkInfo, NeighborUpdate, RouteTableKind,
};
use flint_fib::Error;
use flint_utils::UnboundedReceiver;
use flint_utils::southbound::{KernelRoute, KernelRouteKey};
use tokio::sync::mpsc;

// In-memory kernel stand-in.
#[derive(Debug, Default)]
pub struct MockState {
    pub routes: BTreeMap<(u8, KernelRouteKey), KernelRoute>,
    pub links: Vec<LinkInfo>,
    // Fault injection.
    pub fail_writes: bool,
    pub fail_reads: bool,
    pub hang_sync: bool,
}

#[derive(Clone, Debug)]
pub struct MockTransport {
    pub state: Arc<Mutex<MockState>>,
    neighbor_tx: mpsc::UnboundedSender<NeighborUpdate>,
    neighbor_rx:
        Arc<Mutex<Option<UnboundedReceiver<NeighborUpdate>>>>,
}

impl MockTransport {
    pub fn new(links: Vec<LinkInfo>) -> MockTransport {
        let (neighbor_tx, neighbor_rx) = mpsc::unbounded_channel();
        MockTransport {
            state: Arc::new(Mutex::new(MockState {
                links,
                ..Default::default()
            })),
            neighbor_tx,
            neighbor_rx: Arc::new(Mutex::new(Some(neighbor_rx))),
        }
    }

    // Simulates a kernel neighbor table change.
    pub fn inject_neighbor_update(&self, update: NeighborUpdate) {
        self.neighbor_tx.send(update).unwrap();
    }

    pub fn route_snapshot(&self) -> Vec<KernelRoute> {
        self.state.lock().unwrap().routes.values().cloned().collect()
    }
}

pub fn default_links() -> Vec<LinkInfo> {
    vec![
        LinkInfo::new("lo".to_owned(), 1, LinkFlags::LOOPBACK),
        LinkInfo::new(
            "eth0".to_owned(),
            2,
            LinkFlags::OPERATIVE,
        ),
        LinkInfo::new(
            "eth1".to_owned(),
            3,
            LinkFlags::OPERATIVE,
        ),
    ]
}

fn kind_of(key: &KernelRouteKey) -> RouteTableKind {
    match key {
        KernelRouteKey::Unicast(_) => RouteTableKind::Unicast,
        KernelRouteKey::Mpls(_) => RouteTableKind::Mpls,
    }
}

impl FibTransport for MockTransport {
    async fn add_route(&self, route: &KernelRoute) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(Error::NetlinkFailure("injected failure".to_owned()));
        }
        state
            .routes
            .insert((route.protocol_id, route.key), route.clone());
        Ok(())
    }

    async fn del_route(
        &self,
        protocol_id: u8,
        key: &KernelRouteKey,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.fail_writes {
            return Err(Error::NetlinkFailure("injected failure".to_owned()));
        }
        state.routes.remove(&(protocol_id, *key));
        Ok(())
    }

    async fn sync_routes(
        &self,
        protocol_id: u8,
        kind: RouteTableKind,
        routes: Vec<KernelRoute>,
    ) -> Result<(), Error> {
        let hang = self.state.lock().unwrap().hang_sync;
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        let mut state = self.state.lock().unwrap();
        state.routes.retain(|(route_protocol, key), _| {
            *route_protocol != protocol_id || kind_of(key) != kind
        });
        for route in routes {
            state.routes.insert((protocol_id, route.key), route);
        }
        Ok(())
    }

    async fn get_routes(
        &self,
        protocol_id: u8,
        kind: RouteTableKind,
    ) -> Result<Vec<KernelRoute>, Error> {
        let state = self.state.lock().unwrap();
        if state.fail_reads {
            return Err(Error::NetlinkFailure("injected failure".to_owned()));
        }
        Ok(state
            .routes
            .iter()
            .filter(|((route_protocol, key), _)| {
                *route_protocol == protocol_id && kind_of(key) == kind
            })
            .map(|(_, route)| route.clone())
            .collect())
    }

    async fn route_count(&self) -> Result<i64, Error> {
        Ok(self.state.lock().unwrap().routes.len() as i64)
    }

    async fn get_all_links(&self) -> Result<Vec<LinkInfo>, Error> {
        Ok(self.state.lock().unwrap().links.clone())
    }

    fn subscribe_neighbors(&self) -> UnboundedReceiver<NeighborUpdate> {
        self.neighbor_rx
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| mpsc::unbounded_channel().1)
    }
}
