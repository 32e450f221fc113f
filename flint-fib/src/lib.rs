//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod error;
mod interface;
mod observer;
pub mod route;
pub mod transport;

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use chrono::Utc;
use flint_utils::southbound::{
    KernelRouteKey, MplsRoute, UnicastRoute,
};
use flint_utils::{Receiver, Responder, Sender, UnboundedReceiver};
use ipnetwork::IpNetwork;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

pub use crate::error::Error;
use crate::interface::InterfaceCache;
use crate::observer::ObserverRegistry;
pub use crate::route::{CLIENT_ID_BGP, CLIENT_ID_LINK_STATE, CLIENT_ID_STATIC};
pub use crate::transport::{
    FibTransport, LinkFlags, LinkInfo, NeighborUpdate, NetlinkTransport,
    RouteTableKind,
};

// The one counter external consumers depend on.
pub const COUNTER_NUM_OF_ROUTES: &str = "fibagent.num_of_routes";

// External deadline on FIB synchronization. Exceeding it aborts the sync
// and leaves partial kernel state for the client to retry over.
const SYNC_FIB_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServiceStatus {
    Alive,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SwitchRunState {
    Configured,
}

// Requests served by the facade event loop.
#[derive(Debug)]
enum Request {
    AddUnicastRoutes {
        client_id: i16,
        routes: Vec<UnicastRoute>,
        responder: Responder<Result<(), Error>>,
    },
    DeleteUnicastRoutes {
        client_id: i16,
        prefixes: Vec<IpNetwork>,
        responder: Responder<Result<(), Error>>,
    },
    AddMplsRoutes {
        client_id: i16,
        routes: Vec<MplsRoute>,
        responder: Responder<Result<(), Error>>,
    },
    DeleteMplsRoutes {
        client_id: i16,
        top_labels: Vec<u32>,
        responder: Responder<Result<(), Error>>,
    },
    SyncFib {
        client_id: i16,
        routes: Vec<UnicastRoute>,
        responder: Responder<Result<(), Error>>,
    },
    SyncMplsFib {
        client_id: i16,
        routes: Vec<MplsRoute>,
        responder: Responder<Result<(), Error>>,
    },
    GetRouteTable {
        client_id: i16,
        responder: Responder<Result<Vec<UnicastRoute>, Error>>,
    },
    GetMplsRouteTable {
        client_id: i16,
        responder: Responder<Result<Vec<MplsRoute>, Error>>,
    },
    GetCounters {
        responder: Responder<BTreeMap<String, i64>>,
    },
    RegisterNeighborObserver {
        responder: Responder<UnboundedReceiver<NeighborUpdate>>,
    },
    SendNeighborDownInfo {
        addrs: Vec<IpAddr>,
        responder: Responder<()>,
    },
}

/// Handle to a running FIB facade.
///
/// Every route operation resolves once the facade's event loop has heard
/// back from the kernel transport; the caller is never blocked.
#[derive(Clone, Debug)]
pub struct FibHandle {
    req_tx: Sender<Request>,
    alive_since: i64,
}

// The facade itself, owned by its event-loop task.
struct Fib<T> {
    transport: T,
    cache: InterfaceCache,
    observers: ObserverRegistry,
}

// ===== impl FibHandle =====

impl FibHandle {
    /// Starts a new FIB facade over the given kernel transport.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<T: FibTransport>(transport: T) -> FibHandle {
        let (req_tx, req_rx) = mpsc::channel(16);
        let neighbor_rx = transport.subscribe_neighbors();

        let fib = Fib {
            transport,
            cache: Default::default(),
            observers: Default::default(),
        };
        tokio::spawn(fib.run(req_rx, neighbor_rx));

        FibHandle {
            req_tx,
            alive_since: Utc::now().timestamp(),
        }
    }

    /// Adds or replaces one unicast route.
    pub async fn add_unicast_route(
        &self,
        client_id: i16,
        route: UnicastRoute,
    ) -> Result<(), Error> {
        self.add_unicast_routes(client_id, vec![route]).await
    }

    /// Adds or replaces a batch of unicast routes. Best-effort
    /// sequential: the first failure aborts the batch, leaving prior
    /// routes applied.
    pub async fn add_unicast_routes(
        &self,
        client_id: i16,
        routes: Vec<UnicastRoute>,
    ) -> Result<(), Error> {
        self.request(|responder| Request::AddUnicastRoutes {
            client_id,
            routes,
            responder,
        })
        .await?
    }

    /// Deletes one unicast route.
    pub async fn delete_unicast_route(
        &self,
        client_id: i16,
        prefix: IpNetwork,
    ) -> Result<(), Error> {
        self.delete_unicast_routes(client_id, vec![prefix]).await
    }

    /// Deletes a batch of unicast routes, best-effort sequential.
    pub async fn delete_unicast_routes(
        &self,
        client_id: i16,
        prefixes: Vec<IpNetwork>,
    ) -> Result<(), Error> {
        self.request(|responder| Request::DeleteUnicastRoutes {
            client_id,
            prefixes,
            responder,
        })
        .await?
    }

    /// Adds or replaces one MPLS route.
    pub async fn add_mpls_route(
        &self,
        client_id: i16,
        route: MplsRoute,
    ) -> Result<(), Error> {
        self.add_mpls_routes(client_id, vec![route]).await
    }

    /// Adds or replaces a batch of MPLS routes, best-effort sequential.
    pub async fn add_mpls_routes(
        &self,
        client_id: i16,
        routes: Vec<MplsRoute>,
    ) -> Result<(), Error> {
        self.request(|responder| Request::AddMplsRoutes {
            client_id,
            routes,
            responder,
        })
        .await?
    }

    /// Deletes one MPLS route.
    pub async fn delete_mpls_route(
        &self,
        client_id: i16,
        top_label: u32,
    ) -> Result<(), Error> {
        self.delete_mpls_routes(client_id, vec![top_label]).await
    }

    /// Deletes a batch of MPLS routes, best-effort sequential.
    pub async fn delete_mpls_routes(
        &self,
        client_id: i16,
        top_labels: Vec<u32>,
    ) -> Result<(), Error> {
        self.request(|responder| Request::DeleteMplsRoutes {
            client_id,
            top_labels,
            responder,
        })
        .await?
    }

    /// Replaces the client's entire unicast route set.
    pub async fn sync_fib(
        &self,
        client_id: i16,
        routes: Vec<UnicastRoute>,
    ) -> Result<(), Error> {
        self.request(|responder| Request::SyncFib {
            client_id,
            routes,
            responder,
        })
        .await?
    }

    /// Replaces the client's entire MPLS route set.
    pub async fn sync_mpls_fib(
        &self,
        client_id: i16,
        routes: Vec<MplsRoute>,
    ) -> Result<(), Error> {
        self.request(|responder| Request::SyncMplsFib {
            client_id,
            routes,
            responder,
        })
        .await?
    }

    /// Returns all unicast routes installed under the client's protocol
    /// ID. Read errors yield an empty list.
    pub async fn get_route_table_by_client(
        &self,
        client_id: i16,
    ) -> Result<Vec<UnicastRoute>, Error> {
        self.request(|responder| Request::GetRouteTable {
            client_id,
            responder,
        })
        .await?
    }

    /// Returns all MPLS routes installed under the client's protocol ID.
    /// Read errors yield an empty list.
    pub async fn get_mpls_route_table_by_client(
        &self,
        client_id: i16,
    ) -> Result<Vec<MplsRoute>, Error> {
        self.request(|responder| Request::GetMplsRouteTable {
            client_id,
            responder,
        })
        .await?
    }

    /// Subscribes to neighbor add/remove notifications. The returned
    /// channel is the subscriber's private inbox.
    pub async fn register_for_neighbor_changed(
        &self,
    ) -> Result<UnboundedReceiver<NeighborUpdate>, Error> {
        self.request(|responder| Request::RegisterNeighborObserver {
            responder,
        })
        .await
    }

    /// Injects a synthetic "these neighbors are gone" notification to all
    /// subscribers.
    pub async fn send_neighbor_down_info(
        &self,
        addrs: Vec<IpAddr>,
    ) -> Result<(), Error> {
        self.request(|responder| Request::SendNeighborDownInfo {
            addrs,
            responder,
        })
        .await
    }

    /// Returns the facade counters.
    pub async fn get_counters(&self) -> Result<BTreeMap<String, i64>, Error> {
        self.request(|responder| Request::GetCounters { responder })
            .await
    }

    /// Unix timestamp of facade startup.
    pub fn alive_since(&self) -> i64 {
        self.alive_since
    }

    pub fn get_status(&self) -> ServiceStatus {
        ServiceStatus::Alive
    }

    pub fn get_switch_run_state(&self) -> SwitchRunState {
        SwitchRunState::Configured
    }

    async fn request<R>(
        &self,
        build: impl FnOnce(Responder<R>) -> Request,
    ) -> Result<R, Error> {
        let (responder, rx) = oneshot::channel();
        self.req_tx
            .send(build(responder))
            .await
            .map_err(|_| Error::AgentClosed)?;
        rx.await.map_err(|_| Error::AgentClosed)
    }
}

// ===== impl Fib =====

impl<T: FibTransport> Fib<T> {
    async fn run(
        mut self,
        mut req_rx: Receiver<Request>,
        mut neighbor_rx: UnboundedReceiver<NeighborUpdate>,
    ) {
        loop {
            tokio::select! {
                request = req_rx.recv() => match request {
                    Some(request) => self.process_request(request).await,
                    // All handles are gone.
                    None => return,
                },
                Some(update) = neighbor_rx.recv() => {
                    self.observers.notify(&update);
                }
            }
        }
    }

    async fn process_request(&mut self, request: Request) {
        match request {
            Request::AddUnicastRoutes {
                client_id,
                routes,
                responder,
            } => {
                let result = self.add_unicast_routes(client_id, routes).await;
                let _ = responder.send(result);
            }
            Request::DeleteUnicastRoutes {
                client_id,
                prefixes,
                responder,
            } => {
                let result =
                    self.delete_unicast_routes(client_id, prefixes).await;
                let _ = responder.send(result);
            }
            Request::AddMplsRoutes {
                client_id,
                routes,
                responder,
            } => {
                let result = self.add_mpls_routes(client_id, routes).await;
                let _ = responder.send(result);
            }
            Request::DeleteMplsRoutes {
                client_id,
                top_labels,
                responder,
            } => {
                let result =
                    self.delete_mpls_routes(client_id, top_labels).await;
                let _ = responder.send(result);
            }
            Request::SyncFib {
                client_id,
                routes,
                responder,
            } => {
                let result = self.sync_fib(client_id, routes).await;
                let _ = responder.send(result);
            }
            Request::SyncMplsFib {
                client_id,
                routes,
                responder,
            } => {
                let result = self.sync_mpls_fib(client_id, routes).await;
                let _ = responder.send(result);
            }
            Request::GetRouteTable {
                client_id,
                responder,
            } => {
                let result = self.get_route_table(client_id).await;
                let _ = responder.send(result);
            }
            Request::GetMplsRouteTable {
                client_id,
                responder,
            } => {
                let result = self.get_mpls_route_table(client_id).await;
                let _ = responder.send(result);
            }
            Request::GetCounters { responder } => {
                let _ = responder.send(self.get_counters().await);
            }
            Request::RegisterNeighborObserver { responder } => {
                let _ = responder.send(self.observers.register());
            }
            Request::SendNeighborDownInfo { addrs, responder } => {
                // Only the removed list is populated; an empty added list
                // means "no additions".
                let update = NeighborUpdate::new(Vec::new(), addrs);
                self.observers.notify(&update);
                let _ = responder.send(());
            }
        }
    }

    async fn add_unicast_routes(
        &self,
        client_id: i16,
        routes: Vec<UnicastRoute>,
    ) -> Result<(), Error> {
        let protocol_id = route::client_to_protocol(client_id)?;

        for client_route in routes {
            debug!(client_id, dest = %client_route.dest, "adding unicast route");
            let kernel_route = route::build_unicast_route(
                &self.cache,
                &self.transport,
                protocol_id,
                &client_route,
            )
            .await?;
            self.transport.add_route(&kernel_route).await?;
        }

        Ok(())
    }

    async fn delete_unicast_routes(
        &self,
        client_id: i16,
        prefixes: Vec<IpNetwork>,
    ) -> Result<(), Error> {
        let protocol_id = route::client_to_protocol(client_id)?;

        for prefix in prefixes {
            debug!(client_id, dest = %prefix, "deleting unicast route");
            self.transport
                .del_route(protocol_id, &KernelRouteKey::Unicast(prefix))
                .await?;
        }

        Ok(())
    }

    async fn add_mpls_routes(
        &self,
        client_id: i16,
        routes: Vec<MplsRoute>,
    ) -> Result<(), Error> {
        let protocol_id = route::client_to_protocol(client_id)?;

        for client_route in routes {
            debug!(client_id, top_label = client_route.top_label, "adding MPLS route");
            let kernel_route = route::build_mpls_route(
                &self.cache,
                &self.transport,
                protocol_id,
                &client_route,
            )
            .await?;
            self.transport.add_route(&kernel_route).await?;
        }

        Ok(())
    }

    async fn delete_mpls_routes(
        &self,
        client_id: i16,
        top_labels: Vec<u32>,
    ) -> Result<(), Error> {
        let protocol_id = route::client_to_protocol(client_id)?;

        for top_label in top_labels {
            debug!(client_id, top_label, "deleting MPLS route");
            self.transport
                .del_route(protocol_id, &KernelRouteKey::Mpls(top_label))
                .await?;
        }

        Ok(())
    }

    async fn sync_fib(
        &self,
        client_id: i16,
        routes: Vec<UnicastRoute>,
    ) -> Result<(), Error> {
        let protocol_id = route::client_to_protocol(client_id)?;
        debug!(client_id, routes = routes.len(), "syncing FIB");

        let mut kernel_routes = Vec::with_capacity(routes.len());
        for client_route in &routes {
            kernel_routes.push(
                route::build_unicast_route(
                    &self.cache,
                    &self.transport,
                    protocol_id,
                    client_route,
                )
                .await?,
            );
        }

        tokio::time::timeout(
            SYNC_FIB_TIMEOUT,
            self.transport.sync_routes(
                protocol_id,
                RouteTableKind::Unicast,
                kernel_routes,
            ),
        )
        .await
        .map_err(|_| Error::SyncTimeout)?
    }

    async fn sync_mpls_fib(
        &self,
        client_id: i16,
        routes: Vec<MplsRoute>,
    ) -> Result<(), Error> {
        let protocol_id = route::client_to_protocol(client_id)?;
        debug!(client_id, routes = routes.len(), "syncing MPLS FIB");

        let mut kernel_routes = Vec::with_capacity(routes.len());
        for client_route in &routes {
            kernel_routes.push(
                route::build_mpls_route(
                    &self.cache,
                    &self.transport,
                    protocol_id,
                    client_route,
                )
                .await?,
            );
        }

        tokio::time::timeout(
            SYNC_FIB_TIMEOUT,
            self.transport.sync_routes(
                protocol_id,
                RouteTableKind::Mpls,
                kernel_routes,
            ),
        )
        .await
        .map_err(|_| Error::SyncTimeout)?
    }

    async fn get_route_table(
        &self,
        client_id: i16,
    ) -> Result<Vec<UnicastRoute>, Error> {
        let protocol_id = route::client_to_protocol(client_id)?;

        // Readers are observability paths: they get an empty table rather
        // than an error.
        match self
            .transport
            .get_routes(protocol_id, RouteTableKind::Unicast)
            .await
        {
            Ok(routes) => Ok(route::to_unicast_routes(
                &self.cache,
                &self.transport,
                routes,
            )
            .await),
            Err(error) => {
                error.log();
                Ok(Vec::new())
            }
        }
    }

    async fn get_mpls_route_table(
        &self,
        client_id: i16,
    ) -> Result<Vec<MplsRoute>, Error> {
        let protocol_id = route::client_to_protocol(client_id)?;

        match self
            .transport
            .get_routes(protocol_id, RouteTableKind::Mpls)
            .await
        {
            Ok(routes) => Ok(route::to_mpls_routes(
                &self.cache,
                &self.transport,
                routes,
            )
            .await),
            Err(error) => {
                error.log();
                Ok(Vec::new())
            }
        }
    }

    async fn get_counters(&self) -> BTreeMap<String, i64> {
        let num_of_routes = match self.transport.route_count().await {
            Ok(count) => count,
            Err(error) => {
                error.log();
                0
            }
        };

        BTreeMap::from([(COUNTER_NUM_OF_ROUTES.to_owned(), num_of_routes)])
    }
}
