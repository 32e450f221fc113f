//
// Copyright (c) The Flint Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::transport::{FibTransport, LinkFlags, LinkInfo};

// Interface name <-> ifindex cache, refreshed lazily from the kernel link
// table on lookup miss.
//
// Entries are overwritten, never cleared; a stale entry only costs the
// caller one failed request, and the next refresh fixes it.
#[derive(Debug, Default)]
pub struct InterfaceCache {
    name_to_index: RwLock<HashMap<String, u32>>,
    index_to_name: RwLock<HashMap<u32, String>>,
    // Loopback ifindex (0 = not learned yet).
    loopback_ifindex: AtomicU32,
}

// ===== impl InterfaceCache =====

impl InterfaceCache {
    // Merges a kernel link enumeration into the cache.
    pub(crate) fn update(&self, links: &[LinkInfo]) {
        let mut name_to_index = self.name_to_index.write().unwrap();
        let mut index_to_name = self.index_to_name.write().unwrap();

        for link in links {
            name_to_index.insert(link.ifname.clone(), link.ifindex);
            index_to_name.insert(link.ifindex, link.ifname.clone());

            if link.flags.contains(LinkFlags::LOOPBACK) {
                self.loopback_ifindex.store(link.ifindex, Ordering::Relaxed);
            }
        }
    }

    // Resolves an interface name to its ifindex, refreshing the cache on
    // miss.
    pub(crate) async fn resolve_ifindex<T: FibTransport>(
        &self,
        transport: &T,
        ifname: &str,
    ) -> Option<u32> {
        if let Some(ifindex) = self.lookup_ifindex(ifname) {
            return Some(ifindex);
        }
        self.refresh(transport).await;
        self.lookup_ifindex(ifname)
    }

    // Resolves an ifindex to its interface name, refreshing the cache on
    // miss.
    pub(crate) async fn resolve_ifname<T: FibTransport>(
        &self,
        transport: &T,
        ifindex: u32,
    ) -> Option<String> {
        if let Some(ifname) = self.lookup_ifname(ifindex) {
            return Some(ifname);
        }
        self.refresh(transport).await;
        self.lookup_ifname(ifindex)
    }

    // Returns the loopback ifindex, refreshing the cache if it hasn't
    // been learned yet.
    pub(crate) async fn resolve_loopback<T: FibTransport>(
        &self,
        transport: &T,
    ) -> Option<u32> {
        let ifindex = self.loopback_ifindex.load(Ordering::Relaxed);
        if ifindex != 0 {
            return Some(ifindex);
        }
        self.refresh(transport).await;

        let ifindex = self.loopback_ifindex.load(Ordering::Relaxed);
        (ifindex != 0).then_some(ifindex)
    }

    async fn refresh<T: FibTransport>(&self, transport: &T) {
        match transport.get_all_links().await {
            Ok(links) => self.update(&links),
            Err(error) => error.log(),
        }
    }

    fn lookup_ifindex(&self, ifname: &str) -> Option<u32> {
        self.name_to_index.read().unwrap().get(ifname).copied()
    }

    fn lookup_ifname(&self, ifindex: u32) -> Option<String> {
        self.index_to_name.read().unwrap().get(&ifindex).cloned()
    }
}

// ===== tests =====
