//! Per-channel proxy table
//!
//! At most one live proxy exists per (channel, instance, interface). The
//! identity index lets the marshaling code recognise a proxy facet that is
//! being passed back across a channel.

use crate::interface::InterfacePtr;
use crate::proxy::ProxyCore;
use crate::types::{ChannelId, InstanceId, InterfaceId};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct ProxyEntry {
    pub core: Arc<ProxyCore>,
    pub facet: InterfacePtr,
}

#[derive(Default)]
pub(crate) struct ProxyTable {
    by_channel: HashMap<ChannelId, HashMap<(InstanceId, InterfaceId), ProxyEntry>>,
    by_identity: HashMap<usize, Arc<ProxyCore>>,
}

impl ProxyTable {
    pub fn find(&self, channel: ChannelId, instance: InstanceId, interface: InterfaceId) -> Option<&ProxyEntry> {
        self.by_channel.get(&channel)?.get(&(instance, interface))
    }

    /// Insert a proxy, replacing any dying entry for the same key
    pub fn insert(&mut self, core: Arc<ProxyCore>, facet: InterfacePtr) {
        let key = (core.instance(), core.interface());
        self.by_identity.insert(facet.identity(), core.clone());
        let previous = self
            .by_channel
            .entry(core.channel_id())
            .or_default()
            .insert(key, ProxyEntry { core, facet });
        if let Some(previous) = previous {
            self.by_identity.remove(&previous.facet.identity());
        }
    }

    pub fn find_by_identity(&self, identity: usize) -> Option<Arc<ProxyCore>> {
        self.by_identity.get(&identity).cloned()
    }

    /// Remove `core` if it is still the registered proxy for its key
    pub fn remove(&mut self, core: &ProxyCore) -> bool {
        let channel = core.channel_id();
        let key = (core.instance(), core.interface());
        let Some(table) = self.by_channel.get_mut(&channel) else {
            return false;
        };
        let current = match table.get(&key) {
            Some(entry) => std::ptr::eq(Arc::as_ptr(&entry.core), core),
            None => false,
        };
        if !current {
            return false;
        }
        if let Some(entry) = table.remove(&key) {
            self.by_identity.remove(&entry.facet.identity());
        }
        if table.is_empty() {
            self.by_channel.remove(&channel);
        }
        true
    }

    pub fn drain_channel(&mut self, channel: ChannelId) -> Vec<ProxyEntry> {
        let entries: Vec<ProxyEntry> = self
            .by_channel
            .remove(&channel)
            .map(|table| table.into_values().collect())
            .unwrap_or_default();
        for entry in &entries {
            self.by_identity.remove(&entry.facet.identity());
        }
        entries
    }

    pub fn count(&self, channel: ChannelId) -> usize {
        self.by_channel.get(&channel).map(HashMap::len).unwrap_or(0)
    }
}
