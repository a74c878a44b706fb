//! Distributed reference counting
//!
//! Every local interface lent to a peer is recorded per channel together
//! with the number of references the peer owes back. The peer returns them
//! with Release (explicitly or piggybacked); whatever is still owed when
//! the channel closes is released on the peer's behalf.
//!
//! Objects passed as call parameters are not referenced by the peer; they
//! are *loaned* for as long as the call and its reply are outstanding. A
//! peer can only reach instances that are lent to it one way or the other.

use super::Administrator;
use crate::interface::InterfacePtr;
use crate::types::{ChannelId, InstanceId, InterfaceId};
use std::collections::HashMap;
use std::sync::Weak;

/// An interface lent to a peer
#[derive(Clone, Debug)]
pub(crate) struct ExternalReference {
    pub instance: InstanceId,
    pub ptr: InterfacePtr,
    /// References the peer holds
    pub count: u32,
}

/// Result of returning references
#[derive(Debug)]
pub(crate) struct Released {
    pub ptr: InterfacePtr,
    /// Units actually released, after clamping
    pub released: u32,
    pub remaining: u32,
}

/// A local object passed to the peer for the duration of one call
///
/// Keeps the object alive and reachable from the peer until dropped.
pub(crate) struct Loan {
    admin: Weak<Administrator>,
    channel: ChannelId,
    instance: InstanceId,
    ptr: InterfacePtr,
}

impl Loan {
    pub(super) fn new(admin: Weak<Administrator>, channel: ChannelId, instance: InstanceId, ptr: InterfacePtr) -> Self {
        Self {
            admin,
            channel,
            instance,
            ptr,
        }
    }
}

impl Drop for Loan {
    fn drop(&mut self) {
        if let Some(admin) = self.admin.upgrade() {
            admin.end_loan(self.channel, self.instance, self.ptr.id());
        }
    }
}

#[derive(Default)]
pub(crate) struct ReferenceTable {
    entries: HashMap<ChannelId, HashMap<(InstanceId, InterfaceId), ExternalReference>>,
    loans: HashMap<ChannelId, HashMap<(InstanceId, InterfaceId), u32>>,
}

impl ReferenceTable {
    /// Record `count` more references held by the peer on `channel`
    pub fn add(&mut self, channel: ChannelId, instance: InstanceId, ptr: &InterfacePtr, count: u32) -> u32 {
        let entry = self
            .entries
            .entry(channel)
            .or_default()
            .entry((instance, ptr.id()))
            .or_insert_with(|| ExternalReference {
                instance,
                ptr: ptr.clone(),
                count: 0,
            });
        entry.count = entry.count.saturating_add(count);
        entry.count
    }

    /// Return up to `count` references; over-release is clamped
    pub fn release(
        &mut self,
        channel: ChannelId,
        instance: InstanceId,
        interface: InterfaceId,
        count: u32,
    ) -> Option<Released> {
        let table = self.entries.get_mut(&channel)?;
        let key = (instance, interface);
        let entry = table.get_mut(&key)?;

        let released = count.min(entry.count);
        entry.count -= released;
        let remaining = entry.count;
        let ptr = entry.ptr.clone();

        if remaining == 0 {
            table.remove(&key);
            if table.is_empty() {
                self.entries.remove(&channel);
            }
        }

        Some(Released {
            ptr,
            released,
            remaining,
        })
    }

    pub fn count(&self, channel: ChannelId, instance: InstanceId, interface: InterfaceId) -> u32 {
        self.entries
            .get(&channel)
            .and_then(|table| table.get(&(instance, interface)))
            .map(|entry| entry.count)
            .unwrap_or(0)
    }

    pub fn len(&self, channel: ChannelId) -> usize {
        self.entries.get(&channel).map(HashMap::len).unwrap_or(0)
    }

    pub fn lend(&mut self, channel: ChannelId, instance: InstanceId, interface: InterfaceId) {
        *self
            .loans
            .entry(channel)
            .or_default()
            .entry((instance, interface))
            .or_insert(0) += 1;
    }

    pub fn end_loan(&mut self, channel: ChannelId, instance: InstanceId, interface: InterfaceId) {
        let Some(table) = self.loans.get_mut(&channel) else {
            return;
        };
        let key = (instance, interface);
        if let Some(count) = table.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                table.remove(&key);
            }
        }
        if table.is_empty() {
            self.loans.remove(&channel);
        }
    }

    pub fn loans(&self, channel: ChannelId) -> usize {
        self.loans.get(&channel).map(HashMap::len).unwrap_or(0)
    }

    /// Whether the peer on `channel` may reach this instance
    pub fn is_lent(&self, channel: ChannelId, instance: InstanceId, interface: InterfaceId) -> bool {
        let key = (instance, interface);
        self.count(channel, instance, interface) > 0
            || self
                .loans
                .get(&channel)
                .map(|table| table.contains_key(&key))
                .unwrap_or(false)
    }

    /// Remove every reference held by the peer on `channel`
    pub fn drain_channel(&mut self, channel: ChannelId) -> Vec<ExternalReference> {
        self.loans.remove(&channel);
        self.entries
            .remove(&channel)
            .map(|table| table.into_values().collect())
            .unwrap_or_default()
    }
}
