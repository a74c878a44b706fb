//! Local instance table
//!
//! Maps [`InstanceId`] handles handed to peers back to local objects. The
//! table holds only weak pointers: objects are kept alive by external
//! references and in-flight calls, never by the table itself.

use crate::interface::{InterfacePtr, WeakInterfacePtr};
use crate::types::{InstanceId, InterfaceId};
use std::collections::HashMap;

struct SlotEntry {
    identity: usize,
    facets: HashMap<InterfaceId, WeakInterfacePtr>,
}

impl SlotEntry {
    fn is_alive(&self) -> bool {
        self.facets.values().any(WeakInterfacePtr::is_alive)
    }
}

struct Slot {
    generation: u32,
    entry: Option<SlotEntry>,
}

#[derive(Default)]
pub(crate) struct InstanceTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_identity: HashMap<usize, u32>,
}

impl InstanceTable {
    /// Register (or find) the handle for the object behind `ptr`
    pub fn register(&mut self, ptr: &InterfacePtr) -> InstanceId {
        let identity = ptr.identity();

        if let Some(&index) = self.by_identity.get(&identity) {
            let slot = &mut self.slots[index as usize];
            if let Some(entry) = slot.entry.as_mut().filter(|entry| entry.is_alive()) {
                let known = entry
                    .facets
                    .get(&ptr.id())
                    .map(WeakInterfacePtr::is_alive)
                    .unwrap_or(false);
                if !known {
                    entry.facets.insert(ptr.id(), ptr.downgrade());
                }
                return InstanceId::new(slot.generation, index);
            }
            // The address belongs to a new object now; old handles must not resolve
            self.free_slot(index);
        }

        let mut facets = HashMap::new();
        facets.insert(ptr.id(), ptr.downgrade());
        let entry = SlotEntry { identity, facets };

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize].entry = Some(entry);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 1,
                    entry: Some(entry),
                });
                (self.slots.len() - 1) as u32
            }
        };
        self.by_identity.insert(identity, index);
        InstanceId::new(self.slots[index as usize].generation, index)
    }

    pub fn resolve(&self, instance: InstanceId, interface: InterfaceId) -> Option<InterfacePtr> {
        let slot = self.slots.get(instance.slot() as usize)?;
        if slot.generation != instance.generation() {
            return None;
        }
        slot.entry.as_ref()?.facets.get(&interface)?.upgrade()
    }

    /// Release slots whose objects are gone
    pub fn sweep(&mut self) -> usize {
        let dead: Vec<u32> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.as_ref().map(|e| !e.is_alive()).unwrap_or(false))
            .map(|(index, _)| index as u32)
            .collect();
        for &index in &dead {
            self.free_slot(index);
        }
        dead.len()
    }

    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    fn free_slot(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        if let Some(entry) = slot.entry.take() {
            self.by_identity.remove(&entry.identity);
            slot.generation = match slot.generation.wrapping_add(1) {
                0 => 1,
                next => next,
            };
            self.free.push(index);
        }
    }
}
