//! Administrator
//!
//! The administrator is the per-process registry behind every channel:
//!
//! - interface registrations: [`InterfaceId`] → (stub, proxy factory)
//! - the local instance table handing out [`InstanceId`]s
//! - per-channel external references (local objects lent to a peer)
//! - per-channel proxies (remote objects used locally)
//!
//! It is created explicitly with [`Administrator::new`] and injected into
//! communicators and channels; nothing in the crate is a global singleton.
//!
//! All tables sit behind one mutex. Calls back into user objects
//! (`add_ref`, `release`, stubs) happen with the lock released.

mod dispatch;
mod instances;
mod marshal;
mod proxies;
mod references;

pub use marshal::{InterfaceRef, Marker};
pub(crate) use dispatch::Dispatched;
pub(crate) use references::Loan;

use crate::channel::Channel;
use crate::interface::{InterfacePtr, InterfaceType};
use crate::message::TailEntry;
use crate::proxy::{Accounting, ProxyCore};
use crate::stub::Stub;
use crate::types::{ChannelId, Error, ErrorCode, InstanceId, InterfaceId, Result};
use instances::InstanceTable;
use parking_lot::{Mutex, RwLock};
use proxies::ProxyTable;
use references::{ReferenceTable, Released};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

/// Builds the proxy facet for a newly created [`ProxyCore`]
pub type ProxyFactory = Arc<dyn Fn(Arc<ProxyCore>) -> InterfacePtr + Send + Sync>;

struct Registration {
    name: &'static str,
    stub: Arc<dyn Stub>,
    factory: ProxyFactory,
}

#[derive(Default)]
struct AdminState {
    instances: InstanceTable,
    references: ReferenceTable,
    proxies: ProxyTable,
}

/// What [`Administrator::delete_channel`] cleaned up
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTeardown {
    /// Proxies marked dead
    pub proxies: usize,
    /// External reference entries dropped
    pub references: usize,
    /// Reference units released on the peer's behalf
    pub released: u32,
}

/// Per-process proxy/stub registry and reference bookkeeping
pub struct Administrator {
    registrations: RwLock<HashMap<InterfaceId, Registration>>,
    state: Mutex<AdminState>,
    me: Weak<Administrator>,
}

impl Administrator {
    /// Create an administrator with the built-in interfaces registered
    pub fn new() -> Arc<Self> {
        let admin = Arc::new_cyclic(|me| Self {
            registrations: RwLock::new(HashMap::new()),
            state: Mutex::new(AdminState::default()),
            me: me.clone(),
        });
        crate::interfaces::register_builtin(&admin);
        admin
    }

    /// Register the stub and proxy factory for interface `I`
    ///
    /// Both peers register independently. Registering again replaces the
    /// previous pair.
    pub fn register_interface<I, S, F>(&self, stub: S, factory: F)
    where
        I: ?Sized + InterfaceType,
        S: Stub + 'static,
        F: Fn(Arc<ProxyCore>) -> InterfacePtr + Send + Sync + 'static,
    {
        let registration = Registration {
            name: I::NAME,
            stub: Arc::new(stub),
            factory: Arc::new(factory),
        };
        if let Some(previous) = self.registrations.write().insert(I::ID, registration) {
            debug!("Replaced registration for {} ({:#010x})", previous.name, I::ID);
        } else {
            debug!("Registered interface {} ({:#010x})", I::NAME, I::ID);
        }
    }

    pub fn unregister_interface(&self, interface: InterfaceId) -> bool {
        self.registrations.write().remove(&interface).is_some()
    }

    pub fn is_registered(&self, interface: InterfaceId) -> bool {
        self.registrations.read().contains_key(&interface)
    }

    pub(crate) fn stub(&self, interface: InterfaceId) -> Option<Arc<dyn Stub>> {
        self.registrations
            .read()
            .get(&interface)
            .map(|registration| registration.stub.clone())
    }

    fn factory(&self, interface: InterfaceId) -> Option<ProxyFactory> {
        self.registrations
            .read()
            .get(&interface)
            .map(|registration| registration.factory.clone())
    }

    // ---------------------------------------------------------------------
    // Local instances

    /// Handle under which the object behind `ptr` is known to peers
    pub fn register_instance(&self, ptr: &InterfacePtr) -> InstanceId {
        self.state.lock().instances.register(ptr)
    }

    pub fn resolve_instance(&self, instance: InstanceId, interface: InterfaceId) -> Option<InterfacePtr> {
        self.state.lock().instances.resolve(instance, interface)
    }

    /// Resolve an instance on behalf of the peer on `channel`
    ///
    /// Only objects lent to that peer, by reference or for a call in
    /// progress, are reachable.
    pub fn resolve_lent(&self, channel: ChannelId, instance: InstanceId, interface: InterfaceId) -> Option<InterfacePtr> {
        let state = self.state.lock();
        if !state.references.is_lent(channel, instance, interface) {
            trace!(
                "Instance {} ({:#010x}) not lent on channel {}",
                instance,
                interface,
                channel
            );
            return None;
        }
        state.instances.resolve(instance, interface)
    }

    pub fn instance_count(&self) -> usize {
        self.state.lock().instances.len()
    }

    // ---------------------------------------------------------------------
    // External references

    /// Lend `ptr` to the peer on `channel`, adopting one reference of it
    ///
    /// The peer now owes one Release for the returned instance.
    pub fn register_external(&self, channel: &Channel, ptr: &InterfacePtr) -> InstanceId {
        let mut state = self.state.lock();
        let instance = state.instances.register(ptr);
        if channel.is_closed() {
            debug!("Not lending {} over closed channel {}", instance, channel.id());
        } else {
            let count = state.references.add(channel.id(), instance, ptr, 1);
            debug!(
                "Lent {} ({:#010x}) on channel {}, count {}",
                instance,
                ptr.id(),
                channel.id(),
                count
            );
        }
        instance
    }

    /// Lend `ptr` to the peer on `channel` for the duration of a call
    pub(crate) fn lend(&self, channel: &Channel, ptr: &InterfacePtr) -> (InstanceId, Loan) {
        let instance = {
            let mut state = self.state.lock();
            let instance = state.instances.register(ptr);
            state.references.lend(channel.id(), instance, ptr.id());
            instance
        };
        let loan = Loan::new(self.me.clone(), channel.id(), instance, ptr.clone());
        (instance, loan)
    }

    pub(crate) fn end_loan(&self, channel: ChannelId, instance: InstanceId, interface: InterfaceId) {
        self.state.lock().references.end_loan(channel, instance, interface);
    }

    /// Distinct interfaces currently loaned to calls on `channel`
    pub fn loaned(&self, channel: ChannelId) -> usize {
        self.state.lock().references.loans(channel)
    }

    /// Record `count` extra references the peer took on a local instance
    pub(crate) fn add_ref_external(
        &self,
        channel: &Channel,
        instance: InstanceId,
        interface: InterfaceId,
        count: u32,
    ) -> Result<()> {
        let ptr = {
            let mut state = self.state.lock();
            if !state.references.is_lent(channel.id(), instance, interface) {
                return Err(Error::UnknownInstance(instance));
            }
            let ptr = state
                .instances
                .resolve(instance, interface)
                .ok_or(Error::UnknownInstance(instance))?;
            if channel.is_closed() {
                return Err(Error::ChannelClosed(channel.id()));
            }
            state.references.add(channel.id(), instance, &ptr, count);
            ptr
        };
        for _ in 0..count {
            ptr.add_ref();
        }
        Ok(())
    }

    /// Take `count` references the peer on `channel` held off the books
    ///
    /// Over-release is clamped to what the peer actually holds. The caller
    /// releases the returned pointer once per unit taken.
    fn take_references(
        &self,
        channel: ChannelId,
        instance: InstanceId,
        interface: InterfaceId,
        count: u32,
    ) -> Option<Released> {
        let released = self
            .state
            .lock()
            .references
            .release(channel, instance, interface, count);

        let Some(released) = released else {
            warn!(
                "Release of unknown reference {} ({:#010x}) on channel {}",
                instance, interface, channel
            );
            return None;
        };
        if released.released < count {
            warn!(
                "Clamped over-release of {} on channel {}: asked {}, held {}",
                instance, channel, count, released.released
            );
        }
        Some(released)
    }

    /// Return `count` references the peer on `channel` held
    ///
    /// The released pointer is handed back so callers can keep the object
    /// alive a little longer.
    pub(crate) async fn return_references(
        &self,
        channel: ChannelId,
        instance: InstanceId,
        interface: InterfaceId,
        count: u32,
    ) -> Option<(InterfacePtr, u32)> {
        let released = self.take_references(channel, instance, interface, count)?;
        for _ in 0..released.released {
            released.ptr.release().await;
        }
        Some((released.ptr, released.remaining))
    }

    /// Remote Release of a lent interface
    pub async fn release_external(
        &self,
        channel: ChannelId,
        instance: InstanceId,
        interface: InterfaceId,
        count: u32,
    ) -> ErrorCode {
        let code = match self.return_references(channel, instance, interface, count).await {
            None => ErrorCode::UnknownKey,
            Some((_, 0)) => ErrorCode::DestructionSucceeded,
            Some(_) => ErrorCode::None,
        };
        if code == ErrorCode::DestructionSucceeded {
            self.state.lock().instances.sweep();
        }
        code
    }

    /// References the peer on `channel` holds on `instance`
    pub fn external_count(&self, channel: ChannelId, instance: InstanceId, interface: InterfaceId) -> u32 {
        self.state.lock().references.count(channel, instance, interface)
    }

    /// Number of distinct interfaces lent on `channel`
    pub fn external_references(&self, channel: ChannelId) -> usize {
        self.state.lock().references.len(channel)
    }

    /// Book piggybacked reference changes from a response tail
    ///
    /// Runs before the next message on the channel is looked at, so a
    /// Release the peer sends later always finds the AddRef it undoes.
    /// Returned pointers still owe one `release` each; see
    /// [`Administrator::finish_tail`].
    pub(crate) fn settle_tail(&self, channel: &Channel, tail: &[TailEntry]) -> Vec<InterfacePtr> {
        let mut owed = Vec::new();
        for entry in tail {
            if entry.release {
                if let Some(released) = self.take_references(channel.id(), entry.instance, entry.interface, 1) {
                    owed.extend((0..released.released).map(|_| released.ptr.clone()));
                }
            } else if let Err(e) = self.add_ref_external(channel, entry.instance, entry.interface, 1) {
                warn!(
                    "Piggybacked AddRef on {} ({:#010x}) failed: {}",
                    entry.instance, entry.interface, e
                );
            }
        }
        owed
    }

    /// Release the objects a settled tail returned
    pub(crate) async fn finish_tail(&self, owed: &[InterfacePtr]) {
        for ptr in owed {
            ptr.release().await;
        }
        if !owed.is_empty() {
            self.state.lock().instances.sweep();
        }
    }

    // ---------------------------------------------------------------------
    // Proxies

    /// Find or create the proxy for a remote instance
    ///
    /// `ref_counted` records that the peer registered one reference for
    /// this delivery. Otherwise the first reference is borrowed from the
    /// delivering call (`piggy_back`) and nothing is owed until the proxy
    /// is kept past that call. Returns `None` when no proxy factory is
    /// registered for `interface` or the channel is closed.
    pub fn obtain_proxy(
        &self,
        channel: &Arc<Channel>,
        instance: InstanceId,
        interface: InterfaceId,
        ref_counted: bool,
        piggy_back: bool,
    ) -> Option<InterfacePtr> {
        debug_assert!(ref_counted != piggy_back, "a delivery is either ref-counted or piggybacked");
        let accounting = if ref_counted {
            Accounting::RefCounted
        } else {
            Accounting::PiggyBack
        };
        self.obtain(channel, instance, interface, accounting)
            .map(|(ptr, _)| ptr)
    }

    pub(crate) fn obtain(
        &self,
        channel: &Arc<Channel>,
        instance: InstanceId,
        interface: InterfaceId,
        accounting: Accounting,
    ) -> Option<(InterfacePtr, Arc<ProxyCore>)> {
        let factory = self.factory(interface)?;

        let mut state = self.state.lock();
        if let Some(entry) = state.proxies.find(channel.id(), instance, interface) {
            if entry.core.reuse(accounting) {
                return Some((entry.facet.clone(), entry.core.clone()));
            }
        }
        if channel.is_closed() {
            return None;
        }

        let core = ProxyCore::new(channel.clone(), instance, interface, self.me.clone(), accounting);
        let facet = factory(core.clone());
        state.proxies.insert(core.clone(), facet.clone());
        debug!(
            "Created proxy for {} ({:#010x}) on channel {}",
            instance,
            interface,
            channel.id()
        );
        Some((facet, core))
    }

    /// Existing proxy for a remote instance, with one more local reference
    pub(crate) fn find_live_proxy(
        &self,
        channel: ChannelId,
        instance: InstanceId,
        interface: InterfaceId,
    ) -> Option<InterfacePtr> {
        let state = self.state.lock();
        let entry = state.proxies.find(channel, instance, interface)?;
        entry.core.retain().then(|| entry.facet.clone())
    }

    /// Proxy core behind `ptr`, if `ptr` is a proxy facet
    pub fn find_proxy(&self, ptr: &InterfacePtr) -> Option<Arc<ProxyCore>> {
        self.state.lock().proxies.find_by_identity(ptr.identity())
    }

    pub fn proxy_count(&self, channel: ChannelId) -> usize {
        self.state.lock().proxies.count(channel)
    }

    pub(crate) fn forget_proxy(&self, core: &ProxyCore) {
        if self.state.lock().proxies.remove(core) {
            debug!(
                "Dropped proxy for {} ({:#010x}) on channel {}",
                core.instance(),
                core.interface(),
                core.channel_id()
            );
        }
    }

    // ---------------------------------------------------------------------
    // Teardown

    /// Forget everything tied to a closed channel
    ///
    /// Proxies are marked dead and every reference the peer still held is
    /// released on its behalf. Entries are collected under the lock and
    /// released after it is dropped.
    pub async fn delete_channel(&self, channel: ChannelId) -> ChannelTeardown {
        let (proxies, references) = {
            let mut state = self.state.lock();
            (
                state.proxies.drain_channel(channel),
                state.references.drain_channel(channel),
            )
        };

        let mut teardown = ChannelTeardown {
            proxies: proxies.len(),
            references: references.len(),
            released: 0,
        };

        for entry in &proxies {
            if entry.core.remote_died() {
                debug!(
                    "Proxy for {} ({:#010x}) lost its peer",
                    entry.core.instance(),
                    entry.core.interface()
                );
            }
        }
        drop(proxies);

        for reference in &references {
            trace!(
                "Returning {} reference(s) on {} ({:#010x})",
                reference.count,
                reference.instance,
                reference.ptr.id()
            );
            for _ in 0..reference.count {
                reference.ptr.release().await;
            }
            teardown.released += reference.count;
        }
        drop(references);

        let swept = self.state.lock().instances.sweep();
        info!(
            "Channel {} torn down: {} proxies, {} references ({} units), {} instances freed",
            channel, teardown.proxies, teardown.references, teardown.released, swept
        );
        teardown
    }
}
