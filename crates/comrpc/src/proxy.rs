//! Proxies for remote interfaces
//!
//! Every proxy facet wraps a [`ProxyCore`] that knows the channel and the
//! remote instance, and keeps two counts:
//!
//! - `local`: logical references held in this process
//! - `remote`: references this process registered with the peer
//!
//! The remote count is only touched when it has to be. A proxy that
//! arrived as a call parameter borrows the caller's reference and owes
//! nothing unless it is kept past that call; the AddRef then rides on the
//! call's response. When the last local reference goes, everything owed is
//! returned with a single Release carrying the count.
//!
//! ```text
//!   Uncommitted ──add_ref──▶ AddRefPending ──call ends──▶ Steady
//!        │                        │                         │
//!        └──── last release ──────┴──▶ Destroyed ◀── ReleasePending
//! ```

use crate::administrator::{Administrator, InterfaceRef, Loan};
use crate::channel::{Channel, Retained};
use crate::interface::{InterfacePtr, InterfaceType};
use crate::message::InvokeRequest;
use crate::stub::InboundCall;
use crate::types::{method, ChannelId, Error, ErrorCode, InstanceId, InterfaceId, MethodIndex, Result};
use comrpc_frame::{Frame, FrameReader, FrameValue, Number};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Reference protocol state of a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Borrowed from a call, nothing registered with the peer
    Uncommitted,
    /// Kept past the delivering call; AddRef goes out with its response
    AddRefPending,
    /// Holds `remote` references on the peer
    Steady,
    /// Last local reference gone, Release in flight
    ReleasePending,
    Destroyed,
}

/// How the reference that delivered an interface is accounted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Accounting {
    /// The peer registered one reference for us
    RefCounted,
    /// Borrowed from the inbound call that carried it
    PiggyBack,
}

/// Outcome of [`ProxyCore::finish_call`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallEnd {
    Kept { add_ref: bool },
    Destroyed,
    /// Unused and committed: this many Releases are owed
    ReleaseOwed(u32),
}

#[derive(Debug)]
struct RefState {
    state: ProxyState,
    local: u32,
    /// Local references that belong to inbound calls still running
    borrowed: u32,
    remote: u32,
    /// Committed AddRefs whose response has not been written yet
    unsent_add_refs: u32,
    dead: bool,
}

enum ReleaseStep {
    Done,
    Forget,
    SendRelease(u32),
}

/// Shared state behind every proxy facet
pub struct ProxyCore {
    channel: Arc<Channel>,
    instance: InstanceId,
    interface: InterfaceId,
    admin: Weak<Administrator>,
    refs: Mutex<RefState>,
    delivered: Notify,
}

impl ProxyCore {
    pub(crate) fn new(
        channel: Arc<Channel>,
        instance: InstanceId,
        interface: InterfaceId,
        admin: Weak<Administrator>,
        accounting: Accounting,
    ) -> Arc<Self> {
        let refs = match accounting {
            Accounting::RefCounted => RefState {
                state: ProxyState::Steady,
                local: 1,
                borrowed: 0,
                remote: 1,
                unsent_add_refs: 0,
                dead: false,
            },
            Accounting::PiggyBack => RefState {
                state: ProxyState::Uncommitted,
                local: 1,
                borrowed: 1,
                remote: 0,
                unsent_add_refs: 0,
                dead: false,
            },
        };
        Arc::new(Self {
            channel,
            instance,
            interface,
            admin,
            refs: Mutex::new(refs),
            delivered: Notify::new(),
        })
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn interface(&self) -> InterfaceId {
        self.interface
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn state(&self) -> ProxyState {
        self.refs.lock().state
    }

    pub fn local_refs(&self) -> u32 {
        self.refs.lock().local
    }

    pub fn remote_refs(&self) -> u32 {
        self.refs.lock().remote
    }

    /// The channel this proxy talks over has gone away
    pub fn is_dead(&self) -> bool {
        self.refs.lock().dead
    }

    /// Hand out an existing proxy for another delivery of the same instance
    ///
    /// Returns false when the proxy is on its way out; the caller then
    /// creates a fresh one.
    pub(crate) fn reuse(&self, accounting: Accounting) -> bool {
        let mut refs = self.refs.lock();
        if matches!(refs.state, ProxyState::ReleasePending | ProxyState::Destroyed) || refs.dead {
            return false;
        }
        refs.local += 1;
        match accounting {
            Accounting::RefCounted => {
                refs.remote += 1;
                refs.state = ProxyState::Steady;
            }
            Accounting::PiggyBack => refs.borrowed += 1,
        }
        true
    }

    /// Take a local reference unless the proxy is going away
    pub(crate) fn retain(&self) -> bool {
        let mut refs = self.refs.lock();
        if matches!(refs.state, ProxyState::ReleasePending | ProxyState::Destroyed) || refs.dead {
            return false;
        }
        refs.local += 1;
        if refs.state == ProxyState::Uncommitted {
            refs.state = ProxyState::AddRefPending;
        }
        true
    }

    /// Take an additional local reference
    pub fn add_ref(&self) {
        let mut refs = self.refs.lock();
        refs.local = refs.local.saturating_add(1);
        if refs.state == ProxyState::Uncommitted {
            refs.state = ProxyState::AddRefPending;
        }
    }

    /// Drop a local reference
    ///
    /// When the last one goes, the references held on the peer are
    /// returned: inside the response of a call currently being served for
    /// that peer if there is one, otherwise with an explicit Release.
    pub async fn release(&self) -> ErrorCode {
        let step = {
            let mut refs = self.refs.lock();
            if refs.local == 0 {
                warn!("Over-release of proxy {:?}", refs);
                return ErrorCode::None;
            }
            refs.local -= 1;
            if refs.local > 0 {
                ReleaseStep::Done
            } else {
                match refs.state {
                    ProxyState::Uncommitted | ProxyState::AddRefPending => {
                        refs.state = ProxyState::Destroyed;
                        ReleaseStep::Forget
                    }
                    ProxyState::Steady if refs.dead || refs.remote == 0 => {
                        refs.state = ProxyState::Destroyed;
                        ReleaseStep::Forget
                    }
                    ProxyState::Steady => {
                        refs.state = ProxyState::ReleasePending;
                        ReleaseStep::SendRelease(refs.remote)
                    }
                    ProxyState::Destroyed => ReleaseStep::Forget,
                    ProxyState::ReleasePending => ReleaseStep::Done,
                }
            }
        };

        match step {
            ReleaseStep::Done => ErrorCode::None,
            ReleaseStep::Forget => {
                self.forget();
                ErrorCode::DestructionSucceeded
            }
            ReleaseStep::SendRelease(count) => {
                // The peer must have seen our AddRef before it sees the Release
                self.add_refs_delivered().await;
                if !InboundCall::defer_release(self.channel.id(), self.instance, self.interface, count) {
                    let code = self
                        .channel
                        .release_remote(self.instance, self.interface, count)
                        .await;
                    if !code.is_success() && code != ErrorCode::ChannelClosed {
                        debug!("Release of {} returned {}", self.instance, code);
                    }
                }
                {
                    let mut refs = self.refs.lock();
                    refs.remote = 0;
                    refs.state = ProxyState::Destroyed;
                }
                self.forget();
                ErrorCode::DestructionSucceeded
            }
        }
    }

    /// Settle the borrow of an inbound call that delivered this proxy
    pub(crate) fn finish_call(&self) -> CallEnd {
        let mut refs = self.refs.lock();
        refs.borrowed = refs.borrowed.saturating_sub(1);
        if matches!(refs.state, ProxyState::ReleasePending | ProxyState::Destroyed) {
            return CallEnd::Kept { add_ref: false };
        }
        refs.local = refs.local.saturating_sub(1);

        if refs.local == 0 {
            return match refs.state {
                ProxyState::Steady if !refs.dead && refs.remote > 0 => {
                    refs.state = ProxyState::ReleasePending;
                    CallEnd::ReleaseOwed(refs.remote)
                }
                _ => {
                    refs.state = ProxyState::Destroyed;
                    CallEnd::Destroyed
                }
            };
        }

        // The last call still borrowing commits the AddRef
        if refs.state == ProxyState::AddRefPending && refs.borrowed == 0 && !refs.dead {
            refs.state = ProxyState::Steady;
            refs.remote += 1;
            refs.unsent_add_refs += 1;
            return CallEnd::Kept { add_ref: true };
        }
        CallEnd::Kept { add_ref: false }
    }

    /// Response carrying one committed AddRef was written or dropped
    pub(crate) fn add_ref_delivered(&self) {
        let settled = {
            let mut refs = self.refs.lock();
            refs.unsent_add_refs = refs.unsent_add_refs.saturating_sub(1);
            refs.unsent_add_refs == 0
        };
        if settled {
            self.delivered.notify_waiters();
        }
    }

    /// Wait until every committed AddRef has left with its response
    pub(crate) async fn add_refs_delivered(&self) {
        loop {
            let notified = self.delivered.notified();
            let unsent = self.refs.lock().unsent_add_refs;
            if unsent == 0 {
                return;
            }
            trace!("Release of {} waits for {} AddRef(s) in flight", self.instance, unsent);
            notified.await;
        }
    }

    pub(crate) fn mark_destroyed(&self) {
        let mut refs = self.refs.lock();
        refs.remote = 0;
        refs.state = ProxyState::Destroyed;
    }

    /// The peer went away; returns true the first time only
    pub(crate) fn remote_died(&self) -> bool {
        let mut refs = self.refs.lock();
        if refs.dead {
            return false;
        }
        refs.dead = true;
        refs.remote = 0;
        refs.unsent_add_refs = 0;
        refs.state = ProxyState::Destroyed;
        drop(refs);
        self.delivered.notify_waiters();
        true
    }

    fn forget(&self) {
        if let Some(admin) = self.admin.upgrade() {
            admin.forget_proxy(self);
        }
    }

    fn administrator(&self) -> Result<Arc<Administrator>> {
        self.admin.upgrade().ok_or(Error::Unavailable)
    }

    fn check_usable(&self) -> Result<()> {
        let refs = self.refs.lock();
        if refs.dead {
            return Err(Error::ChannelClosed(self.channel.id()));
        }
        if refs.state == ProxyState::Destroyed {
            return Err(Error::UnknownInstance(self.instance));
        }
        Ok(())
    }

    /// Start a call of `method` on the remote instance
    pub fn call(&self, method: MethodIndex) -> ProxyCall<'_> {
        ProxyCall {
            core: self,
            method,
            params: Frame::new(),
            keep_alive: Vec::new(),
            timeout: self.channel.config().call_timeout,
        }
    }

    /// Decode an interface returned by the peer; the caller owns one reference
    pub async fn import(&self, reader: &mut FrameReader<'_>) -> Result<Option<InterfacePtr>> {
        let reference = InterfaceRef::read(reader)?;
        let admin = self.administrator()?;
        let imported = admin
            .import(&self.channel, reference, Accounting::RefCounted)
            .await?;
        Ok(imported.map(|imported| imported.ptr))
    }

    pub async fn import_as<I: ?Sized + InterfaceType>(&self, reader: &mut FrameReader<'_>) -> Result<Option<Arc<I>>> {
        match self.import(reader).await? {
            Some(ptr) => ptr.query::<I>().map(Some).ok_or(Error::UnknownInterface(I::ID)),
            None => Ok(None),
        }
    }

    /// Remote QueryInterface
    ///
    /// `this` is the facet wrapping this core. A proxy that already exists
    /// for the requested interface is handed out without a round trip.
    pub async fn query_interface(&self, this: &InterfacePtr, interface: InterfaceId) -> Option<InterfacePtr> {
        if interface == self.interface {
            this.add_ref();
            return Some(this.clone());
        }
        let admin = self.admin.upgrade()?;
        if let Some(existing) = admin.find_live_proxy(self.channel.id(), self.instance, interface) {
            return Some(existing);
        }

        let mut call = self.call(method::QUERY_INTERFACE);
        call.number(interface);
        let reply = match call.send().await {
            Ok(reply) => reply,
            Err(e) => {
                debug!("QueryInterface {:#010x} on {} failed: {}", interface, self.instance, e);
                return None;
            }
        };
        let instance = InstanceId::from_raw(reply.reader().number::<u64>().ok()?);
        if instance.is_null() {
            return None;
        }
        match admin
            .import(
                &self.channel,
                InterfaceRef::sender(instance, interface),
                Accounting::RefCounted,
            )
            .await
        {
            Ok(imported) => imported.map(|imported| imported.ptr),
            Err(e) => {
                warn!("Importing {} ({:#010x}) failed: {}", instance, interface, e);
                None
            }
        }
    }
}

impl fmt::Debug for ProxyCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let refs = self.refs.lock();
        f.debug_struct("ProxyCore")
            .field("channel", &self.channel.id())
            .field("instance", &self.instance)
            .field("interface", &format_args!("{:#010x}", self.interface))
            .field("state", &refs.state)
            .field("local", &refs.local)
            .field("remote", &refs.remote)
            .finish()
    }
}

/// Outgoing call being assembled by a proxy
pub struct ProxyCall<'a> {
    core: &'a ProxyCore,
    method: MethodIndex,
    params: Frame,
    keep_alive: Vec<Loan>,
    timeout: Duration,
}

impl ProxyCall<'_> {
    pub fn params(&mut self) -> &mut Frame {
        &mut self.params
    }

    pub fn number<T: Number>(&mut self, value: T) -> &mut Self {
        self.params.push_number(value);
        self
    }

    pub fn text(&mut self, value: &str) -> Result<&mut Self> {
        self.params.push_text(value)?;
        Ok(self)
    }

    pub fn value<V: FrameValue>(&mut self, value: &V) -> Result<&mut Self> {
        self.params.push(value)?;
        Ok(self)
    }

    /// Pass an interface the callee may use for the duration of the call
    pub fn interface(&mut self, ptr: Option<&InterfacePtr>) -> Result<&mut Self> {
        let admin = self.core.administrator()?;
        admin
            .export_borrowed(&self.core.channel, ptr, &mut self.keep_alive)
            .write(&mut self.params);
        Ok(self)
    }

    pub fn interface_as<I: ?Sized + InterfaceType>(&mut self, object: Option<&Arc<I>>) -> Result<&mut Self> {
        let ptr = object.map(|object| InterfacePtr::new::<I>(object.clone()));
        self.interface(ptr.as_ref())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send the call and wait for the reply
    ///
    /// A non-success result code from the peer becomes
    /// [`Error::Remote`].
    pub async fn send(self) -> Result<Reply> {
        self.core.check_usable()?;
        let request = InvokeRequest {
            instance: self.core.instance,
            interface: self.core.interface,
            method: self.method,
            params: self.params,
        };
        let (response, retained) = self
            .core
            .channel
            .invoke(request, self.keep_alive, self.timeout)
            .await?;
        response.result.into_result()?;
        Ok(Reply {
            frame: response.frame,
            _retained: retained,
        })
    }
}

/// Result frame of a proxy call
///
/// Objects whose references came back with the reply stay alive until the
/// reply is dropped, so interfaces in the result can still be resolved.
pub struct Reply {
    frame: Frame,
    _retained: Retained,
}

impl Reply {
    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn reader(&self) -> FrameReader<'_> {
        self.frame.reader()
    }

    pub fn into_frame(self) -> Frame {
        self.frame
    }
}

/// Implement [`Unknown`](crate::Unknown) for a proxy struct with a `core: Arc<ProxyCore>` field
///
/// ```ignore
/// struct CalculatorProxy { core: Arc<ProxyCore> }
/// comrpc::proxy_unknown!(CalculatorProxy, dyn Calculator);
/// ```
#[macro_export]
macro_rules! proxy_unknown {
    ($proxy:ty, $iface:ty) => {
        #[$crate::async_trait]
        impl $crate::Unknown for $proxy {
            fn add_ref(&self) {
                self.core.add_ref();
            }

            async fn release(&self) -> $crate::ErrorCode {
                self.core.release().await
            }

            fn query_interface(
                self: ::std::sync::Arc<Self>,
                interface: $crate::InterfaceId,
            ) -> $crate::BoxFuture<'static, ::std::option::Option<$crate::InterfacePtr>> {
                ::std::boxed::Box::pin(async move {
                    let this = $crate::InterfacePtr::new::<$iface>(self.clone());
                    self.core.query_interface(&this, interface).await
                })
            }
        }
    };
}
