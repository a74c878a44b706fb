//! Stubs and the inbound call context
//!
//! A [`Stub`] is registered once per interface type. For every inbound
//! call the administrator resolves the target object and hands the stub a
//! [`CallContext`] through which interface-valued parameters are decoded
//! and encoded.
//!
//! Interfaces received as parameters are borrowed from the call: their
//! proxies are created without a remote AddRef. When the call ends, any
//! such proxy the implementation kept gets its AddRef piggybacked on the
//! response; the rest are dropped without traffic.
//!
//! Reference changes must reach the peer in the order they were made. A
//! response whose tail commits an AddRef holds a [`Delivery`] until it is
//! written; a Release of that proxy, explicit or in another response,
//! waits for it.

use crate::administrator::{Administrator, InterfaceRef};
use crate::channel::Channel;
use crate::interface::{InterfacePtr, InterfaceType};
use crate::message::TailEntry;
use crate::proxy::{Accounting, CallEnd, ProxyCore};
use crate::types::{ChannelId, Error, InstanceId, InterfaceId, MethodIndex, Result};
use async_trait::async_trait;
use comrpc_frame::{Frame, FrameReader};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

/// Decodes parameters, invokes the implementation and encodes results
#[async_trait]
pub trait Stub: Send + Sync {
    /// Handle an interface-specific method (index 3 and up)
    async fn handle(
        &self,
        method: MethodIndex,
        target: &InterfacePtr,
        context: &mut CallContext,
        params: Frame,
    ) -> Result<Frame>;
}

tokio::task_local! {
    static INBOUND: InboundCall;
}

#[derive(Default)]
struct Tail {
    entries: Vec<TailEntry>,
    committed: Vec<Arc<ProxyCore>>,
    after: Vec<Arc<ProxyCore>>,
}

/// Ordering obligations of a response on its way to the peer
///
/// Dropping it marks the AddRefs it carries as delivered.
#[derive(Default)]
pub(crate) struct Delivery {
    /// Proxies whose AddRef rides on this response
    committed: Vec<Arc<ProxyCore>>,
    /// Proxies whose earlier AddRef must be written before this response
    after: Vec<Arc<ProxyCore>>,
}

impl Delivery {
    /// Wait until this response may be written
    pub async fn ready(&self) {
        for core in &self.after {
            if !self.committed.iter().any(|own| Arc::ptr_eq(own, core)) {
                core.add_refs_delivered().await;
            }
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        for core in &self.committed {
            core.add_ref_delivered();
        }
    }
}

/// Response tail of the call currently being served
#[derive(Clone)]
pub(crate) struct InboundCall {
    channel: ChannelId,
    tail: Arc<Mutex<Tail>>,
}

impl InboundCall {
    fn new(channel: ChannelId) -> Self {
        Self {
            channel,
            tail: Arc::new(Mutex::new(Tail::default())),
        }
    }

    /// Run `future` as the body of this call
    pub async fn scope<F: Future>(&self, future: F) -> F::Output {
        INBOUND.scope(self.clone(), future).await
    }

    pub fn take_tail(&self) -> (Vec<TailEntry>, Delivery) {
        let tail = std::mem::take(&mut *self.tail.lock());
        let delivery = Delivery {
            committed: tail.committed,
            after: tail.after,
        };
        (tail.entries, delivery)
    }

    /// Queue Releases for the peer on `channel` into the current response
    ///
    /// Returns false when no call from that peer is being served by this
    /// task; the caller must send the Release itself.
    pub fn defer_release(channel: ChannelId, instance: InstanceId, interface: InterfaceId, count: u32) -> bool {
        INBOUND
            .try_with(|call| {
                if call.channel != channel {
                    return false;
                }
                let mut tail = call.tail.lock();
                if tail.entries.len() + count as usize > u16::MAX as usize {
                    return false;
                }
                tail.entries
                    .extend((0..count).map(|_| TailEntry::release(instance, interface)));
                true
            })
            .unwrap_or(false)
    }
}

/// Per-call state handed to a [`Stub`]
pub struct CallContext {
    admin: Arc<Administrator>,
    channel: Arc<Channel>,
    piggyback: Vec<Arc<ProxyCore>>,
    call: InboundCall,
}

impl CallContext {
    pub(crate) fn new(admin: Arc<Administrator>, channel: Arc<Channel>) -> Self {
        let call = InboundCall::new(channel.id());
        Self {
            admin,
            channel,
            piggyback: Vec::new(),
            call,
        }
    }

    pub(crate) fn inbound(&self) -> InboundCall {
        self.call.clone()
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn administrator(&self) -> &Arc<Administrator> {
        &self.admin
    }

    /// Decode an interface parameter passed in by the caller
    ///
    /// The returned pointer is borrowed for the duration of the call. Take
    /// a reference with `add_ref` to keep it afterwards.
    pub async fn import(&mut self, reader: &mut FrameReader<'_>) -> Result<Option<InterfacePtr>> {
        let reference = InterfaceRef::read(reader)?;
        let imported = self
            .admin
            .import(&self.channel, reference, Accounting::PiggyBack)
            .await?;
        Ok(imported.map(|imported| {
            if let Some(core) = imported.core {
                self.piggyback.push(core);
            }
            imported.ptr
        }))
    }

    pub async fn import_as<I: ?Sized + InterfaceType>(
        &mut self,
        reader: &mut FrameReader<'_>,
    ) -> Result<Option<Arc<I>>> {
        match self.import(reader).await? {
            Some(ptr) => ptr.query::<I>().map(Some).ok_or(Error::UnknownInterface(I::ID)),
            None => Ok(None),
        }
    }

    /// Encode an interface result, passing one reference to the caller
    pub async fn export(&self, frame: &mut Frame, ptr: Option<InterfacePtr>) {
        self.admin
            .export_owned(&self.channel, ptr)
            .await
            .write(frame);
    }

    pub async fn export_as<I: ?Sized + InterfaceType>(&self, frame: &mut Frame, object: Option<Arc<I>>) {
        self.export(frame, object.map(InterfacePtr::new::<I>)).await;
    }

    /// Settle the borrowed references once the implementation returned
    pub(crate) fn finish(&mut self) {
        for core in self.piggyback.drain(..) {
            match core.finish_call() {
                CallEnd::Kept { add_ref: true } => {
                    let mut tail = self.call.tail.lock();
                    tail.entries
                        .push(TailEntry::add_ref(core.instance(), core.interface()));
                    tail.committed.push(core);
                }
                CallEnd::Kept { add_ref: false } => {}
                CallEnd::Destroyed => self.admin.forget_proxy(&core),
                CallEnd::ReleaseOwed(count) => {
                    {
                        let mut tail = self.call.tail.lock();
                        tail.entries
                            .extend((0..count).map(|_| TailEntry::release(core.instance(), core.interface())));
                        tail.after.push(core.clone());
                    }
                    core.mark_destroyed();
                    self.admin.forget_proxy(&core);
                }
            }
        }
    }
}
