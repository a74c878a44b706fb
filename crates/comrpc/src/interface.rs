//! Interface pointers and the base interface
//!
//! Every marshalable interface is a trait extending [`Unknown`], and the
//! trait object type (`dyn MyInterface`) implements [`InterfaceType`] to
//! bind it to a stable [`InterfaceId`]. An [`InterfacePtr`] erases the
//! concrete trait so the administrator can store, compare and hand out
//! interfaces of any registered type, and [`InterfacePtr::query`] recovers
//! the typed `Arc<dyn MyInterface>` again.
//!
//! Local objects and proxies look the same through this layer. For local
//! objects `add_ref`/`release` are usually no-ops because `Arc` owns the
//! memory; for proxies they drive the remote reference protocol.

use crate::types::{ErrorCode, InterfaceId};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

/// Base interface shared by every marshalable type
#[async_trait]
pub trait Unknown: Send + Sync {
    /// Take an additional logical reference
    fn add_ref(&self) {}

    /// Drop a logical reference; `DestructionSucceeded` when this was the last one
    async fn release(&self) -> ErrorCode {
        ErrorCode::None
    }

    /// Ask for another interface on the same object
    ///
    /// A returned pointer carries one reference owned by the caller.
    fn query_interface(
        self: Arc<Self>,
        interface: InterfaceId,
    ) -> BoxFuture<'static, Option<InterfacePtr>> {
        let _ = interface;
        Box::pin(async { None })
    }
}

/// Binds an interface trait object type to its wire identity
///
/// Implemented for `dyn Trait`, e.g. `impl InterfaceType for dyn Calculator`.
pub trait InterfaceType: Unknown + 'static {
    const ID: InterfaceId;
    const NAME: &'static str;
}

/// Type-erased view of an `Arc<dyn Trait>`
trait Facet: Send + Sync {
    fn object(&self) -> &(dyn Any + Send + Sync);
    fn identity(&self) -> usize;
    fn add_ref(&self);
    fn release(&self) -> BoxFuture<'_, ErrorCode>;
    fn query_interface(&self, interface: InterfaceId) -> BoxFuture<'static, Option<InterfacePtr>>;
}

struct Holder<I: ?Sized>(Arc<I>);

impl<I: ?Sized + InterfaceType> Facet for Holder<I> {
    fn object(&self) -> &(dyn Any + Send + Sync) {
        &self.0
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.0).cast::<()>() as usize
    }

    fn add_ref(&self) {
        self.0.add_ref()
    }

    fn release(&self) -> BoxFuture<'_, ErrorCode> {
        self.0.release()
    }

    fn query_interface(&self, interface: InterfaceId) -> BoxFuture<'static, Option<InterfacePtr>> {
        self.0.clone().query_interface(interface)
    }
}

/// Type-erased interface pointer
///
/// Cloning is cheap and does not touch the logical reference count.
#[derive(Clone)]
pub struct InterfacePtr {
    id: InterfaceId,
    facet: Arc<dyn Facet>,
}

impl InterfacePtr {
    pub fn new<I: ?Sized + InterfaceType>(object: Arc<I>) -> Self {
        Self {
            id: I::ID,
            facet: Arc::new(Holder(object)),
        }
    }

    pub fn id(&self) -> InterfaceId {
        self.id
    }

    /// Address of the underlying object
    ///
    /// Two pointers to different interfaces of the same object share an
    /// identity.
    pub fn identity(&self) -> usize {
        self.facet.identity()
    }

    pub fn same_object(&self, other: &InterfacePtr) -> bool {
        self.identity() == other.identity()
    }

    /// Recover the typed interface
    pub fn query<I: ?Sized + InterfaceType>(&self) -> Option<Arc<I>> {
        if self.id != I::ID {
            return None;
        }
        self.facet.object().downcast_ref::<Arc<I>>().cloned()
    }

    pub fn add_ref(&self) {
        self.facet.add_ref();
    }

    pub async fn release(&self) -> ErrorCode {
        self.facet.release().await
    }

    /// Query for another interface; the result carries one reference
    pub async fn query_interface(&self, interface: InterfaceId) -> Option<InterfacePtr> {
        if interface == self.id {
            self.add_ref();
            return Some(self.clone());
        }
        self.facet.query_interface(interface).await
    }

    pub fn downgrade(&self) -> WeakInterfacePtr {
        WeakInterfacePtr {
            id: self.id,
            facet: Arc::downgrade(&self.facet),
        }
    }
}

impl fmt::Debug for InterfacePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfacePtr")
            .field("id", &format_args!("{:#010x}", self.id))
            .field("identity", &format_args!("{:#x}", self.identity()))
            .finish()
    }
}

/// Non-owning interface pointer, used by the instance table
#[derive(Clone)]
pub struct WeakInterfacePtr {
    id: InterfaceId,
    facet: Weak<dyn Facet>,
}

impl WeakInterfacePtr {
    pub fn id(&self) -> InterfaceId {
        self.id
    }

    pub fn upgrade(&self) -> Option<InterfacePtr> {
        self.facet.upgrade().map(|facet| InterfacePtr { id: self.id, facet })
    }

    pub fn is_alive(&self) -> bool {
        self.facet.strong_count() > 0
    }
}
