//! Remote iterators
//!
//! A cursor over a sequence living in another process. The position
//! starts before the first element; `next` moves onto it.

use super::{ID_STRING_ITERATOR, ID_VALUE_ITERATOR};
use crate::administrator::Administrator;
use crate::interface::{InterfacePtr, InterfaceType, Unknown};
use crate::proxy::ProxyCore;
use crate::stub::{CallContext, Stub};
use crate::types::{method, Error, ErrorCode, InterfaceId, MethodIndex, Result};
use async_trait::async_trait;
use comrpc_frame::{Frame, FrameValue};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;

const NEXT: MethodIndex = method::FIRST;
const PREVIOUS: MethodIndex = method::FIRST + 1;
const RESET: MethodIndex = method::FIRST + 2;
const IS_VALID: MethodIndex = method::FIRST + 3;
const COUNT: MethodIndex = method::FIRST + 4;
const CURRENT: MethodIndex = method::FIRST + 5;

/// Element type a [`RemoteIterator`] can carry
pub trait IteratorItem: FrameValue + Clone + Send + Sync + 'static {
    const INTERFACE: InterfaceId;
    const NAME: &'static str;
}

impl IteratorItem for String {
    const INTERFACE: InterfaceId = ID_STRING_ITERATOR;
    const NAME: &'static str = "StringIterator";
}

impl IteratorItem for u32 {
    const INTERFACE: InterfaceId = ID_VALUE_ITERATOR;
    const NAME: &'static str = "ValueIterator";
}

#[async_trait]
pub trait RemoteIterator<T: IteratorItem>: Unknown {
    /// Advance; the new current element, or `None` past the end
    async fn next(&self) -> Result<Option<T>>;

    async fn previous(&self) -> Result<Option<T>>;

    /// Move to `position`, 0 being before the first element
    async fn reset(&self, position: u32) -> Result<()>;

    async fn is_valid(&self) -> Result<bool>;

    async fn count(&self) -> Result<u32>;

    async fn current(&self) -> Result<Option<T>>;
}

impl<T: IteratorItem> InterfaceType for dyn RemoteIterator<T> {
    const ID: InterfaceId = T::INTERFACE;
    const NAME: &'static str = T::NAME;
}

/// Local iterator over a vector
pub struct VecIterator<T> {
    items: Vec<T>,
    position: Mutex<usize>,
}

impl<T: IteratorItem> VecIterator<T> {
    pub fn new(items: Vec<T>) -> Arc<Self> {
        Arc::new(Self {
            items,
            position: Mutex::new(0),
        })
    }

    fn at(&self, position: usize) -> Option<T> {
        position
            .checked_sub(1)
            .and_then(|index| self.items.get(index))
            .cloned()
    }
}

impl<T: IteratorItem> Unknown for VecIterator<T> {}

#[async_trait]
impl<T: IteratorItem> RemoteIterator<T> for VecIterator<T> {
    async fn next(&self) -> Result<Option<T>> {
        let mut position = self.position.lock();
        if *position <= self.items.len() {
            *position += 1;
        }
        Ok(self.at(*position))
    }

    async fn previous(&self) -> Result<Option<T>> {
        let mut position = self.position.lock();
        *position = position.saturating_sub(1);
        Ok(self.at(*position))
    }

    async fn reset(&self, position: u32) -> Result<()> {
        *self.position.lock() = (position as usize).min(self.items.len() + 1);
        Ok(())
    }

    async fn is_valid(&self) -> Result<bool> {
        let position = *self.position.lock();
        Ok(position > 0 && position <= self.items.len())
    }

    async fn count(&self) -> Result<u32> {
        Ok(self.items.len() as u32)
    }

    async fn current(&self) -> Result<Option<T>> {
        Ok(self.at(*self.position.lock()))
    }
}

pub struct IteratorStub<T>(PhantomData<fn() -> T>);

impl<T> IteratorStub<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for IteratorStub<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: IteratorItem> Stub for IteratorStub<T> {
    async fn handle(
        &self,
        method: MethodIndex,
        target: &InterfacePtr,
        _context: &mut CallContext,
        params: Frame,
    ) -> Result<Frame> {
        let iterator = target
            .query::<dyn RemoteIterator<T>>()
            .ok_or(Error::UnknownInterface(T::INTERFACE))?;
        let mut result = Frame::new();
        match method {
            NEXT => {
                result.push(&iterator.next().await?)?;
            }
            PREVIOUS => {
                result.push(&iterator.previous().await?)?;
            }
            RESET => iterator.reset(params.reader().number()?).await?,
            IS_VALID => {
                result.push_number(iterator.is_valid().await?);
            }
            COUNT => {
                result.push_number(iterator.count().await?);
            }
            CURRENT => {
                result.push(&iterator.current().await?)?;
            }
            _ => {
                return Err(Error::UnknownMethod {
                    interface: T::INTERFACE,
                    method,
                })
            }
        }
        Ok(result)
    }
}

pub struct IteratorProxy<T> {
    core: Arc<ProxyCore>,
    _item: PhantomData<fn() -> T>,
}

impl<T: IteratorItem> IteratorProxy<T> {
    pub fn new(core: Arc<ProxyCore>) -> Self {
        Self {
            core,
            _item: PhantomData,
        }
    }

    async fn fetch(&self, method: MethodIndex) -> Result<Option<T>> {
        let reply = self.core.call(method).send().await?;
        Ok(reply.reader().read()?)
    }
}

#[async_trait]
impl<T: IteratorItem> Unknown for IteratorProxy<T> {
    fn add_ref(&self) {
        self.core.add_ref();
    }

    async fn release(&self) -> ErrorCode {
        self.core.release().await
    }

    fn query_interface(self: Arc<Self>, interface: InterfaceId) -> BoxFuture<'static, Option<InterfacePtr>> {
        Box::pin(async move {
            let this = InterfacePtr::new::<dyn RemoteIterator<T>>(self.clone());
            self.core.query_interface(&this, interface).await
        })
    }
}

#[async_trait]
impl<T: IteratorItem> RemoteIterator<T> for IteratorProxy<T> {
    async fn next(&self) -> Result<Option<T>> {
        self.fetch(NEXT).await
    }

    async fn previous(&self) -> Result<Option<T>> {
        self.fetch(PREVIOUS).await
    }

    async fn reset(&self, position: u32) -> Result<()> {
        let mut call = self.core.call(RESET);
        call.number(position);
        call.send().await?;
        Ok(())
    }

    async fn is_valid(&self) -> Result<bool> {
        let reply = self.core.call(IS_VALID).send().await?;
        Ok(reply.reader().number()?)
    }

    async fn count(&self) -> Result<u32> {
        let reply = self.core.call(COUNT).send().await?;
        Ok(reply.reader().number()?)
    }

    async fn current(&self) -> Result<Option<T>> {
        self.fetch(CURRENT).await
    }
}

pub(super) fn register<T: IteratorItem>(admin: &Administrator) {
    admin.register_interface::<dyn RemoteIterator<T>, _, _>(IteratorStub::<T>::new(), |core| {
        InterfacePtr::new::<dyn RemoteIterator<T>>(Arc::new(IteratorProxy::<T>::new(core)))
    });
}
