//! Remote view of a connection
//!
//! A [`Connection`](crate::communicator::Connection) implements
//! [`RemoteConnection`], so it can be handed to another process which can
//! then inspect, terminate or acquire classes through it.

use super::ID_REMOTE_CONNECTION;
use crate::administrator::Administrator;
use crate::interface::{InterfacePtr, InterfaceType, Unknown};
use crate::proxy::ProxyCore;
use crate::stub::{CallContext, Stub};
use crate::types::{method, ConnectionId, Error, InterfaceId, MethodIndex, Result};
use async_trait::async_trait;
use comrpc_frame::Frame;
use std::sync::Arc;

const ID: MethodIndex = method::FIRST;
const REMOTE_ID: MethodIndex = method::FIRST + 1;
const TERMINATE: MethodIndex = method::FIRST + 2;
const ACQUIRE: MethodIndex = method::FIRST + 3;

#[async_trait]
pub trait RemoteConnection: Unknown {
    async fn id(&self) -> Result<ConnectionId>;

    /// Pid of the peer process, 0 when unknown
    async fn remote_id(&self) -> Result<u32>;

    async fn terminate(&self) -> Result<()>;

    /// Instantiate `class_name` in the peer; the result carries one reference
    async fn acquire(&self, class_name: &str, interface: InterfaceId, version: u32) -> Result<Option<InterfacePtr>>;
}

impl InterfaceType for dyn RemoteConnection {
    const ID: InterfaceId = ID_REMOTE_CONNECTION;
    const NAME: &'static str = "RemoteConnection";
}

pub struct RemoteConnectionStub;

#[async_trait]
impl Stub for RemoteConnectionStub {
    async fn handle(
        &self,
        method: MethodIndex,
        target: &InterfacePtr,
        context: &mut CallContext,
        params: Frame,
    ) -> Result<Frame> {
        let connection = target
            .query::<dyn RemoteConnection>()
            .ok_or(Error::UnknownInterface(ID_REMOTE_CONNECTION))?;
        let mut result = Frame::new();
        match method {
            ID => {
                result.push_number(connection.id().await?);
            }
            REMOTE_ID => {
                result.push_number(connection.remote_id().await?);
            }
            TERMINATE => connection.terminate().await?,
            ACQUIRE => {
                let mut reader = params.reader();
                let class_name = reader.text()?;
                let interface: InterfaceId = reader.number()?;
                let version: u32 = reader.number()?;
                let acquired = connection.acquire(&class_name, interface, version).await?;
                context.export(&mut result, acquired).await;
            }
            _ => {
                return Err(Error::UnknownMethod {
                    interface: ID_REMOTE_CONNECTION,
                    method,
                })
            }
        }
        Ok(result)
    }
}

pub struct RemoteConnectionProxy {
    core: Arc<ProxyCore>,
}

impl RemoteConnectionProxy {
    pub fn new(core: Arc<ProxyCore>) -> Self {
        Self { core }
    }
}

crate::proxy_unknown!(RemoteConnectionProxy, dyn RemoteConnection);

#[async_trait]
impl RemoteConnection for RemoteConnectionProxy {
    async fn id(&self) -> Result<ConnectionId> {
        let reply = self.core.call(ID).send().await?;
        Ok(reply.reader().number()?)
    }

    async fn remote_id(&self) -> Result<u32> {
        let reply = self.core.call(REMOTE_ID).send().await?;
        Ok(reply.reader().number()?)
    }

    async fn terminate(&self) -> Result<()> {
        self.core.call(TERMINATE).send().await?;
        Ok(())
    }

    async fn acquire(&self, class_name: &str, interface: InterfaceId, version: u32) -> Result<Option<InterfacePtr>> {
        let mut call = self.core.call(ACQUIRE);
        call.text(class_name)?.number(interface).number(version);
        let reply = call.send().await?;
        self.core.import(&mut reply.reader()).await
    }
}

pub(super) fn register(admin: &Administrator) {
    admin.register_interface::<dyn RemoteConnection, _, _>(RemoteConnectionStub, |core| {
        InterfacePtr::new::<dyn RemoteConnection>(Arc::new(RemoteConnectionProxy::new(core)))
    });
}
