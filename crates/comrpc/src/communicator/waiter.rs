//! Announce waiters for spawned connections

use crate::interface::InterfacePtr;
use crate::types::ConnectionId;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;

pub(crate) type Announced = Option<InterfacePtr>;

/// One waiter per connection created with `create`
#[derive(Default)]
pub(crate) struct WaiterTable {
    waiters: Mutex<HashMap<ConnectionId, oneshot::Sender<Announced>>>,
}

impl WaiterTable {
    pub fn register(&self, connection: ConnectionId) -> oneshot::Receiver<Announced> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(connection, tx);
        rx
    }

    /// Claim the waiter; only one announce can do so
    pub fn take(&self, connection: ConnectionId) -> Option<oneshot::Sender<Announced>> {
        self.waiters.lock().remove(&connection)
    }

    pub fn cancel(&self, connection: ConnectionId) -> bool {
        self.take(connection).is_some()
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }
}
