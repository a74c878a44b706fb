//! Interface-valued parameters
//!
//! An interface crosses a channel as `u8 marker | u64 instance | u32 interface`:
//!
//! | Marker   | Meaning                                              |
//! |----------|------------------------------------------------------|
//! | Null     | no interface                                         |
//! | Sender   | object lives in the sending process; receiver proxies it |
//! | Receiver | object lives in the receiving process; resolved locally |
//!
//! `Receiver` is produced when a proxy is passed back to the process that
//! owns the real object, so that process gets its own object back instead
//! of a proxy to a proxy.

use super::{Administrator, Loan};
use crate::channel::Channel;
use crate::interface::InterfacePtr;
use crate::proxy::{Accounting, ProxyCore};
use crate::types::{Error, InstanceId, InterfaceId, Result};
use comrpc_frame::{Frame, FrameReader};
use std::sync::Arc;
use tracing::{debug, warn};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Null = 0,
    Sender = 1,
    Receiver = 2,
}

impl Marker {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Marker::Null),
            1 => Some(Marker::Sender),
            2 => Some(Marker::Receiver),
            _ => None,
        }
    }
}

/// Encoded interface parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceRef {
    pub marker: Marker,
    pub instance: InstanceId,
    pub interface: InterfaceId,
}

impl InterfaceRef {
    pub fn null() -> Self {
        Self {
            marker: Marker::Null,
            instance: InstanceId::NULL,
            interface: 0,
        }
    }

    pub fn sender(instance: InstanceId, interface: InterfaceId) -> Self {
        Self {
            marker: Marker::Sender,
            instance,
            interface,
        }
    }

    pub fn receiver(instance: InstanceId, interface: InterfaceId) -> Self {
        Self {
            marker: Marker::Receiver,
            instance,
            interface,
        }
    }

    pub fn write(&self, frame: &mut Frame) {
        frame
            .push_number(self.marker as u8)
            .push_number(self.instance.as_raw())
            .push_number(self.interface);
    }

    pub fn read(reader: &mut FrameReader<'_>) -> Result<Self> {
        let raw: u8 = reader.number()?;
        let marker = Marker::from_u8(raw)
            .ok_or_else(|| Error::InvalidMessage(format!("invalid interface marker {}", raw)))?;
        Ok(Self {
            marker,
            instance: InstanceId::from_raw(reader.number()?),
            interface: reader.number()?,
        })
    }
}

/// Interface obtained from a peer
pub(crate) struct Imported {
    pub ptr: InterfacePtr,
    /// Set when `ptr` is a proxy
    pub core: Option<Arc<ProxyCore>>,
}

impl Administrator {
    /// Encode an interface the peer only borrows for the duration of a call
    ///
    /// Local objects are loaned to the peer; the loans in `keep_alive`
    /// keep them alive and reachable until the reply has been consumed.
    pub(crate) fn export_borrowed(
        &self,
        channel: &Channel,
        ptr: Option<&InterfacePtr>,
        keep_alive: &mut Vec<Loan>,
    ) -> InterfaceRef {
        let Some(ptr) = ptr else {
            return InterfaceRef::null();
        };

        if let Some(core) = self.find_proxy(ptr) {
            if core.channel_id() == channel.id() {
                return InterfaceRef::receiver(core.instance(), core.interface());
            }
        }

        let (instance, loan) = self.lend(channel, ptr);
        keep_alive.push(loan);
        InterfaceRef::sender(instance, ptr.id())
    }

    /// Encode an interface whose reference passes to the peer
    pub(crate) async fn export_owned(&self, channel: &Channel, ptr: Option<InterfacePtr>) -> InterfaceRef {
        let Some(ptr) = ptr else {
            return InterfaceRef::null();
        };

        if let Some(core) = self.find_proxy(&ptr) {
            if core.channel_id() == channel.id() {
                // The peer gets its own object back; our reference is no longer needed
                ptr.release().await;
                return InterfaceRef::receiver(core.instance(), core.interface());
            }
        }

        let instance = self.register_external(channel, &ptr);
        InterfaceRef::sender(instance, ptr.id())
    }

    /// Decode an interface received from the peer on `channel`
    ///
    /// With [`Accounting::RefCounted`] the peer transferred a reference and
    /// the caller owns one; with [`Accounting::PiggyBack`] the reference is
    /// borrowed from the call that delivered it.
    pub(crate) async fn import(
        &self,
        channel: &Arc<Channel>,
        reference: InterfaceRef,
        accounting: Accounting,
    ) -> Result<Option<Imported>> {
        match reference.marker {
            Marker::Null => Ok(None),
            Marker::Receiver => {
                let ptr = self
                    .resolve_lent(channel.id(), reference.instance, reference.interface)
                    .ok_or(Error::UnknownInstance(reference.instance))?;
                if accounting == Accounting::RefCounted {
                    ptr.add_ref();
                }
                Ok(Some(Imported { ptr, core: None }))
            }
            Marker::Sender => {
                match self.obtain(channel, reference.instance, reference.interface, accounting) {
                    Some((ptr, core)) => Ok(Some(Imported {
                        ptr,
                        core: Some(core),
                    })),
                    None => {
                        warn!(
                            "No proxy for interface {:#010x} (instance {}) on channel {}",
                            reference.interface,
                            reference.instance,
                            channel.id()
                        );
                        if accounting == Accounting::RefCounted && !channel.is_closed() {
                            debug!("Returning unusable reference {}", reference.instance);
                            channel
                                .release_remote(reference.instance, reference.interface, 1)
                                .await;
                        }
                        Ok(None)
                    }
                }
            }
        }
    }
}
