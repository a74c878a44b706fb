//! Inbound invoke dispatch
//!
//! AddRef, Release and QueryInterface (methods 0-2) are handled here for
//! every interface; everything else goes to the registered stub.
//!
//! A peer only reaches instances lent to it on the same channel; any other
//! handle is answered like an unknown one.

use super::Administrator;
use crate::channel::Channel;
use crate::message::{InvokeRequest, InvokeResponse};
use crate::stub::{CallContext, Delivery};
use crate::types::{method, ErrorCode, InstanceId};
use comrpc_frame::Frame;
use std::sync::Arc;
use tracing::{debug, warn};

/// Response to an inbound call, with what it owes the peer in ordering
pub(crate) struct Dispatched {
    pub response: InvokeResponse,
    pub delivery: Delivery,
}

impl From<InvokeResponse> for Dispatched {
    fn from(response: InvokeResponse) -> Self {
        Self {
            response,
            delivery: Delivery::default(),
        }
    }
}

impl Administrator {
    /// Handle one inbound call and build its response
    ///
    /// Unknown interfaces and instances are answered with
    /// [`ErrorCode::UnknownKey`]; the channel stays up.
    pub(crate) async fn dispatch(self: &Arc<Self>, channel: &Arc<Channel>, request: InvokeRequest) -> Dispatched {
        match request.method {
            method::ADD_REF => self.dispatch_add_ref(channel, &request).into(),
            method::RELEASE => self.dispatch_release(channel, &request).await.into(),
            method::QUERY_INTERFACE => self.dispatch_query_interface(channel, &request).await.into(),
            _ => self.dispatch_stub(channel, request).await,
        }
    }

    fn reference_count(params: &Frame) -> u32 {
        params.get_number::<u32>(0).unwrap_or(1).max(1)
    }

    fn dispatch_add_ref(&self, channel: &Channel, request: &InvokeRequest) -> InvokeResponse {
        let count = Self::reference_count(&request.params);
        match self.add_ref_external(channel, request.instance, request.interface, count) {
            Ok(()) => InvokeResponse::status(ErrorCode::None),
            Err(e) => {
                warn!("AddRef on {} failed: {}", request.instance, e);
                InvokeResponse::status(e.code())
            }
        }
    }

    async fn dispatch_release(&self, channel: &Channel, request: &InvokeRequest) -> InvokeResponse {
        let count = Self::reference_count(&request.params);
        let result = self
            .release_external(channel.id(), request.instance, request.interface, count)
            .await;
        InvokeResponse::status(result)
    }

    async fn dispatch_query_interface(&self, channel: &Channel, request: &InvokeRequest) -> InvokeResponse {
        let Ok(requested) = request.params.get_number::<u32>(0) else {
            return InvokeResponse::status(ErrorCode::BadRequest);
        };
        let Some(target) = self.resolve_lent(channel.id(), request.instance, request.interface) else {
            warn!(
                "QueryInterface on unknown instance {} ({:#010x})",
                request.instance, request.interface
            );
            return InvokeResponse::status(ErrorCode::UnknownKey);
        };

        let instance = match target.query_interface(requested).await {
            Some(ptr) => self.register_external(channel, &ptr),
            None => {
                debug!("{} does not implement {:#010x}", request.instance, requested);
                InstanceId::NULL
            }
        };

        let mut frame = Frame::new();
        frame.push_number(instance.as_raw());
        InvokeResponse {
            result: ErrorCode::None,
            frame,
            tail: Vec::new(),
        }
    }

    async fn dispatch_stub(self: &Arc<Self>, channel: &Arc<Channel>, request: InvokeRequest) -> Dispatched {
        let Some(stub) = self.stub(request.interface) else {
            warn!(
                "Call for unregistered interface {:#010x} on channel {}",
                request.interface,
                channel.id()
            );
            return InvokeResponse::status(ErrorCode::UnknownKey).into();
        };
        let Some(target) = self.resolve_lent(channel.id(), request.instance, request.interface) else {
            warn!(
                "Call on unknown instance {} ({:#010x}) on channel {}",
                request.instance,
                request.interface,
                channel.id()
            );
            return InvokeResponse::status(ErrorCode::UnknownKey).into();
        };

        let InvokeRequest {
            method,
            interface,
            params,
            ..
        } = request;
        let mut context = CallContext::new(self.clone(), channel.clone());
        let call = context.inbound();
        let result = call
            .scope(async {
                let result = stub.handle(method, &target, &mut context, params).await;
                context.finish();
                result
            })
            .await;
        let (tail, delivery) = call.take_tail();

        let response = match result {
            Ok(frame) => InvokeResponse {
                result: ErrorCode::None,
                frame,
                tail,
            },
            Err(e) => {
                debug!(
                    "Method {} on {:#010x} failed: {}",
                    method, interface, e
                );
                InvokeResponse {
                    result: e.code(),
                    frame: Frame::new(),
                    tail,
                }
            }
        };
        Dispatched { response, delivery }
    }
}
