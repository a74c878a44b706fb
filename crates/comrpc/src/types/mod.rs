//! Core COM-RPC data types

mod error;
mod ids;

pub use error::{Error, ErrorCode, Result};
pub use ids::{method, ChannelId, ConnectionId, InstanceId, InterfaceId, MethodIndex, RELEASE_DIRECTION};
