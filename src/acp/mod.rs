// Agent protocol: JSON-RPC over a subprocess's stdio

pub mod client;
pub mod message;

pub use client::{ClientEvent, ProtocolClient, ProtocolClientConfig, PROTOCOL_VERSION};
pub use message::{Envelope, OutgoingRequest, OutgoingResponse, RpcError};
