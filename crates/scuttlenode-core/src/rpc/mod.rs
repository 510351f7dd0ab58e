//! Multiplexed request/stream protocol carried over a box stream
//!
//! A connection carries any number of concurrent requests. Each one is
//! either a single `async` call or a stream (`source`, `sink`, `duplex`)
//! that stays open until both sides sent an end-or-error packet.

mod codec;
mod connection;
mod message;
mod router;

pub use codec::{BodyType, Packet, RpcCodec, RpcFrame, HEADER_LEN, MAX_BODY_LEN};
pub use connection::{Connection, RpcSender, RpcStream};
pub use message::{Body, ErrorBody, ProcedureName, ProcedureType, Request};
pub use router::{Handler, IncomingRequest, Router};

#[cfg(test)]
pub(crate) use connection::test_support;
