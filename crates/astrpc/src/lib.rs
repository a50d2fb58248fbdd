//! # astrpc
//!
//! Wire protocol for chained remote calls.
//!
//! A call expression built on one peer is carried to another as a tree of
//! [`AstNode`]s inside a JSON frame. This crate defines the nodes, the frames
//! and the codec between them. It performs no I/O and knows nothing about how
//! nodes are evaluated.

pub mod ast;
pub mod codec;
pub mod error;
pub mod message;

pub use ast::AddressTag;
pub use ast::Arg;
pub use ast::AstNode;
pub use ast::Operation;
pub use ast::Target;
pub use ast::REGISTER_ENTRY;
pub use error::ErrorCode;
pub use error::ProtocolError;
pub use error::Result;
pub use error::RpcError;
pub use message::Message;
pub use message::Request;
pub use message::Response;
pub use message::PROTOCOL;

#[cfg(test)]
mod tests;
