//! # astrun
//!
//! Bidirectional runtime for chained remote calls.
//!
//! A hub [`Engine`] serves; client engines connect and register under a name.
//! Any endpoint can then build a call chain with a [`Proxy`] and await it: the
//! chain travels as one [`AstNode`], is evaluated against the addressed
//! endpoint's [`Namespace`](namespace::Namespace), and only the final result
//! comes back. Chains addressed to another client are relayed by the hub.
//!
//! ```ignore
//! let hub = Engine::new(Config::new("hub"));
//! hub.register("add", Value::function("add", |a| Ok(Value::from(a.i64(0, "a")? + a.i64(1, "b")?))));
//! let (listener, connector) = memory::channel();
//! tokio::spawn({ let hub = hub.clone(); async move { hub.serve(listener).await } });
//!
//! let client = Engine::new(Config::new("alice"));
//! client.connect(&connector).await?;
//! assert_eq!(client.server().attr("add").call(args![4, 4]).await?, 8);
//! ```

pub mod config;
pub mod context;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod memory;
pub mod namespace;
pub mod proxy;
pub mod registry;
pub mod runtime;
pub mod tcp;
pub mod transport;
pub mod value;

pub use astrpc;
pub use astrpc::AddressTag;
pub use astrpc::Arg;
pub use astrpc::AstNode;
pub use astrpc::ErrorCode;
pub use astrpc::RpcError;

pub use config::Config;
pub use context::CallContext;
pub use engine::Engine;
pub use engine::Role;
pub use error::Error;
pub use error::Result;
pub use proxy::Proxy;
pub use proxy::RawProxy;
pub use proxy::RemoteStream;
pub use proxy::Reply;
pub use registry::ConnId;
pub use registry::ConnState;
pub use runtime::Evaluator;
pub use transport::Connection;
pub use transport::Connector;
pub use transport::Listener;
pub use transport::TransportError;
pub use value::Args;
pub use value::Generator;
pub use value::Object;
pub use value::Outcome;
pub use value::Value;

/// Positional arguments for [`Proxy::call`].
///
/// `args![4, "x", server.attr("ping")]`
#[macro_export]
macro_rules! args {
    () => {
        ::std::vec::Vec::<$crate::Arg>::new()
    };
    ($($arg:expr),+ $(,)?) => {
        ::std::vec![$($crate::Arg::from($arg)),+]
    };
}

/// Keyword arguments for [`Proxy::call_kw`].
///
/// `kwargs! { "b" => 2 }`
#[macro_export]
macro_rules! kwargs {
    () => {
        ::std::vec::Vec::<(::std::string::String, $crate::Arg)>::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {
        ::std::vec![$((::std::string::String::from($key), $crate::Arg::from($value))),+]
    };
}
