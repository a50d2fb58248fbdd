//! # Call Builder
//!
//! A [`Proxy`] records attribute accesses and calls into an [`AstNode`]
//! without sending anything. Awaiting it sends the chain and yields the
//! result; iterating it opens a remote async iterator.
//!
//! ```ignore
//! let eight = engine.server().attr("add").call(args![4, 4]).await?;
//! let mut numbers = engine.server().attr("async_generator").call(args![]).iter();
//! while let Some(n) = numbers.next().await { ... }
//! ```
//!
//! ## Invariants
//!
//! - **Immutable**: Every builder method returns a new proxy. A proxy can be
//!   awaited any number of times, and branching off a shared prefix never
//!   affects the other branch.
//! - **Composable**: A proxy passed as an argument of another call travels as
//!   its node and is evaluated on the far side, never awaited locally.

use std::collections::BTreeMap;
use std::future::IntoFuture;

use astrpc::AddressTag;
use astrpc::Arg;
use astrpc::AstNode;
use astrpc::Target;
use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value as Json;

use crate::engine::Engine;
use crate::engine::Route;
use crate::error::Error;
use crate::error::Result;
use crate::registry::ConnId;
use crate::value::Generator;
use crate::value::Value;

/// Items of a remote async iterator.
pub type RemoteStream = BoxStream<'static, Result<Json>>;

#[derive(Clone)]
pub struct Proxy {
    engine: Engine,
    /// `Null` or an address tag.
    root: Target,
    node: Option<AstNode>,
}

impl Proxy {
    pub(crate) fn new(engine: Engine, root: Target) -> Self {
        Self { engine, root, node: None }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The address this chain is rooted at, if any.
    pub fn address(&self) -> Option<&AddressTag> {
        match &self.root {
            Target::Address(tag) => Some(tag),
            _ => None,
        }
    }

    /// The chain recorded so far.
    pub fn node(&self) -> Option<&AstNode> {
        self.node.as_ref()
    }

    fn with_node(&self, node: AstNode) -> Self {
        Self {
            engine: self.engine.clone(),
            root: self.root.clone(),
            node: Some(node),
        }
    }

    pub fn attr(&self, name: impl Into<String>) -> Self {
        let node = match &self.node {
            Some(node) => node.clone().get_attr(name),
            None => AstNode::rooted(self.root.clone(), name),
        };
        self.with_node(node)
    }

    pub fn call<I>(&self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Arg>,
    {
        self.call_kw(args, std::iter::empty::<(String, Arg)>())
    }

    pub fn call_kw<I, K, S>(&self, args: I, kwargs: K) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Arg>,
        K: IntoIterator<Item = (S, Arg)>,
        S: Into<String>,
    {
        let args: Vec<Arg> = args.into_iter().map(Into::into).collect();
        let kwargs: BTreeMap<String, Arg> = kwargs.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let node = match &self.node {
            Some(node) => node.clone().call(args, kwargs),
            // Calling the bare root; evaluation rejects it as a malformed leaf.
            None => AstNode::new(self.root.clone(), Some(astrpc::Operation::Call), args, kwargs),
        };
        self.with_node(node)
    }

    /// Awaiting the returned builder yields the request id along with the
    /// result, so the result can be chained on later.
    pub fn raw(&self) -> RawProxy {
        RawProxy(self.clone())
    }

    /// Opens the chain's result as an async iterator.
    pub fn iter(&self) -> RemoteStream {
        let start = match self.chain() {
            Ok(node) => node.iter_start(),
            Err(e) => return futures::stream::once(async move { Err(e) }).boxed(),
        };
        RemoteIter::new(self.engine.clone(), self.address().cloned(), start)
            .into_values()
            .map(|item| item.map(|value| value.describe()))
            .boxed()
    }

    /// Sends the chain and waits for the result.
    pub async fn fetch(&self) -> Result<Reply> {
        let node = self.chain()?;
        let route = self.engine.route(self.address())?;
        let (id, value) = self.engine.request(route, node).await?;
        Ok(Reply {
            id,
            value,
            origin: Self::new(self.engine.clone(), self.root.clone()),
        })
    }

    fn chain(&self) -> Result<AstNode> {
        self.node
            .clone()
            .ok_or_else(|| Error::InvalidRequest("empty call chain".to_string()))
    }
}

impl IntoFuture for Proxy {
    type Output = Result<Json>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.fetch().await.map(Reply::into_value) }.boxed()
    }
}

impl From<Proxy> for Arg {
    fn from(proxy: Proxy) -> Self {
        proxy.node.map(Arg::Node).unwrap_or(Arg::Literal(Json::Null))
    }
}

impl From<&Proxy> for Arg {
    fn from(proxy: &Proxy) -> Self {
        proxy.clone().into()
    }
}

/// A [`Proxy`] that resolves to a [`Reply`].
#[derive(Clone)]
pub struct RawProxy(Proxy);

impl IntoFuture for RawProxy {
    type Output = Result<Reply>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.0.fetch().await }.boxed()
    }
}

/// A result together with the id it is stored under on the evaluating side.
#[derive(Clone)]
pub struct Reply {
    id: String,
    value: Json,
    origin: Proxy,
}

impl Reply {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn value(&self) -> &Json {
        &self.value
    }

    pub fn into_value(self) -> Json {
        self.value
    }

    /// A builder rooted at the stored result. Only live results (objects,
    /// iterators) are stored, and only when evaluated remotely.
    pub fn proxy(&self) -> Proxy {
        let node = AstNode::rooted(self.origin.root.clone(), self.id.clone());
        self.origin.with_node(node)
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reply").field("id", &self.id).field("value", &self.value).finish()
    }
}

enum Cursor {
    /// Holds the `__aiter__` node not yet sent.
    Start(AstNode),
    Remote { conn: ConnId, token: String },
    Local(Generator),
    Done,
}

/// Client side of a remote async iterator: one iterate-start, then one
/// iterate-next per item until the far side reports exhaustion.
pub(crate) struct RemoteIter {
    engine: Engine,
    root: Option<AddressTag>,
    cursor: Cursor,
}

impl RemoteIter {
    pub(crate) fn new(engine: Engine, root: Option<AddressTag>, start: AstNode) -> Self {
        Self {
            engine,
            root,
            cursor: Cursor::Start(start),
        }
    }

    pub(crate) fn into_values(self) -> BoxStream<'static, Result<Value>> {
        futures::stream::unfold(self, |mut iter| async move {
            let item = iter.next().await?;
            Some((item, iter))
        })
        .boxed()
    }

    async fn next(&mut self) -> Option<Result<Value>> {
        loop {
            match std::mem::replace(&mut self.cursor, Cursor::Done) {
                Cursor::Start(node) => match self.open(node).await {
                    Ok(cursor) => self.cursor = cursor,
                    Err(e) => return Some(Err(e)),
                },
                Cursor::Remote { conn, token } => {
                    let node = AstNode::iter_next(token.clone());
                    return match self.engine.request(Route::Remote(conn), node).await {
                        Ok((_, item)) => {
                            self.cursor = Cursor::Remote { conn, token };
                            Some(Ok(Value::Data(item)))
                        }
                        Err(Error::Exhausted) => None,
                        Err(e) => Some(Err(e)),
                    };
                }
                Cursor::Local(generator) => {
                    return match generator.advance().await {
                        Ok(item) => {
                            self.cursor = Cursor::Local(generator);
                            Some(Ok(item))
                        }
                        Err(Error::Exhausted) => None,
                        Err(e) => Some(Err(e)),
                    };
                }
                Cursor::Done => return None,
            }
        }
    }

    async fn open(&self, node: AstNode) -> Result<Cursor> {
        match self.engine.route(self.root.as_ref())? {
            Route::Remote(conn) => {
                let (_, token) = self.engine.request(Route::Remote(conn), node).await?;
                match token {
                    Json::String(token) => Ok(Cursor::Remote { conn, token }),
                    other => Err(Error::InvalidRequest(format!(
                        "iteration did not return a continuation token: {}",
                        other
                    ))),
                }
            }
            Route::Loopback => {
                let value = self.engine.evaluate_local(&node).await?;
                Ok(Cursor::Local(value.iterate()?))
            }
        }
    }
}
