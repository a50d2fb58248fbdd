//! # Evaluator
//!
//! Walks an [`AstNode`] against the local namespace, or forwards it when it is
//! addressed to another endpoint.
//!
//! ## Evaluation order
//!
//! 1. A chain rooted at a foreign address is relayed whole and its result
//!    returned as data. An iterate-start is relayed lazily as a live iterator.
//! 2. Otherwise the chain is evaluated innermost first: the root leaf resolves
//!    a namespace key, then each step applies its operation to the previous
//!    result.
//! 3. Arguments are evaluated left to right, positional before keyword, each
//!    through step 1, so nested nodes can live on different endpoints.

use std::collections::BTreeMap;

use astrpc::AddressTag;
use astrpc::Arg;
use astrpc::AstNode;
use astrpc::Operation;
use astrpc::Target;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value as Json;
use tracing::debug;

use crate::engine::Engine;
use crate::error::Error;
use crate::error::Result;
use crate::proxy::RemoteIter;
use crate::registry::ConnId;
use crate::value::Args;
use crate::value::Generator;
use crate::value::Value;

pub struct Evaluator {
    engine: Engine,
    /// Whose locals are visible. `None` for loopback evaluation.
    conn: Option<ConnId>,
}

impl Evaluator {
    pub fn new(engine: &Engine, conn: Option<ConnId>) -> Self {
        Self {
            engine: engine.clone(),
            conn,
        }
    }

    pub fn evaluate<'a>(&'a self, node: &'a AstNode) -> BoxFuture<'a, Result<Value>> {
        async move {
            if let Some(tag) = node.root_address() {
                if !self.engine.is_local(tag) {
                    return self.relay(tag, node).await;
                }
            }
            self.eval_chain(node).await
        }
        .boxed()
    }

    fn eval_chain<'a>(&'a self, node: &'a AstNode) -> BoxFuture<'a, Result<Value>> {
        async move {
            let namespace = self.engine.namespace();
            let receiver = match &node.target {
                Target::Null | Target::Address(_) => {
                    let Some(key) = node.leaf_name() else {
                        return Err(Error::MethodNotFound(format!("malformed leaf {}", node)));
                    };
                    return namespace.lookup(self.conn, key);
                }
                // Continuation tokens only ever name stored locals.
                Target::Name(key) => match (node.operation, self.conn) {
                    (Some(Operation::IterNext), Some(conn)) => namespace.lookup_local(conn, key)?,
                    _ => namespace.lookup(self.conn, key)?,
                },
                Target::Node(inner) => self.eval_chain(inner).await?,
            };
            self.apply(receiver, node).await
        }
        .boxed()
    }

    async fn apply(&self, receiver: Value, node: &AstNode) -> Result<Value> {
        match node.operation {
            None => Ok(receiver),
            Some(Operation::GetAttr) => {
                let name = self.attr_name(node).await?;
                receiver.get_attr(&name)
            }
            Some(Operation::Call) => {
                let args = self.eval_args(&node.args, &node.kwargs).await?;
                receiver.call(args)?.resolve().await
            }
            Some(Operation::IterStart) => receiver.iterate().map(Value::Stream),
            Some(Operation::IterNext) => match receiver {
                Value::Stream(generator) => generator.advance().await,
                other => Err(Error::NotIterable(other.type_name())),
            },
        }
    }

    async fn attr_name(&self, node: &AstNode) -> Result<String> {
        match node.args.as_slice() {
            [Arg::Literal(Json::String(name))] => Ok(name.clone()),
            [arg] => match self.eval_arg(arg).await? {
                Value::Data(Json::String(name)) => Ok(name),
                other => Err(Error::InvalidParams(format!(
                    "attribute name must be str, not {}",
                    other.type_name()
                ))),
            },
            _ => Err(Error::InvalidParams("attribute access takes exactly one argument".to_string())),
        }
    }

    async fn eval_args(&self, args: &[Arg], kwargs: &BTreeMap<String, Arg>) -> Result<Args> {
        let mut positional = Vec::with_capacity(args.len());
        for arg in args {
            positional.push(self.eval_arg(arg).await?);
        }
        let mut keyword = BTreeMap::new();
        for (key, arg) in kwargs {
            keyword.insert(key.clone(), self.eval_arg(arg).await?);
        }
        Ok(Args::new(positional, keyword))
    }

    fn eval_arg<'a>(&'a self, arg: &'a Arg) -> BoxFuture<'a, Result<Value>> {
        async move {
            match arg {
                Arg::Literal(value) => Ok(Value::Data(value.clone())),
                Arg::Node(node) => self.evaluate(node).await,
                // Containers can only carry plain data.
                Arg::List(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.eval_arg(item).await?.into_json()?);
                    }
                    Ok(Value::Data(Json::Array(out)))
                }
                Arg::Map(entries) => {
                    let mut out = serde_json::Map::new();
                    for (key, item) in entries {
                        out.insert(key.clone(), self.eval_arg(item).await?.into_json()?);
                    }
                    Ok(Value::Data(Json::Object(out)))
                }
            }
        }
        .boxed()
    }

    async fn relay(&self, tag: &AddressTag, node: &AstNode) -> Result<Value> {
        debug!(to = %tag, chain = %node, "relaying");
        if node.operation == Some(Operation::IterStart) {
            let iter = RemoteIter::new(self.engine.clone(), Some(tag.clone()), node.clone());
            return Ok(Value::Stream(Generator::new(iter.into_values())));
        }
        let route = self.engine.route(Some(tag))?;
        let (_, value) = self.engine.request(route, node.clone()).await?;
        Ok(Value::Data(value))
    }
}
