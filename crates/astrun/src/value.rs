//! # Runtime Values
//!
//! What a namespace key resolves to and what evaluating a node produces.
//!
//! - [`Value::Data`]: plain JSON, returned to callers as-is.
//! - [`Value::Object`]: a live host object (function, class instance, ...)
//!   reachable through [`Object`].
//! - [`Value::Stream`]: a live async iterator.
//!
//! Only `Data` crosses the wire. Live values stay in the namespace of the side
//! that produced them and are referred to by key.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::Stream;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value as Json;

use crate::error::Error;
use crate::error::Result;

/// A host object the evaluator can operate on.
///
/// Every method has a default that fails the way a missing capability should,
/// so implementors only write what they support.
pub trait Object: Send + Sync + 'static {
    /// Used in error messages.
    fn type_name(&self) -> &str;

    /// What a caller sees when this object is a call's final result.
    fn describe(&self) -> String {
        format!("<{} object>", self.type_name())
    }

    fn get_attr(self: Arc<Self>, name: &str) -> Result<Value> {
        Err(Error::Attribute {
            type_name: self.type_name().to_string(),
            name: name.to_string(),
        })
    }

    fn call(self: Arc<Self>, args: Args) -> Result<Outcome> {
        let _ = args;
        Err(Error::NotCallable(self.type_name().to_string()))
    }

    fn iterate(self: Arc<Self>) -> Result<Generator> {
        Err(Error::NotIterable(self.type_name().to_string()))
    }
}

/// What invoking a callable produced.
pub enum Outcome {
    Value(Value),
    /// Awaited by the evaluator before the call completes.
    Awaitable(BoxFuture<'static, Result<Value>>),
    /// Kept live; the caller gets a continuation token for it.
    AsyncIterable(Generator),
}

impl Outcome {
    /// Awaits an awaitable and wraps an iterable, leaving a concrete value.
    pub async fn resolve(self) -> Result<Value> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Awaitable(fut) => fut.await,
            Self::AsyncIterable(generator) => Ok(Value::Stream(generator)),
        }
    }
}

impl From<Value> for Outcome {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

/// A live async iterator shared between the namespace and whoever advances it.
#[derive(Clone)]
pub struct Generator {
    stream: Arc<tokio::sync::Mutex<BoxStream<'static, Result<Value>>>>,
}

impl Generator {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        Self {
            stream: Arc::new(tokio::sync::Mutex::new(stream.boxed())),
        }
    }

    /// Pulls the next item. An ended stream yields [`Error::Exhausted`], and
    /// keeps yielding it.
    pub async fn advance(&self) -> Result<Value> {
        let mut stream = self.stream.lock().await;
        match stream.next().await {
            Some(item) => item,
            None => Err(Error::Exhausted),
        }
    }
}

#[derive(Clone)]
pub enum Value {
    Data(Json),
    Object(Arc<dyn Object>),
    Stream(Generator),
}

impl Value {
    pub fn null() -> Self {
        Self::Data(Json::Null)
    }

    /// Wraps a host object.
    pub fn object<O: Object>(object: O) -> Self {
        Self::Object(Arc::new(object))
    }

    /// A synchronous callable.
    pub fn function<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Args) -> Result<Value> + Send + Sync + 'static,
    {
        Self::object(Function {
            name: name.into(),
            body: Box::new(move |args| f(args).map(Outcome::Value)),
        })
    }

    /// A callable whose result is awaited before the call completes.
    pub fn async_function<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::object(Function {
            name: name.into(),
            body: Box::new(move |args| Ok(Outcome::Awaitable(f(args).boxed()))),
        })
    }

    /// A callable returning an async iterator.
    pub fn generator<F, S>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Args) -> Result<S> + Send + Sync + 'static,
        S: Stream<Item = Result<Value>> + Send + 'static,
    {
        Self::object(Function {
            name: name.into(),
            body: Box::new(move |args| f(args).map(|s| Outcome::AsyncIterable(Generator::new(s)))),
        })
    }

    pub fn type_name(&self) -> String {
        match self {
            Self::Data(Json::Null) => "NoneType".to_string(),
            Self::Data(Json::Bool(_)) => "bool".to_string(),
            Self::Data(Json::Number(n)) if n.is_f64() => "float".to_string(),
            Self::Data(Json::Number(_)) => "int".to_string(),
            Self::Data(Json::String(_)) => "str".to_string(),
            Self::Data(Json::Array(_)) => "list".to_string(),
            Self::Data(Json::Object(_)) => "dict".to_string(),
            Self::Object(o) => o.type_name().to_string(),
            Self::Stream(_) => "async_generator".to_string(),
        }
    }

    pub fn as_json(&self) -> Option<&Json> {
        match self {
            Self::Data(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_json().and_then(Json::as_str)
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_json().and_then(Json::as_i64)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_json().and_then(Json::as_f64)
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.as_json().and_then(Json::as_bool)
    }

    /// The plain JSON form, failing for live values.
    pub fn into_json(self) -> Result<Json> {
        match self {
            Self::Data(v) => Ok(v),
            other => Err(Error::InvalidParams(format!(
                "'{}' object cannot be passed by value",
                other.type_name()
            ))),
        }
    }

    /// The JSON a caller receives when this is a call's final result. Live
    /// values become their description string.
    pub fn describe(&self) -> Json {
        match self {
            Self::Data(v) => v.clone(),
            Self::Object(o) => Json::String(o.describe()),
            Self::Stream(_) => Json::String("<async_generator object>".to_string()),
        }
    }

    /// True if this value must be kept live to be useful later.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Data(_))
    }

    pub fn get_attr(&self, name: &str) -> Result<Value> {
        match self {
            Self::Object(o) => o.clone().get_attr(name),
            Self::Data(Json::Object(map)) if map.contains_key(name) => Ok(Self::Data(map[name].clone())),
            other => Err(Error::Attribute {
                type_name: other.type_name(),
                name: name.to_string(),
            }),
        }
    }

    pub fn call(&self, args: Args) -> Result<Outcome> {
        match self {
            Self::Object(o) => o.clone().call(args),
            other => Err(Error::NotCallable(other.type_name())),
        }
    }

    /// An async iterator over this value. Arrays iterate their elements.
    pub fn iterate(&self) -> Result<Generator> {
        match self {
            Self::Stream(generator) => Ok(generator.clone()),
            Self::Object(o) => o.clone().iterate(),
            Self::Data(Json::Array(items)) => {
                let items: Vec<Result<Value>> = items.iter().cloned().map(|v| Ok(Self::Data(v))).collect();
                Ok(Generator::new(futures::stream::iter(items)))
            }
            other => Err(Error::NotIterable(other.type_name())),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(v) => write!(f, "Data({})", v),
            Self::Object(o) => write!(f, "Object({})", o.describe()),
            Self::Stream(_) => write!(f, "Stream"),
        }
    }
}

impl From<Json> for Value {
    fn from(v: Json) -> Self {
        Self::Data(v)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Data(Json::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Data(Json::from(s))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Data(Json::from(n))
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Data(Json::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Data(Json::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Data(Json::from(b))
    }
}

type Body = dyn Fn(Args) -> Result<Outcome> + Send + Sync;

/// A named callable built from a closure.
struct Function {
    name: String,
    body: Box<Body>,
}

impl Object for Function {
    fn type_name(&self) -> &str {
        "function"
    }

    fn describe(&self) -> String {
        format!("<function {}>", self.name)
    }

    fn call(self: Arc<Self>, args: Args) -> Result<Outcome> {
        (self.body)(args)
    }
}

/// Evaluated call arguments.
#[derive(Clone, Debug, Default)]
pub struct Args {
    positional: Vec<Value>,
    keyword: BTreeMap<String, Value>,
}

impl Args {
    pub fn new(positional: Vec<Value>, keyword: BTreeMap<String, Value>) -> Self {
        Self { positional, keyword }
    }

    pub fn positional(values: impl IntoIterator<Item = Value>) -> Self {
        Self::new(values.into_iter().collect(), BTreeMap::new())
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.keyword.get(name)
    }

    pub fn keywords(&self) -> &BTreeMap<String, Value> {
        &self.keyword
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.positional.iter()
    }

    /// The argument at `index`, or passed by keyword as `name`.
    pub fn opt(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional.get(index).or_else(|| self.keyword.get(name))
    }

    pub fn arg(&self, index: usize, name: &str) -> Result<&Value> {
        self.opt(index, name)
            .ok_or_else(|| Error::InvalidParams(format!("missing required argument '{}'", name)))
    }

    pub fn str(&self, index: usize, name: &str) -> Result<&str> {
        let value = self.arg(index, name)?;
        value.as_str().ok_or_else(|| mismatch(name, "str", value))
    }

    pub fn i64(&self, index: usize, name: &str) -> Result<i64> {
        let value = self.arg(index, name)?;
        value.as_i64().ok_or_else(|| mismatch(name, "int", value))
    }

    pub fn f64(&self, index: usize, name: &str) -> Result<f64> {
        let value = self.arg(index, name)?;
        value.as_f64().ok_or_else(|| mismatch(name, "float", value))
    }

    pub fn json(&self, index: usize, name: &str) -> Result<Json> {
        self.arg(index, name)?.clone().into_json()
    }

    /// Fails if any keyword was passed.
    pub fn no_keywords(&self) -> Result<()> {
        match self.keyword.keys().next() {
            Some(key) => Err(Error::InvalidParams(format!("unexpected keyword argument '{}'", key))),
            None => Ok(()),
        }
    }
}

fn mismatch(name: &str, expected: &str, got: &Value) -> Error {
    Error::InvalidParams(format!("argument '{}' must be {}, not {}", name, expected, got.type_name()))
}
