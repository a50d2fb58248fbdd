//! # Call-Chain AST
//!
//! A remote call expression such as `server.Number().add(4).value` is carried
//! over the wire as a tree of [`AstNode`]s, innermost step first.
//!
//! ## Invariants
//!
//! - **Leaf roots**: A chain is rooted by a leaf whose target is `Null` or an
//!   [`AddressTag`], whose operation is `GetAttr`, and whose single positional
//!   argument is the namespace key to resolve.
//! - **Nesting only through `target`**: `a.b(c).d` is
//!   `GetAttr(Call(GetAttr(leaf(a), "b"), [c]), "d")`.
//! - **Owned trees**: Nodes own their children, so a chain can never refer back
//!   to itself. Depth is bounded by the codec instead.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

/// The namespace key of the registration callable installed on every inbound
/// server connection.
pub const REGISTER_ENTRY: &str = "rpc_auto_register";

/// Marks whose namespace a chain resolves against.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AddressTag {
    /// The server-side namespace.
    Server,
    /// The namespace of the client registered under this name.
    Client(String),
}

impl AddressTag {
    pub fn client(name: impl Into<String>) -> Self {
        Self::Client(name.into())
    }

    /// The addressed peer name, if this tag names a client.
    pub fn peer_name(&self) -> Option<&str> {
        match self {
            Self::Server => None,
            Self::Client(name) => Some(name),
        }
    }
}

impl fmt::Display for AddressTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "@server"),
            Self::Client(name) => write!(f, "@{}", name),
        }
    }
}

/// What a node operates on.
#[derive(Clone, Debug, PartialEq)]
pub enum Target {
    /// Root of a local/loopback chain.
    Null,
    /// A namespace key resolved directly, without relay. Continuation tokens
    /// travel this way.
    Name(String),
    /// The result of evaluating another node.
    Node(Box<AstNode>),
    /// Root of an addressed chain.
    Address(AddressTag),
}

/// The step a node performs on its receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    GetAttr,
    Call,
    IterStart,
    IterNext,
}

impl Operation {
    /// The name used on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::GetAttr => "__getattr__",
            Self::Call => "__call__",
            Self::IterStart => "__aiter__",
            Self::IterNext => "__anext__",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "__getattr__" => Some(Self::GetAttr),
            "__call__" => Some(Self::Call),
            "__aiter__" => Some(Self::IterStart),
            "__anext__" => Some(Self::IterNext),
            _ => None,
        }
    }
}

/// A positional or keyword argument: a literal, or a tree that may contain
/// nested nodes at any depth.
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Literal(Value),
    Node(AstNode),
    List(Vec<Arg>),
    Map(BTreeMap<String, Arg>),
}

impl Arg {
    /// The literal string, if this argument is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Literal(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    /// A sequence argument. Collapses to a literal array when no node is
    /// nested inside, which is the form the codec decodes to.
    pub fn list(items: Vec<Arg>) -> Self {
        if items.iter().any(Arg::contains_node) {
            return Self::List(items);
        }
        Self::Literal(Value::Array(items.into_iter().filter_map(Arg::into_literal).collect()))
    }

    /// A mapping argument, collapsed like [`Arg::list`].
    pub fn map(entries: BTreeMap<String, Arg>) -> Self {
        if entries.values().any(Arg::contains_node) {
            return Self::Map(entries);
        }
        let object = entries
            .into_iter()
            .filter_map(|(k, v)| v.into_literal().map(|v| (k, v)))
            .collect();
        Self::Literal(Value::Object(object))
    }

    /// The plain JSON form of a node-free argument.
    pub fn into_literal(self) -> Option<Value> {
        match self {
            Self::Literal(v) => Some(v),
            Self::Node(_) => None,
            Self::List(items) => items
                .into_iter()
                .map(Arg::into_literal)
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            Self::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| v.into_literal().map(|v| (k, v)))
                .collect::<Option<serde_json::Map<_, _>>>()
                .map(Value::Object),
        }
    }

    /// True if a node appears anywhere inside this argument.
    pub fn contains_node(&self) -> bool {
        match self {
            Self::Literal(_) => false,
            Self::Node(_) => true,
            Self::List(items) => items.iter().any(Arg::contains_node),
            Self::Map(entries) => entries.values().any(Arg::contains_node),
        }
    }
}

impl From<Value> for Arg {
    fn from(v: Value) -> Self {
        Self::Literal(v)
    }
}

impl From<AstNode> for Arg {
    fn from(node: AstNode) -> Self {
        Self::Node(node)
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Self::Literal(Value::String(s.to_string()))
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Self::Literal(Value::String(s))
    }
}

impl From<i64> for Arg {
    fn from(n: i64) -> Self {
        Self::Literal(Value::from(n))
    }
}

impl From<i32> for Arg {
    fn from(n: i32) -> Self {
        Self::Literal(Value::from(n))
    }
}

impl From<u64> for Arg {
    fn from(n: u64) -> Self {
        Self::Literal(Value::from(n))
    }
}

impl From<f64> for Arg {
    fn from(n: f64) -> Self {
        Self::Literal(Value::from(n))
    }
}

impl From<bool> for Arg {
    fn from(b: bool) -> Self {
        Self::Literal(Value::Bool(b))
    }
}

impl<T: Into<Arg>> From<Vec<T>> for Arg {
    fn from(items: Vec<T>) -> Self {
        Self::list(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Arg>> From<Option<T>> for Arg {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Self::Literal(Value::Null))
    }
}

/// One step of a call chain.
#[derive(Clone, Debug, PartialEq)]
pub struct AstNode {
    pub target: Target,
    /// `None` means "resolve only".
    pub operation: Option<Operation>,
    pub args: Vec<Arg>,
    pub kwargs: BTreeMap<String, Arg>,
}

impl AstNode {
    pub fn new(
        target: Target,
        operation: Option<Operation>,
        args: Vec<Arg>,
        kwargs: BTreeMap<String, Arg>,
    ) -> Self {
        Self { target, operation, args, kwargs }
    }

    /// A leaf resolving `name` against the evaluating side's namespace.
    pub fn leaf(name: impl Into<String>) -> Self {
        Self::rooted(Target::Null, name)
    }

    /// A leaf resolving `name` with an explicit root (`Null` or an address).
    pub fn rooted(root: Target, name: impl Into<String>) -> Self {
        Self::new(root, Some(Operation::GetAttr), vec![Arg::from(name.into())], BTreeMap::new())
    }

    /// Wraps this node in an attribute access.
    pub fn get_attr(self, name: impl Into<String>) -> Self {
        Self::new(
            Target::Node(Box::new(self)),
            Some(Operation::GetAttr),
            vec![Arg::from(name.into())],
            BTreeMap::new(),
        )
    }

    /// Wraps this node in an invocation.
    pub fn call(self, args: Vec<Arg>, kwargs: BTreeMap<String, Arg>) -> Self {
        Self::new(Target::Node(Box::new(self)), Some(Operation::Call), args, kwargs)
    }

    /// Wraps this node in an iteration start.
    pub fn iter_start(self) -> Self {
        Self::new(Target::Node(Box::new(self)), Some(Operation::IterStart), Vec::new(), BTreeMap::new())
    }

    /// Advances the stored iterator behind a continuation token.
    pub fn iter_next(token: impl Into<String>) -> Self {
        Self::new(Target::Name(token.into()), Some(Operation::IterNext), Vec::new(), BTreeMap::new())
    }

    /// The key this node resolves if it is a root leaf.
    pub fn leaf_name(&self) -> Option<&str> {
        if !matches!(self.target, Target::Null | Target::Address(_)) {
            return None;
        }
        if self.operation != Some(Operation::GetAttr) || self.args.len() != 1 || !self.kwargs.is_empty() {
            return None;
        }
        self.args[0].as_str()
    }

    /// The innermost node of the chain.
    pub fn root(&self) -> &AstNode {
        let mut node = self;
        while let Target::Node(inner) = &node.target {
            node = inner;
        }
        node
    }

    /// The address tag the chain is rooted at, if any.
    pub fn root_address(&self) -> Option<&AddressTag> {
        match &self.root().target {
            Target::Address(tag) => Some(tag),
            _ => None,
        }
    }

    /// True for `rpc_auto_register(...)` rooted locally or at the server.
    pub fn is_registration(&self) -> bool {
        if self.operation != Some(Operation::Call) {
            return false;
        }
        let Target::Node(inner) = &self.target else { return false };
        let rooted_here = matches!(inner.target, Target::Null | Target::Address(AddressTag::Server));
        rooted_here && inner.leaf_name() == Some(REGISTER_ENTRY)
    }

    /// Number of nodes along the `target` spine.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut node = self;
        while let Target::Node(inner) = &node.target {
            depth += 1;
            node = inner;
        }
        depth
    }
}

impl fmt::Display for AstNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.leaf_name() {
            return match &self.target {
                Target::Address(tag) => write!(f, "{}.{}", tag, name),
                _ => write!(f, "{}", name),
            };
        }

        match &self.target {
            Target::Null => write!(f, "<null>")?,
            Target::Name(token) => write!(f, "${}", token)?,
            Target::Node(inner) => write!(f, "{}", inner)?,
            Target::Address(tag) => write!(f, "{}", tag)?,
        }

        match self.operation {
            None => Ok(()),
            Some(Operation::GetAttr) => match self.args.first().and_then(Arg::as_str) {
                Some(name) => write!(f, ".{}", name),
                None => write!(f, ".<getattr>"),
            },
            Some(Operation::Call) => {
                write!(f, "(")?;
                let mut first = true;
                for arg in &self.args {
                    if !first {
                        write!(f, ", ")?;
                    }
                    first = false;
                    fmt_arg(f, arg)?;
                }
                for (key, arg) in &self.kwargs {
                    if !first {
                        write!(f, ", ")?;
                    }
                    first = false;
                    write!(f, "{}=", key)?;
                    fmt_arg(f, arg)?;
                }
                write!(f, ")")
            }
            Some(Operation::IterStart) => write!(f, ".__aiter__()"),
            Some(Operation::IterNext) => write!(f, ".__anext__()"),
        }
    }
}

fn fmt_arg(f: &mut fmt::Formatter<'_>, arg: &Arg) -> fmt::Result {
    match arg {
        Arg::Literal(v) => write!(f, "{}", v),
        Arg::Node(node) => write!(f, "{}", node),
        Arg::List(items) => {
            write!(f, "[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                fmt_arg(f, item)?;
            }
            write!(f, "]")
        }
        Arg::Map(entries) => {
            write!(f, "{{")?;
            for (i, (key, item)) in entries.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{:?}: ", key)?;
                fmt_arg(f, item)?;
            }
            write!(f, "}}")
        }
    }
}
