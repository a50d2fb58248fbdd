//! # Node Codec
//!
//! Maps [`AstNode`] trees to and from their JSON form:
//!
//! ```json
//! { "obj": <target>, "method": "__call__", "args": [...], "kwargs": {...} }
//! ```
//!
//! Targets encode as `null`, a string, a nested node, or an address tag
//! (`["server", null]` / `["client", "<name>"]`).
//!
//! ## Invariants
//!
//! - **Structural recognition**: A JSON object is a node iff it has exactly the
//!   four keys `obj`, `method`, `args` and `kwargs`. This applies at any depth
//!   inside arguments, including inside arrays and objects.
//! - **Canonical arguments**: Arrays and objects without nested nodes decode to
//!   `Arg::Literal`, matching [`Arg::list`] and [`Arg::map`].
//! - **Bounded depth**: Nesting beyond [`MAX_DEPTH`] is rejected in both
//!   directions.

use std::collections::BTreeMap;

use serde_json::Map;
use serde_json::Value;

use crate::ast::AddressTag;
use crate::ast::Arg;
use crate::ast::AstNode;
use crate::ast::Operation;
use crate::ast::Target;
use crate::error::ProtocolError;
use crate::error::Result;

/// Maximum nesting of nodes and argument containers.
pub const MAX_DEPTH: usize = 128;

const KEY_TARGET: &str = "obj";
const KEY_OPERATION: &str = "method";
const KEY_ARGS: &str = "args";
const KEY_KWARGS: &str = "kwargs";

const TAG_SERVER: &str = "server";
const TAG_CLIENT: &str = "client";

/// True if `value` has exactly the shape of an encoded node.
pub fn is_node(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.len() == 4
                && map.contains_key(KEY_TARGET)
                && map.contains_key(KEY_OPERATION)
                && map.contains_key(KEY_ARGS)
                && map.contains_key(KEY_KWARGS)
        }
        _ => false,
    }
}

/// Encodes a node into its JSON form.
pub fn encode(node: &AstNode) -> Result<Value> {
    encode_node(node, 0)
}

/// Decodes a node from its JSON form.
pub fn decode(value: &Value) -> Result<AstNode> {
    decode_node(value, 0)
}

/// Encodes an address tag.
pub fn encode_address(tag: &AddressTag) -> Value {
    match tag {
        AddressTag::Server => Value::Array(vec![Value::from(TAG_SERVER), Value::Null]),
        AddressTag::Client(name) => Value::Array(vec![Value::from(TAG_CLIENT), Value::from(name.as_str())]),
    }
}

fn check_depth(depth: usize) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(ProtocolError::RecursionLimitExceeded(MAX_DEPTH));
    }
    Ok(())
}

fn encode_node(node: &AstNode, depth: usize) -> Result<Value> {
    check_depth(depth)?;

    let target = match &node.target {
        Target::Null => Value::Null,
        Target::Name(name) => Value::String(name.clone()),
        Target::Node(inner) => encode_node(inner, depth + 1)?,
        Target::Address(tag) => encode_address(tag),
    };

    let operation = match node.operation {
        Some(op) => Value::from(op.wire_name()),
        None => Value::Null,
    };

    let args = node
        .args
        .iter()
        .map(|arg| encode_arg(arg, depth + 1))
        .collect::<Result<Vec<_>>>()?;

    let mut kwargs = Map::new();
    for (key, arg) in &node.kwargs {
        kwargs.insert(key.clone(), encode_arg(arg, depth + 1)?);
    }

    let mut map = Map::new();
    map.insert(KEY_TARGET.into(), target);
    map.insert(KEY_OPERATION.into(), operation);
    map.insert(KEY_ARGS.into(), Value::Array(args));
    map.insert(KEY_KWARGS.into(), Value::Object(kwargs));
    Ok(Value::Object(map))
}

fn encode_arg(arg: &Arg, depth: usize) -> Result<Value> {
    check_depth(depth)?;
    match arg {
        Arg::Literal(v) => Ok(v.clone()),
        Arg::Node(node) => encode_node(node, depth),
        Arg::List(items) => items
            .iter()
            .map(|item| encode_arg(item, depth + 1))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Arg::Map(entries) => {
            let mut map = Map::new();
            for (key, item) in entries {
                map.insert(key.clone(), encode_arg(item, depth + 1)?);
            }
            Ok(Value::Object(map))
        }
    }
}

fn decode_node(value: &Value, depth: usize) -> Result<AstNode> {
    check_depth(depth)?;

    let Value::Object(map) = value else {
        return Err(ProtocolError::invalid("node must be an object"));
    };
    if !is_node(value) {
        return Err(ProtocolError::invalid("node must have exactly the keys obj, method, args, kwargs"));
    }

    let target = decode_target(&map[KEY_TARGET], depth)?;

    let operation = match &map[KEY_OPERATION] {
        Value::Null => None,
        Value::String(name) => match Operation::from_wire(name) {
            Some(op) => Some(op),
            None => return Err(ProtocolError::UnknownOperation { id: None, name: name.clone() }),
        },
        _ => return Err(ProtocolError::invalid("method must be a string or null")),
    };

    // Older peers send `null` for empty argument lists.
    let args = match &map[KEY_ARGS] {
        Value::Null => Vec::new(),
        Value::Array(items) => items
            .iter()
            .map(|item| decode_arg(item, depth + 1))
            .collect::<Result<Vec<_>>>()?,
        _ => return Err(ProtocolError::invalid("args must be an array")),
    };

    let kwargs = match &map[KEY_KWARGS] {
        Value::Null => BTreeMap::new(),
        Value::Object(entries) => {
            let mut kwargs = BTreeMap::new();
            for (key, item) in entries {
                kwargs.insert(key.clone(), decode_arg(item, depth + 1)?);
            }
            kwargs
        }
        _ => return Err(ProtocolError::invalid("kwargs must be an object")),
    };

    Ok(AstNode::new(target, operation, args, kwargs))
}

fn decode_target(value: &Value, depth: usize) -> Result<Target> {
    match value {
        Value::Null => Ok(Target::Null),
        Value::String(name) => Ok(Target::Name(name.clone())),
        Value::Array(items) => decode_address(items).map(Target::Address),
        Value::Object(_) => Ok(Target::Node(Box::new(decode_node(value, depth + 1)?))),
        _ => Err(ProtocolError::invalid("obj must be null, a string, a node or an address tag")),
    }
}

fn decode_address(items: &[Value]) -> Result<AddressTag> {
    match items {
        [Value::String(side), Value::Null] if side == TAG_SERVER => Ok(AddressTag::Server),
        [Value::String(side), Value::String(name)] if side == TAG_CLIENT => Ok(AddressTag::Client(name.clone())),
        _ => Err(ProtocolError::invalid("address tag must be [\"server\", null] or [\"client\", <name>]")),
    }
}

fn decode_arg(value: &Value, depth: usize) -> Result<Arg> {
    check_depth(depth)?;

    if is_node(value) {
        return decode_node(value, depth).map(Arg::Node);
    }

    match value {
        Value::Array(items) => {
            let items = items
                .iter()
                .map(|item| decode_arg(item, depth + 1))
                .collect::<Result<Vec<_>>>()?;
            Ok(Arg::list(items))
        }
        Value::Object(entries) => {
            let mut map = BTreeMap::new();
            for (key, item) in entries {
                map.insert(key.clone(), decode_arg(item, depth + 1)?);
            }
            Ok(Arg::map(map))
        }
        other => Ok(Arg::Literal(other.clone())),
    }
}
