//! Tests for node encoding and frame parsing.

use std::collections::BTreeMap;

use serde_json::json;

use crate::codec;
use crate::AddressTag;
use crate::Arg;
use crate::AstNode;
use crate::ErrorCode;
use crate::Message;
use crate::ProtocolError;
use crate::RpcError;
use crate::Target;

fn kwargs(entries: &[(&str, Arg)]) -> BTreeMap<String, Arg> {
    entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// `Number(1, b=Ping("x")).add([Ping("y"), 2], {"k": Ping("z")})`
fn nested_chain() -> AstNode {
    let ping = |s: &str| AstNode::leaf("ping").call(vec![Arg::from(s)], BTreeMap::new());

    AstNode::rooted(Target::Address(AddressTag::Server), "Number")
        .call(vec![Arg::from(1)], kwargs(&[("b", Arg::Node(ping("x")))]))
        .get_attr("add")
        .call(
            vec![
                Arg::list(vec![Arg::Node(ping("y")), Arg::from(2)]),
                Arg::map(kwargs(&[("k", Arg::Node(ping("z")))])),
            ],
            BTreeMap::new(),
        )
}

#[test]
fn test_roundtrip_nested_nodes() {
    let node = nested_chain();
    let decoded = codec::decode(&codec::encode(&node).unwrap()).unwrap();
    assert_eq!(decoded, node);
}

#[test]
fn test_roundtrip_through_frame() {
    let node = nested_chain();
    let bytes = Message::request("req-1", node.clone()).to_vec().unwrap();

    let Message::Request(req) = Message::from_slice(&bytes).unwrap() else {
        panic!("expected a request");
    };
    assert_eq!(req.id, "req-1");
    assert_eq!(req.method, node);
}

#[test]
fn test_literal_containers_stay_literal() {
    let node = AstNode::leaf("f").call(vec![Arg::from(vec![1, 2, 3])], kwargs(&[("c", Arg::from(json!({"c": 3})))]));
    assert_eq!(node.args[0], Arg::Literal(json!([1, 2, 3])));

    let decoded = codec::decode(&codec::encode(&node).unwrap()).unwrap();
    assert_eq!(decoded, node);
}

#[test]
fn test_chain_nests_innermost_first() {
    let node = AstNode::leaf("a").get_attr("b").call(vec![Arg::from("c")], BTreeMap::new()).get_attr("d");
    let encoded = codec::encode(&node).unwrap();

    assert_eq!(encoded["args"], json!(["d"]));
    assert_eq!(encoded["obj"]["method"], json!("__call__"));
    assert_eq!(encoded["obj"]["obj"]["args"], json!(["b"]));
    assert_eq!(encoded["obj"]["obj"]["obj"]["args"], json!(["a"]));
    assert_eq!(encoded["obj"]["obj"]["obj"]["obj"], json!(null));
    assert_eq!(node.depth(), 4);
    assert_eq!(node.root().leaf_name(), Some("a"));
}

#[test]
fn test_registration_detection() {
    let reg = AstNode::leaf(crate::REGISTER_ENTRY).call(vec![Arg::from("alice"), Arg::from("secret")], BTreeMap::new());
    assert!(reg.is_registration());

    let via_server = AstNode::rooted(Target::Address(AddressTag::Server), crate::REGISTER_ENTRY)
        .call(vec![Arg::from("alice"), Arg::from("secret")], BTreeMap::new());
    assert!(via_server.is_registration());

    let via_peer = AstNode::rooted(Target::Address(AddressTag::client("bob")), crate::REGISTER_ENTRY)
        .call(vec![Arg::from("alice")], BTreeMap::new());
    assert!(!via_peer.is_registration());

    let other = AstNode::leaf("ping").call(vec![Arg::from("x")], BTreeMap::new());
    assert!(!other.is_registration());
}

#[test]
fn test_display_chain() {
    let node = AstNode::rooted(Target::Address(AddressTag::Server), "add").call(vec![Arg::from(4), Arg::from(4)], BTreeMap::new());
    assert_eq!(node.to_string(), "@server.add(4, 4)");
    assert_eq!(AstNode::iter_next("tok").to_string(), "$tok.__anext__()");
}

#[test]
fn test_response_with_null_result() {
    let frame = json!({"jsonrpc": "jsonast", "id": "r1", "result": null});
    let msg = Message::from_value(frame).unwrap();
    assert_eq!(msg, Message::response("r1", json!(null)));
}

#[test]
fn test_error_response_roundtrip() {
    let msg = Message::error(Some("r2".into()), RpcError::new(ErrorCode::MethodNotFound, "nope"));
    let value = msg.to_value().unwrap();
    assert_eq!(value["error"], json!({"code": -32601, "message": "MethodNotFound", "data": "nope"}));
    assert_eq!(Message::from_value(value).unwrap(), msg);
}

#[test]
fn test_stop_iteration_has_no_message() {
    let value = Message::error(Some("r3".into()), RpcError::stop_iteration()).to_value().unwrap();
    assert_eq!(value["error"], json!({"code": -32099, "message": ""}));

    let Message::Response(resp) = Message::from_value(value).unwrap() else {
        panic!("expected a response");
    };
    assert!(resp.outcome.unwrap_err().is_stop_iteration());
}

#[test]
fn test_parse_error() {
    let err = Message::from_slice(b"{not json").unwrap_err();
    assert_eq!(err.code(), ErrorCode::ParseError);
    assert_eq!(err.request_id(), None);
}

#[test]
fn test_invalid_request_keeps_id() {
    let err = Message::from_value(json!({"jsonrpc": "jsonast", "id": "r4"})).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequest);
    assert_eq!(err.request_id(), Some("r4"));

    let err = Message::from_value(json!({"jsonrpc": "jsonast", "id": "r5", "method": {"obj": null}})).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidRequest);
    assert_eq!(err.request_id(), Some("r5"));
}

#[test]
fn test_wrong_protocol() {
    let err = Message::from_value(json!({"jsonrpc": "2.0", "id": 7, "result": 1})).unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidRequest { id: Some(ref id), .. } if id == "7"));
}
