//! End-to-end tests: a hub and clients over in-memory connections.

mod common;

use std::time::Duration;

use astrun::Config;
use astrun::Error;
use astrun::ErrorCode;
use astrun::args;
use astrun::kwargs;
use futures::StreamExt;
use serde_json::json;

use common::eventually;
use common::start_client;
use common::start_hub;

/// Basic call and leaf resolution from a client
#[tokio::test]
async fn test_client_calls_server() {
    let (_hub, connector) = start_hub(Config::new("hub"));
    let client = start_client(&connector, Config::new("alice")).await;
    let server = client.server();

    assert_eq!(server.attr("add").call(args![4, 4]).await.expect("add"), json!(8));

    let value = server.attr("value");
    assert_eq!(value.clone().await.expect("first read"), json!(42));
    assert_eq!(value.await.expect("second read"), json!(42));
}

/// Connecting hands back the hub's name
#[tokio::test]
async fn test_registration_returns_server_name() {
    let (hub, connector) = start_hub(Config::new("hub"));
    let client = astrun::Engine::new(Config::new("alice"));
    let server_name = client.connect(&connector).await.expect("connect");

    assert_eq!(server_name, "hub");
    assert!(hub.registry().lookup_name("alice").is_some());
}

/// A nested call is evaluated on the server in one round trip
#[tokio::test]
async fn test_nested_calls() {
    let (_hub, connector) = start_hub(Config::new("hub"));
    let client = start_client(&connector, Config::new("alice")).await;
    let server = client.server();

    let inner = server.attr("ping").call(args!["hello"]);
    let result = server.attr("ping").call(args![inner]).await.expect("nested ping");
    assert_eq!(result, json!("pong pong hello"));

    let result = server
        .attr("sub")
        .call_kw(args![server.attr("add").call(args![10, 5])], kwargs! {"b" => server.attr("value")})
        .await
        .expect("sub");
    assert_eq!(result, json!(-27));
}

/// Async iteration yields every item, then ends
#[tokio::test]
async fn test_remote_generator() {
    let (hub, connector) = start_hub(Config::new("hub"));
    let client = start_client(&connector, Config::new("alice")).await;

    let items: Vec<_> = client
        .server()
        .attr("async_generator")
        .call(args![5])
        .iter()
        .map(|item| item.expect("item"))
        .collect()
        .await;
    assert_eq!(items, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);

    // The iterator stays stored under its token until disconnect.
    let conn = hub.registry().lookup_name("alice").expect("registered");
    assert!(hub.namespace().local_count(conn) >= 2);
}

/// Chaining on a stored remote object
#[tokio::test]
async fn test_remote_object_chaining() {
    let (_hub, connector) = start_hub(Config::new("hub"));
    let client = start_client(&connector, Config::new("alice")).await;

    let reply = client.server().attr("Number").call(args![1]).raw().await.expect("construct");
    assert_eq!(reply.value(), &json!("<Number object>"));

    let number = reply.proxy();
    number.attr("add").call(args![10]).raw().await.expect("add");
    let value = number.attr("value").await.expect("value");
    assert_eq!(value, json!(11));
}

/// A chain addressed to another client is relayed through the hub
#[tokio::test]
async fn test_relay_to_peer() {
    let (_hub, connector) = start_hub(Config::new("hub"));
    let peer_a = start_client(&connector, Config::new("peerA")).await;
    let _peer_b = start_client(&connector, Config::new("peerB")).await;

    let peer = peer_a.peer("peerB");
    assert_eq!(peer.attr("whoami").call(args![]).await.expect("whoami"), json!("peerB"));
    assert_eq!(peer.attr("add").call(args![1, 2]).await.expect("add"), json!(3));

    let items: Vec<_> = peer
        .attr("async_generator")
        .call(args![3])
        .iter()
        .map(|item| item.expect("item"))
        .collect()
        .await;
    assert_eq!(items, vec![json!(0), json!(1), json!(2)]);
}

/// Arguments can be evaluated on a different endpoint than the call
#[tokio::test]
async fn test_mixed_endpoints_in_one_chain() {
    let (_hub, connector) = start_hub(Config::new("hub"));
    let peer_a = start_client(&connector, Config::new("peerA")).await;
    let _peer_b = start_client(&connector, Config::new("peerB")).await;

    let from_b = peer_a.peer("peerB").attr("whoami").call(args![]);
    let result = peer_a.server().attr("ping").call(args![from_b]).await.expect("ping");
    assert_eq!(result, json!("pong peerB"));
}

/// A server function calls back into its caller
#[tokio::test]
async fn test_reverse_call() {
    let (_hub, connector) = start_hub(Config::new("hub"));
    let client = start_client(&connector, Config::new("alice")).await;

    let result = client.server().attr("reverse_call").call(args!["back"]).await.expect("reverse call");
    assert_eq!(result, json!("pong back"));
}

/// The hub calls a client directly
#[tokio::test]
async fn test_server_calls_client() {
    let (hub, connector) = start_hub(Config::new("hub"));
    let _client = start_client(&connector, Config::new("alice")).await;

    let result = hub.peer("alice").attr("whoami").call(args![]).await.expect("whoami");
    assert_eq!(result, json!("alice"));
}

/// Errors come back with their codes
#[tokio::test]
async fn test_remote_errors() {
    let (_hub, connector) = start_hub(Config::new("hub"));
    let client = start_client(&connector, Config::new("alice")).await;

    let err = client.server().attr("missing").await.expect_err("missing name");
    let Error::Remote(rpc) = err else { panic!("expected a remote error") };
    assert_eq!(rpc.kind(), Some(ErrorCode::MethodNotFound));

    let err = client.server().attr("add").call(args!["x", 1]).await.expect_err("bad params");
    assert_eq!(err.code(), ErrorCode::InvalidParams);

    let err = client.peer("ghost").attr("value").await.expect_err("unknown peer");
    assert_eq!(err.code(), ErrorCode::MethodNotFound);
}

/// Requests run concurrently once a connection is ready
#[tokio::test]
async fn test_concurrent_requests() {
    let (_hub, connector) = start_hub(Config::new("hub"));
    let client = start_client(&connector, Config::new("alice")).await;
    let server = client.server();

    let calls = (0..16).map(|i| server.attr("add").call(args![i, i]).into_future());
    let results = futures::future::join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.expect("add"), json!(i * 2));
    }
}

/// Disconnect drops the client's locals and name
#[tokio::test]
async fn test_disconnect_cleanup() {
    let (hub, connector) = start_hub(Config::new("hub"));
    let client = start_client(&connector, Config::new("alice")).await;

    client.server().attr("Number").call(args![]).raw().await.expect("construct");
    let conn = hub.registry().lookup_name("alice").expect("registered");
    assert!(hub.namespace().local_count(conn) >= 2);

    client.close().await;
    assert!(eventually(|| hub.registry().lookup_name("alice").is_none()).await);
    assert_eq!(hub.namespace().local_count(conn), 0);
    assert!(hub.registry().is_empty());
}

/// Waiters on a connection fail when it goes away
#[tokio::test]
async fn test_pending_call_fails_on_disconnect() {
    let (hub, connector) = start_hub(Config::new("hub"));
    let client = start_client(&connector, Config::new("alice")).await;

    let call = tokio::spawn(client.server().attr("hang").call(args![]).into_future());
    assert!(eventually(|| !client.correlation().is_empty()).await);

    hub.close().await;
    let result = tokio::time::timeout(Duration::from_secs(1), call)
        .await
        .expect("call should finish")
        .expect("task");
    assert!(matches!(result, Err(Error::ConnectionClosed)));
}

/// Calls give up after the configured timeout
#[tokio::test]
async fn test_call_timeout() {
    let (_hub, connector) = start_hub(Config::new("hub"));
    let config = Config::new("alice").with_call_timeout(Duration::from_millis(50));
    let client = start_client(&connector, config).await;

    let err = client.server().attr("hang").call(args![]).await.expect_err("should time out");
    assert!(matches!(err, Error::Timeout));
    assert!(client.correlation().is_empty());
}

/// Idle stored results are swept
#[tokio::test]
async fn test_idle_results_are_swept() {
    let config = Config::new("hub")
        .with_local_idle_ttl(Duration::from_millis(20))
        .with_sweep_interval(Duration::from_millis(10));
    let (hub, connector) = start_hub(config);
    let client = start_client(&connector, Config::new("alice")).await;

    client.server().attr("Number").call(args![]).raw().await.expect("construct");
    let conn = hub.registry().lookup_name("alice").expect("registered");

    // Only the pinned registration entry survives.
    assert!(eventually(|| hub.namespace().local_count(conn) == 1).await);
}

/// A panic in a host function is answered like any other failure
#[tokio::test]
async fn test_panic_is_answered_as_internal_error() {
    let (_hub, connector) = start_hub(Config::new("hub"));
    let client = start_client(&connector, Config::new("alice")).await;
    let server = client.server();

    let result = tokio::time::timeout(Duration::from_secs(1), server.attr("boom").call(args![]).into_future())
        .await
        .expect("a panicking call should still be answered");
    assert_eq!(result.expect_err("should fail").code(), ErrorCode::InternalError);

    // The connection keeps working.
    assert_eq!(server.attr("add").call(args![1, 1]).await.expect("add"), json!(2));
}

/// Giving up on a call removes its waiter
#[tokio::test]
async fn test_abandoned_call_leaves_no_waiter() {
    let (_hub, connector) = start_hub(Config::new("hub"));
    let client = start_client(&connector, Config::new("alice")).await;

    let call = client.server().attr("hang").call(args![]).into_future();
    assert!(tokio::time::timeout(Duration::from_millis(50), call).await.is_err());
    assert!(client.correlation().is_empty());
}

/// A client answering a relayed request sees the hub as its caller
#[tokio::test]
async fn test_caller_of_relayed_request() {
    let (hub, connector) = start_hub(Config::new("hub"));
    let peer_a = start_client(&connector, Config::new("peerA")).await;
    let _peer_b = start_client(&connector, Config::new("peerB")).await;

    let relayed = peer_a.peer("peerB").attr("ask_caller").call(args![]).await.expect("relayed");
    assert_eq!(relayed, json!("hub"));

    let direct = peer_a.server().attr("ask_caller").call(args![]).await.expect("direct");
    assert_eq!(direct, json!("peerA"));

    let from_hub = hub.peer("peerB").attr("ask_caller").call(args![]).await.expect("from hub");
    assert_eq!(from_hub, json!("hub"));
}
