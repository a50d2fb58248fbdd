//! Shared fixtures: an in-memory hub with a demo namespace, and clients.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use astrun::Config;
use astrun::Engine;
use astrun::Error;
use astrun::Object;
use astrun::Result;
use astrun::Value;
use astrun::args;
use astrun::context;
use astrun::memory;
use astrun::memory::MemoryConnector;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Number {
    value: AtomicI64,
}

impl Object for Number {
    fn type_name(&self) -> &str {
        "Number"
    }

    fn get_attr(self: Arc<Self>, name: &str) -> Result<Value> {
        match name {
            "value" => Ok(Value::from(self.value.load(Ordering::SeqCst))),
            "add" => Ok(Value::function("add", move |args| {
                self.value.fetch_add(args.i64(0, "n")?, Ordering::SeqCst);
                Ok(Value::Object(self.clone()))
            })),
            _ => Err(Error::Attribute {
                type_name: "Number".into(),
                name: name.into(),
            }),
        }
    }
}

/// Bindings shared by the hub and clients in these tests.
pub fn install_demo(engine: &Engine) {
    engine.register("ping", Value::function("ping", |args| Ok(Value::from(format!("pong {}", args.str(0, "msg")?)))));
    engine.register(
        "add",
        Value::function("add", |args| Ok(Value::from(args.i64(0, "a")? + args.i64(1, "b")?))),
    );
    engine.register(
        "sub",
        Value::function("sub", |args| Ok(Value::from(args.i64(0, "a")? - args.i64(1, "b")?))),
    );
    engine.register("value", Value::from(42));
    engine.register(
        "Number",
        Value::function("Number", |args| {
            let start = args.opt(0, "value").and_then(Value::as_i64).unwrap_or(0);
            Ok(Value::object(Number { value: AtomicI64::new(start) }))
        }),
    );
    engine.register(
        "async_generator",
        Value::generator("async_generator", |args| {
            let n = args.i64(0, "n")?;
            Ok(futures::stream::iter((0..n).map(|i| Ok::<_, Error>(Value::from(i)))))
        }),
    );
    engine.register(
        "whoami",
        Value::function("whoami", |_| {
            let ctx = context::current().ok_or_else(|| Error::internal("no call context"))?;
            Ok(Value::from(ctx.engine().name()))
        }),
    );
    engine.register(
        "reverse_call",
        Value::async_function("reverse_call", |args| async move {
            let msg = args.str(0, "msg")?.to_string();
            let ctx = context::current().ok_or_else(|| Error::internal("no call context"))?;
            let answer = ctx.caller()?.attr("ping").call(args![msg]).await?;
            Ok::<_, Error>(Value::from(answer))
        }),
    );
    engine.register(
        "ask_caller",
        Value::async_function("ask_caller", |_| async move {
            let ctx = context::current().ok_or_else(|| Error::internal("no call context"))?;
            let name = ctx.caller()?.attr("whoami").call(args![]).await?;
            Ok::<_, Error>(Value::from(name))
        }),
    );
    engine.register(
        "boom",
        Value::function("boom", |_| -> Result<Value> { panic!("boom") }),
    );
    engine.register(
        "hang",
        Value::async_function("hang", |_| async move {
            futures::future::pending::<()>().await;
            Ok::<_, Error>(Value::null())
        }),
    );
}

/// Starts a hub serving an in-memory listener.
pub fn start_hub(config: Config) -> (Engine, MemoryConnector) {
    init_tracing();
    let hub = Engine::new(config);
    install_demo(&hub);

    let (listener, connector) = memory::channel();
    let serving = hub.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    (hub, connector)
}

/// Connects and registers a client with the demo namespace.
pub async fn start_client(connector: &MemoryConnector, config: Config) -> Engine {
    let client = Engine::new(config);
    install_demo(&client);
    client.connect(connector).await.expect("client should register");
    client
}

/// Polls `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
