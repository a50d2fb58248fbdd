//! The namespace every astnode endpoint exposes, and the call sequence the
//! `demo` command runs against it.

use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use astrun::AddressTag;
use astrun::Engine;
use astrun::Error;
use astrun::Object;
use astrun::Proxy;
use astrun::Result;
use astrun::Value;
use astrun::args;
use astrun::context;
use astrun::kwargs;
use futures::StreamExt;
use tracing::info;

/// A counter that lives on the endpoint that constructed it.
struct Number {
    value: AtomicI64,
}

impl Object for Number {
    fn type_name(&self) -> &str {
        "Number"
    }

    fn describe(&self) -> String {
        format!("<Number {}>", self.value.load(Ordering::SeqCst))
    }

    fn get_attr(self: Arc<Self>, name: &str) -> Result<Value> {
        let op: fn(i64, i64) -> i64 = match name {
            "value" => return Ok(Value::from(self.value.load(Ordering::SeqCst))),
            "add" => |a, b| a + b,
            "sub" => |a, b| a - b,
            "mul" => |a, b| a * b,
            _ => {
                return Err(Error::Attribute {
                    type_name: "Number".into(),
                    name: name.into(),
                });
            }
        };
        let name = name.to_string();
        Ok(Value::function(name, move |args| {
            let n = args.i64(0, "n")?;
            let _ = self
                .value
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(op(v, n)));
            Ok(Value::Object(self.clone()))
        }))
    }
}

pub fn install(engine: &Engine) {
    engine.register(
        "ping",
        Value::function("ping", |args| Ok(Value::from(format!("pong {}", args.str(0, "msg")?)))),
    );
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
            let delay = Duration::from_millis(args.opt(1, "delay_ms").and_then(Value::as_i64).unwrap_or(0) as u64);
            Ok(futures::stream::iter(0..n).then(move |i| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, Error>(Value::from(i))
            }))
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
}

/// Exercises `target`, printing each result as it arrives.
pub async fn run(target: Proxy) -> Result<()> {
    let pong = target.attr("ping").call(args!["hello"]).await?;
    info!(result = %pong, "ping");

    let nested = target.attr("ping").call(args![target.attr("ping").call(args!["hello"])]).await?;
    info!(result = %nested, "nested ping");

    let sum = target
        .attr("sub")
        .call_kw(args![target.attr("add").call(args![10, 5])], kwargs! {"b" => target.attr("value")})
        .await?;
    info!(result = %sum, "sub(add(10, 5), b=value)");

    let chained = target
        .attr("Number")
        .call(args![1])
        .attr("add")
        .call(args![10])
        .attr("mul")
        .call(args![3])
        .attr("value")
        .await?;
    info!(result = %chained, "Number(1).add(10).mul(3).value");

    // Stored handles are only reachable on the endpoint that answered.
    if target.address() == Some(&AddressTag::Server) {
        let reply = target.attr("Number").call(args![1]).raw().await?;
        info!(id = %reply.id(), result = %reply.value(), "Number(1)");
        let number = reply.proxy();
        number.attr("sub").call(args![4]).raw().await?;
        let value = number.attr("value").await?;
        info!(result = %value, "handle.sub(4).value");
    }

    let mut items = target.attr("async_generator").call(args![5, 20]).iter();
    while let Some(item) = items.next().await {
        info!(item = %item?, "async_generator");
    }

    let answer = target.attr("reverse_call").call(args!["back"]).await?;
    info!(result = %answer, "reverse_call");

    Ok(())
}
