//! Per-request context visible to user code.
//!
//! While a request is being evaluated, host functions can ask who called them
//! and call back into the caller's namespace:
//!
//! ```ignore
//! let ctx = astrun::context::current().ok_or_else(|| Error::internal("no caller"))?;
//! let answer = ctx.caller()?.attr("ping").call(args!["back"]).await?;
//! ```

use std::future::Future;

use crate::engine::Engine;
use crate::engine::Role;
use crate::error::Error;
use crate::error::Result;
use crate::proxy::Proxy;
use crate::registry::ConnId;

tokio::task_local! {
    static CONTEXT: CallContext;
}

#[derive(Clone)]
pub struct CallContext {
    engine: Engine,
    conn: Option<ConnId>,
    request_id: String,
}

impl CallContext {
    pub(crate) fn new(engine: Engine, conn: Option<ConnId>, request_id: String) -> Self {
        Self { engine, conn, request_id }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The connection the request arrived on.
    pub fn conn(&self) -> Option<ConnId> {
        self.conn
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The registered name of whoever sent the request.
    pub fn caller_name(&self) -> Option<String> {
        self.conn.and_then(|id| self.engine.registry().name_of(id))
    }

    /// A call builder rooted at the namespace of whoever sent the request
    /// on this connection.
    ///
    /// On a client that is always the server: a request the server relayed
    /// for another client carries no trace of that client, so calls made
    /// through this builder are evaluated by the server, not the originator.
    pub fn caller(&self) -> Result<Proxy> {
        match self.engine.role() {
            Role::Client { .. } => Ok(self.engine.server()),
            Role::Server => {
                let name = self
                    .caller_name()
                    .ok_or_else(|| Error::internal("caller has not registered a name"))?;
                Ok(self.engine.peer(name))
            }
        }
    }
}

/// The context of the request being evaluated on this task, if any.
pub fn current() -> Option<CallContext> {
    CONTEXT.try_with(|ctx| ctx.clone()).ok()
}

pub(crate) async fn scope<F: Future>(ctx: CallContext, f: F) -> F::Output {
    CONTEXT.scope(ctx, f).await
}
