//! # Engine
//!
//! Ties the pieces together: accepts or opens connections, runs one receive
//! loop per connection, dispatches inbound requests to the [`Evaluator`],
//! correlates inbound responses, and hands out [`Proxy`] call builders.
//!
//! An engine plays one role for its lifetime: it either serves (the hub every
//! client registers with) or connects (a client registered under a name).
//!
//! ## Connection lifecycle
//!
//! `Connected -> Authenticating -> Ready -> Closed`
//!
//! - **Registration first**: A served connection gets a pinned registration
//!   callable in its locals. Until that call succeeds, every other request is
//!   queued, then run in arrival order once the connection is ready.
//! - **Concurrent after**: Once ready, each request runs on its own task.
//! - **Clean disconnect**: When the receive loop ends, the connection's locals
//!   are dropped, its name released, and anyone awaiting a response on it is
//!   failed with [`Error::ConnectionClosed`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use astrpc::AddressTag;
use astrpc::Arg;
use astrpc::AstNode;
use astrpc::Message;
use astrpc::ProtocolError;
use astrpc::REGISTER_ENTRY;
use astrpc::Request;
use astrpc::Target;
use futures::FutureExt;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::context;
use crate::context::CallContext;
use crate::correlation::CorrelationTable;
use crate::error::Error;
use crate::error::Result;
use crate::namespace::Namespace;
use crate::proxy::Proxy;
use crate::registry::ConnId;
use crate::registry::ConnState;
use crate::registry::Registry;
use crate::runtime::Evaluator;
use crate::transport::Connection;
use crate::transport::Connector;
use crate::transport::Listener;
use crate::value::Value;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Called with errors that have no request to be reported on.
pub type ErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client { name: String },
}

/// Where an outbound chain is evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Route {
    Remote(ConnId),
    /// Evaluated in this engine without touching the network.
    Loopback,
}

struct EngineInner {
    config: Config,
    role: OnceLock<Role>,
    namespace: Namespace,
    registry: Registry,
    pending: CorrelationTable,
    /// The client's connection to its server.
    upstream: Mutex<Option<ConnId>>,
    closing: watch::Sender<bool>,
    sweeping: AtomicBool,
    error_hook: RwLock<Option<ErrorHook>>,
}

/// A handle to one endpoint. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Held by tasks and namespace entries that must not keep the engine alive.
#[derive(Clone)]
struct WeakEngine(Weak<EngineInner>);

impl WeakEngine {
    fn upgrade(&self) -> Option<Engine> {
        self.0.upgrade().map(|inner| Engine { inner })
    }
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            inner: Arc::new(EngineInner {
                config,
                role: OnceLock::new(),
                namespace: Namespace::new(),
                registry: Registry::new(),
                pending: CorrelationTable::new(),
                upstream: Mutex::new(None),
                closing,
                sweeping: AtomicBool::new(false),
                error_hook: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    /// The role chosen by [`Engine::serve`] or [`Engine::connect`]. An engine
    /// that has done neither evaluates as a server.
    pub fn role(&self) -> Role {
        self.inner.role.get().cloned().unwrap_or(Role::Server)
    }

    pub fn namespace(&self) -> &Namespace {
        &self.inner.namespace
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn correlation(&self) -> &CorrelationTable {
        &self.inner.pending
    }

    /// Binds `key` in the global namespace.
    pub fn register(&self, key: impl Into<String>, value: Value) {
        self.inner.namespace.set_global(key, value);
    }

    /// Call builder for the server's namespace.
    pub fn server(&self) -> Proxy {
        Proxy::new(self.clone(), Target::Address(AddressTag::Server))
    }

    /// Call builder for the namespace of the client registered as `name`.
    pub fn peer(&self, name: impl Into<String>) -> Proxy {
        Proxy::new(self.clone(), Target::Address(AddressTag::client(name)))
    }

    /// Call builder with no address: evaluated by whoever receives it.
    pub fn local(&self) -> Proxy {
        Proxy::new(self.clone(), Target::Null)
    }

    /// Installs the hook for errors that cannot be answered, such as frames
    /// too broken to recover an id from. Without one they are logged.
    pub fn on_error<F>(&self, hook: F)
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        let mut slot = self.inner.error_hook.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(Arc::new(hook));
    }

    /// Accepts connections until the listener or the engine is closed.
    pub async fn serve<L: Listener>(&self, listener: L) -> Result<()> {
        self.set_role(Role::Server)?;
        self.spawn_sweeper();
        info!(name = %self.name(), "serving");

        let mut closing = self.inner.closing.subscribe();
        loop {
            if *closing.borrow_and_update() {
                break;
            }
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = closing.changed() => continue,
            };
            match accepted {
                Ok(Some(conn)) => {
                    self.attach(conn);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        listener.close().await?;
        info!(name = %self.name(), "stopped serving");
        Ok(())
    }

    /// Connects to a server and registers under the configured name and token.
    /// Returns the server's name.
    pub async fn connect<C: Connector + ?Sized>(&self, connector: &C) -> Result<String> {
        let name = self.name().to_string();
        self.set_role(Role::Client { name: name.clone() })?;
        if self.upstream().is_some() {
            return Err(Error::InvalidRequest("already connected".to_string()));
        }

        let conn: Arc<dyn Connection> = Arc::from(connector.connect().await?);
        let id = self.inner.registry.insert(conn.clone(), ConnState::Authenticating);
        self.inner.namespace.open(id);
        *self.inner.upstream.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
        tokio::spawn(self.clone().pump(id, conn.clone(), false));
        self.spawn_sweeper();

        let token = self.config().token.clone();
        let registration = self
            .local()
            .attr(REGISTER_ENTRY)
            .call([Arg::from(name.as_str()), Arg::from(token)])
            .await;

        let server_name = match registration {
            Ok(Json::String(server_name)) => server_name,
            Ok(other) => other.to_string(),
            Err(e) => {
                warn!(name = %name, error = %e, "registration failed");
                let _ = conn.close().await;
                return Err(match e {
                    Error::Remote(rpc) if rpc.message == "AuthenticationFailed" => Error::AuthFailed,
                    other => other,
                });
            }
        };

        self.inner.registry.register_name(id, &server_name)?;
        self.inner.registry.set_state(id, ConnState::Ready);
        info!(name = %name, server = %server_name, "registered with server");
        Ok(server_name)
    }

    /// Stops serving and closes every connection.
    pub async fn close(&self) {
        self.inner.closing.send_replace(true);
        for id in self.inner.registry.ids() {
            self.disconnect(id).await;
        }
    }

    /// Closes one connection. Its receive loop then cleans up.
    pub async fn disconnect(&self, id: ConnId) {
        if let Some(conn) = self.inner.registry.connection(id) {
            if let Err(e) = conn.close().await {
                debug!(conn = %id, error = %e, "close failed");
            }
        }
    }

    fn set_role(&self, role: Role) -> Result<()> {
        let current = self.inner.role.get_or_init(|| role.clone());
        if *current != role {
            return Err(Error::InvalidRequest(format!("engine already running as {:?}", current)));
        }
        Ok(())
    }

    fn downgrade(&self) -> WeakEngine {
        WeakEngine(Arc::downgrade(&self.inner))
    }

    fn upstream(&self) -> Option<ConnId> {
        *self.inner.upstream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True if a chain rooted at `tag` is evaluated here.
    pub(crate) fn is_local(&self, tag: &AddressTag) -> bool {
        match self.role() {
            Role::Server => *tag == AddressTag::Server,
            Role::Client { name } => tag.peer_name() == Some(name.as_str()),
        }
    }

    /// Picks where a chain rooted at `root` is sent. Servers reach clients by
    /// name and evaluate everything else themselves; clients send everything
    /// not addressed to themselves to their server.
    pub(crate) fn route(&self, root: Option<&AddressTag>) -> Result<Route> {
        match self.role() {
            Role::Client { .. } => match root {
                Some(tag) if self.is_local(tag) => Ok(Route::Loopback),
                _ => self.upstream().map(Route::Remote).ok_or(Error::ConnectionClosed),
            },
            Role::Server => match root {
                Some(AddressTag::Client(name)) => self
                    .inner
                    .registry
                    .lookup_name(name)
                    .map(Route::Remote)
                    .ok_or_else(|| Error::PeerNotFound(name.clone())),
                _ => Ok(Route::Loopback),
            },
        }
    }

    /// Evaluates `node` through `route`. Returns the id the result is known
    /// by on the evaluating side, and the result.
    pub(crate) async fn request(&self, route: Route, node: AstNode) -> Result<(String, Json)> {
        match route {
            Route::Remote(id) => {
                let conn = self.inner.registry.connection(id).ok_or(Error::ConnectionClosed)?;
                self.inner
                    .pending
                    .send_and_wait(id, conn.as_ref(), node, self.config().call_timeout())
                    .await
            }
            Route::Loopback => {
                let value = self.evaluate_local(&node).await?;
                Ok((Uuid::new_v4().to_string(), value.describe()))
            }
        }
    }

    pub(crate) async fn evaluate_local(&self, node: &AstNode) -> Result<Value> {
        let evaluator = Evaluator::new(self, None);
        evaluator.evaluate(node).await
    }

    fn attach(&self, conn: Box<dyn Connection>) -> ConnId {
        let conn: Arc<dyn Connection> = Arc::from(conn);
        let id = self.inner.registry.insert(conn.clone(), ConnState::Connected);
        info!(conn = %id, peer = %conn.describe(), "connection accepted");
        self.inner.namespace.open(id);

        self.install_registration(id);
        self.inner.registry.set_state(id, ConnState::Authenticating);
        if let Some(limit) = self.config().handshake_timeout() {
            self.spawn_handshake_watchdog(id, limit);
        }

        tokio::spawn(self.clone().pump(id, conn, true));
        id
    }

    fn install_registration(&self, id: ConnId) {
        let engine = self.downgrade();
        let register = Value::function(REGISTER_ENTRY, move |args| {
            let engine = engine.upgrade().ok_or(Error::ConnectionClosed)?;
            let name = args.str(0, "name")?;
            let token = args.opt(1, "token").and_then(Value::as_str);
            engine.authenticate(id, name, token)
        });
        self.inner.namespace.pin_local(id, REGISTER_ENTRY, register);
    }

    fn authenticate(&self, id: ConnId, name: &str, token: Option<&str>) -> Result<Value> {
        if let Some(expected) = self.config().token.as_deref() {
            if token != Some(expected) {
                warn!(conn = %id, name, "registration rejected: bad token");
                return Err(Error::AuthFailed);
            }
        }
        self.inner.registry.register_name(id, name)?;
        self.inner.registry.set_state(id, ConnState::Ready);
        info!(conn = %id, name, "client registered");
        Ok(Value::from(self.name()))
    }

    fn spawn_handshake_watchdog(&self, id: ConnId, limit: Duration) {
        let engine = self.downgrade();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            let Some(engine) = engine.upgrade() else { return };
            let state = engine.inner.registry.state(id);
            if matches!(state, Some(ConnState::Connected | ConnState::Authenticating)) {
                warn!(conn = %id, "no registration within {:?}, closing", limit);
                engine.disconnect(id).await;
            }
        });
    }

    fn spawn_sweeper(&self) {
        let Some(ttl) = self.config().local_idle_ttl() else { return };
        if self.inner.sweeping.swap(true, Ordering::AcqRel) {
            return;
        }

        let interval = self.config().sweep_interval();
        let engine = self.downgrade();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else { break };
                if *engine.inner.closing.borrow() {
                    break;
                }
                let dropped = engine.inner.namespace.sweep(ttl);
                if dropped > 0 {
                    debug!(dropped, "swept idle results");
                }
            }
        });
    }

    /// Receive loop for one connection.
    async fn pump(self, id: ConnId, conn: Arc<dyn Connection>, gated: bool) {
        let mut gate = if gated {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(self.clone().drain(id, rx));
            Some(tx)
        } else {
            None
        };

        loop {
            match conn.recv().await {
                Ok(Some(frame)) => self.handle_frame(id, &frame, &mut gate).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(conn = %id, error = %e, "receive failed");
                    break;
                }
            }
        }

        drop(gate);
        self.teardown(id, conn).await;
    }

    async fn handle_frame(&self, id: ConnId, frame: &[u8], gate: &mut Option<mpsc::UnboundedSender<Request>>) {
        let message = match Message::from_slice(frame) {
            Ok(message) => message,
            Err(e) => return self.reject(id, e).await,
        };

        match message {
            Message::Request(request) => {
                if gate.is_some() && self.inner.registry.state(id) == Some(ConnState::Ready) {
                    *gate = None;
                }
                if let Some(queue) = gate.as_ref() {
                    if !request.method.is_registration() {
                        debug!(conn = %id, request = %request.id, "queued until registration");
                        let _ = queue.send(request);
                        return;
                    }
                }
                let engine = self.clone();
                tokio::spawn(async move { engine.dispatch(id, request).await });
            }
            Message::Response(response) => match response.id {
                Some(request_id) => {
                    if !self.inner.pending.resolve(&request_id, response.outcome) {
                        debug!(conn = %id, request = %request_id, "response for unknown request");
                    }
                }
                None => {
                    let error = match response.outcome {
                        Err(rpc) => Error::Remote(rpc),
                        Ok(_) => Error::InvalidRequest("response without id".to_string()),
                    };
                    self.report(&error);
                }
            },
        }
    }

    /// Runs requests queued before registration, in arrival order.
    async fn drain(self, id: ConnId, mut queue: mpsc::UnboundedReceiver<Request>) {
        let Some(mut state) = self.inner.registry.watch_state(id) else { return };
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnState::Ready => break,
                ConnState::Closed => return,
                ConnState::Connected | ConnState::Authenticating => {}
            }
            if state.changed().await.is_err() {
                return;
            }
        }

        debug!(conn = %id, queued = queue.len(), "draining queued requests");
        while let Some(request) = queue.recv().await {
            self.dispatch(id, request).await;
        }
    }

    /// Evaluates one inbound request and answers it.
    async fn dispatch(&self, id: ConnId, request: Request) {
        let Request { id: request_id, method } = request;
        debug!(conn = %id, request = %request_id, chain = %method, "evaluating");

        let ctx = CallContext::new(self.clone(), Some(id), request_id.clone());
        let evaluator = Evaluator::new(self, Some(id));
        let evaluation = AssertUnwindSafe(evaluator.evaluate(&method)).catch_unwind();
        let result = context::scope(ctx, evaluation).await.unwrap_or_else(|panic| {
            Err(Error::Internal(format!("panicked: {}", panic_message(panic.as_ref()))))
        });

        let rejected = matches!(result, Err(Error::AuthFailed));
        let reply = match result {
            Ok(value) => Message::response(request_id.clone(), self.settle(id, &request_id, value)),
            Err(e) => {
                log_failure(id, &request_id, &e);
                Message::error(Some(request_id), e.to_rpc())
            }
        };
        self.send_message(id, &reply).await;

        if rejected {
            self.disconnect(id).await;
        }
    }

    /// Turns an evaluation result into its wire form. Live results are kept in
    /// the requester's locals under the request id; an iterator is answered
    /// with that id as its continuation token.
    fn settle(&self, id: ConnId, request_id: &str, value: Value) -> Json {
        let reply = match &value {
            Value::Data(data) => return data.clone(),
            Value::Stream(_) => Json::String(request_id.to_string()),
            Value::Object(_) => value.describe(),
        };
        if !self.inner.namespace.store_local(id, request_id, value) {
            debug!(conn = %id, request = %request_id, "connection gone, result not stored");
        }
        reply
    }

    async fn reject(&self, id: ConnId, e: ProtocolError) {
        match e.request_id() {
            Some(request_id) => {
                debug!(conn = %id, request = %request_id, error = %e, "rejecting frame");
                let reply = Message::error(Some(request_id.to_string()), e.to_rpc());
                self.send_message(id, &reply).await;
            }
            None => {
                warn!(conn = %id, error = %e, "dropping undecodable frame");
                self.report(&Error::Protocol(e));
            }
        }
    }

    async fn send_message(&self, id: ConnId, message: &Message) {
        let Some(conn) = self.inner.registry.connection(id) else {
            debug!(conn = %id, "connection gone, dropping reply");
            return;
        };
        let frame = match message.to_vec() {
            Ok(frame) => frame,
            Err(e) => {
                error!(conn = %id, error = %e, "failed to encode reply");
                return;
            }
        };
        if let Err(e) = conn.send(&frame).await {
            warn!(conn = %id, error = %e, "failed to send reply");
        }
    }

    fn report(&self, error: &Error) {
        let hook = self
            .inner
            .error_hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .cloned();
        match hook {
            Some(hook) => hook(error),
            None => warn!(error = %error, "unhandled error"),
        }
    }

    async fn teardown(&self, id: ConnId, conn: Arc<dyn Connection>) {
        let name = self.inner.registry.name_of(id);
        self.inner.registry.remove(id);
        let cleared = self.inner.namespace.clear(id);
        let failed = self.inner.pending.fail_connection(id);
        {
            let mut upstream = self.inner.upstream.lock().unwrap_or_else(PoisonError::into_inner);
            if *upstream == Some(id) {
                *upstream = None;
            }
        }
        let _ = conn.close().await;
        info!(conn = %id, name = ?name, cleared, failed, "connection closed");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

fn log_failure(id: ConnId, request_id: &str, e: &Error) {
    match e {
        Error::Exhausted => debug!(conn = %id, request = %request_id, "iteration exhausted"),
        Error::Internal(_) => error!(conn = %id, request = %request_id, error = %e, "request failed"),
        _ => warn!(conn = %id, request = %request_id, error = %e, "request failed"),
    }
}
