//! # Namespace
//!
//! Three tiers of name-to-value bindings consulted when a chain's leaf is
//! resolved: per-connection locals, then globals, then builtins.
//!
//! ## Invariants
//!
//! - **Scoped locals**: A connection only ever sees its own locals. Results
//!   stored for one connection cannot be reached through another.
//! - **Precedence**: Locals shadow globals, which shadow builtins.
//! - **Cleanup**: `clear` drops every local of a connection, and nothing can
//!   be stored for it afterwards until it is opened again. `sweep` drops
//!   locals idle past a TTL, except pinned ones.
//! - **No user code under locks**: Lookups clone the value out before
//!   returning.

use std::time::Duration;
use std::time::Instant;

use dashmap::DashMap;

use crate::error::Error;
use crate::error::Result;
use crate::registry::ConnId;
use crate::value::Value;

struct Local {
    value: Value,
    touched: Instant,
    /// Exempt from sweeping.
    pinned: bool,
}

impl Local {
    fn new(value: Value, pinned: bool) -> Self {
        Self {
            value,
            touched: Instant::now(),
            pinned,
        }
    }
}

#[derive(Default)]
pub struct Namespace {
    builtins: DashMap<String, Value>,
    globals: DashMap<String, Value>,
    locals: DashMap<ConnId, DashMap<String, Local>>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_builtin(&self, key: impl Into<String>, value: Value) {
        self.builtins.insert(key.into(), value);
    }

    pub fn set_global(&self, key: impl Into<String>, value: Value) {
        self.globals.insert(key.into(), value);
    }

    pub fn remove_global(&self, key: &str) -> Option<Value> {
        self.globals.remove(key).map(|(_, v)| v)
    }

    /// Resolves `key` for `conn`: locals, then globals, then builtins. Without
    /// a connection only globals and builtins are visible.
    pub fn lookup(&self, conn: Option<ConnId>, key: &str) -> Result<Value> {
        if let Some(conn) = conn {
            if let Some(value) = self.touch_local(conn, key) {
                return Ok(value);
            }
        }
        if let Some(value) = self.globals.get(key) {
            return Ok(value.clone());
        }
        if let Some(value) = self.builtins.get(key) {
            return Ok(value.clone());
        }
        Err(Error::MethodNotFound(key.to_string()))
    }

    /// Resolves `key` among the locals of `conn` only.
    pub fn lookup_local(&self, conn: ConnId, key: &str) -> Result<Value> {
        self.touch_local(conn, key)
            .ok_or_else(|| Error::MethodNotFound(key.to_string()))
    }

    fn touch_local(&self, conn: ConnId, key: &str) -> Option<Value> {
        let scope = self.locals.get(&conn)?;
        let mut local = scope.get_mut(key)?;
        local.touched = Instant::now();
        Some(local.value.clone())
    }

    /// Creates the locals of a new connection. [`Namespace::store_local`]
    /// only writes into opened connections.
    pub fn open(&self, conn: ConnId) {
        self.locals.entry(conn).or_default();
    }

    /// Stores a result for `conn` unless its locals were already cleared.
    /// Returns whether it was stored.
    pub fn store_local(&self, conn: ConnId, key: impl Into<String>, value: Value) -> bool {
        // The read guard keeps `clear` from removing the scope mid-insert.
        let Some(scope) = self.locals.get(&conn) else {
            return false;
        };
        scope.insert(key.into(), Local::new(value, false));
        true
    }

    pub fn set_local(&self, conn: ConnId, key: impl Into<String>, value: Value) {
        self.locals
            .entry(conn)
            .or_default()
            .insert(key.into(), Local::new(value, false));
    }

    /// Like [`Namespace::set_local`], but never swept.
    pub fn pin_local(&self, conn: ConnId, key: impl Into<String>, value: Value) {
        self.locals
            .entry(conn)
            .or_default()
            .insert(key.into(), Local::new(value, true));
    }

    pub fn remove_local(&self, conn: ConnId, key: &str) -> Option<Value> {
        let scope = self.locals.get(&conn)?;
        scope.remove(key).map(|(_, local)| local.value)
    }

    pub fn local_count(&self, conn: ConnId) -> usize {
        self.locals.get(&conn).map(|scope| scope.len()).unwrap_or(0)
    }

    /// Drops every local of `conn`. Returns how many were dropped.
    pub fn clear(&self, conn: ConnId) -> usize {
        self.locals.remove(&conn).map(|(_, scope)| scope.len()).unwrap_or(0)
    }

    /// Drops unpinned locals untouched for longer than `ttl`. Returns how many
    /// were dropped.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut dropped = 0;
        for scope in self.locals.iter() {
            let before = scope.len();
            scope.retain(|_, local| local.pinned || now.duration_since(local.touched) < ttl);
            dropped += before - scope.len();
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_precedence() {
        let ns = Namespace::new();
        let conn = ConnId(1);
        ns.set_builtin("x", Value::from("builtin"));
        assert_eq!(ns.lookup(Some(conn), "x").unwrap().as_str(), Some("builtin"));

        ns.set_global("x", Value::from("global"));
        assert_eq!(ns.lookup(Some(conn), "x").unwrap().as_str(), Some("global"));

        ns.set_local(conn, "x", Value::from("local"));
        assert_eq!(ns.lookup(Some(conn), "x").unwrap().as_str(), Some("local"));
        assert_eq!(ns.lookup(None, "x").unwrap().as_str(), Some("global"));
    }

    #[test]
    fn test_locals_are_scoped() {
        let ns = Namespace::new();
        ns.set_local(ConnId(1), "r1", Value::from(1));
        assert!(ns.lookup(Some(ConnId(2)), "r1").is_err());
        assert!(matches!(ns.lookup_local(ConnId(2), "r1"), Err(Error::MethodNotFound(_))));
        assert_eq!(ns.lookup_local(ConnId(1), "r1").unwrap().as_i64(), Some(1));
    }

    #[test]
    fn test_missing_key() {
        let ns = Namespace::new();
        let err = ns.lookup(None, "nope").unwrap_err();
        assert!(matches!(err, Error::MethodNotFound(ref k) if k == "nope"));
    }

    #[test]
    fn test_clear_and_sweep() {
        let ns = Namespace::new();
        let conn = ConnId(7);
        ns.pin_local(conn, "boot", Value::from(0));
        ns.set_local(conn, "r1", Value::from(1));
        ns.set_local(conn, "r2", Value::from(2));
        assert_eq!(ns.local_count(conn), 3);

        assert_eq!(ns.sweep(Duration::from_secs(3600)), 0);
        assert_eq!(ns.sweep(Duration::ZERO), 2);
        assert_eq!(ns.local_count(conn), 1);
        assert!(ns.lookup_local(conn, "boot").is_ok());

        assert_eq!(ns.remove_local(conn, "boot").and_then(|v| v.as_i64()), Some(0));
        ns.set_local(conn, "r3", Value::from(3));
        assert_eq!(ns.clear(conn), 1);
        assert_eq!(ns.local_count(conn), 0);
    }

    #[test]
    fn test_store_after_clear_is_refused() {
        let ns = Namespace::new();
        let conn = ConnId(3);
        assert!(!ns.store_local(conn, "r0", Value::from(0)));

        ns.open(conn);
        assert!(ns.store_local(conn, "r1", Value::from(1)));
        assert_eq!(ns.clear(conn), 1);

        // A result settling after disconnect must not revive the scope.
        assert!(!ns.store_local(conn, "r2", Value::from(2)));
        assert_eq!(ns.local_count(conn), 0);
        assert!(ns.lookup_local(conn, "r2").is_err());
    }
}
