//! # Correlation Table
//!
//! Matches inbound responses to the outbound requests awaiting them.
//!
//! ## Invariants
//!
//! - **Unique ids**: Every outbound request gets a fresh v4 UUID.
//! - **Exactly once**: An entry is removed by whichever of resolve, cancel or
//!   connection failure comes first; the others find nothing.
//! - **No stranded waiters**: When a connection goes away every waiter on it is
//!   failed with [`Error::ConnectionClosed`].

use std::time::Duration;

use astrpc::AstNode;
use astrpc::Message;
use astrpc::RpcError;
use dashmap::DashMap;
use serde_json::Value as Json;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::error::Error;
use crate::error::Result;
use crate::registry::ConnId;
use crate::transport::Connection;

struct Pending {
    conn: ConnId,
    tx: oneshot::Sender<Result<Json>>,
}

#[derive(Default)]
pub struct CorrelationTable {
    pending: DashMap<String, Pending>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an id for a request about to go out on `conn`.
    pub fn prepare(&self, conn: ConnId) -> (String, oneshot::Receiver<Result<Json>>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), Pending { conn, tx });
        (id, rx)
    }

    /// Completes the waiter for `id`. Returns false if nobody was waiting.
    pub fn resolve(&self, id: &str, outcome: std::result::Result<Json, RpcError>) -> bool {
        let Some((_, pending)) = self.pending.remove(id) else {
            return false;
        };
        // The waiter may have given up already.
        let _ = pending.tx.send(outcome.map_err(Error::from_rpc));
        true
    }

    pub fn cancel(&self, id: &str) {
        self.pending.remove(id);
    }

    /// Fails every waiter on `conn`. Returns how many were failed.
    pub fn fail_connection(&self, conn: ConnId) -> usize {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.conn == conn)
            .map(|e| e.key().clone())
            .collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.tx.send(Err(Error::ConnectionClosed));
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Sends `node` as a request on `connection` and waits for its response.
    /// Returns the request id alongside the result.
    pub async fn send_and_wait(
        &self,
        conn: ConnId,
        connection: &dyn Connection,
        node: AstNode,
        timeout: Option<Duration>,
    ) -> Result<(String, Json)> {
        let (id, rx) = self.prepare(conn);
        let waiter = Waiter { table: self, id: &id };
        debug!(%conn, id = %id, chain = %node, "sending request");

        let frame = Message::request(id.clone(), node).to_vec()?;
        connection.send(&frame).await?;

        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|_| Error::Timeout)?,
            None => rx.await,
        };
        drop(waiter);

        match received {
            Ok(result) => result.map(|value| (id, value)),
            Err(_) => Err(Error::ConnectionClosed),
        }
    }
}

/// Removes the entry for a request whose caller stopped waiting, whether by
/// error, timeout or dropping the future.
struct Waiter<'a> {
    table: &'a CorrelationTable,
    id: &'a str,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.table.cancel(self.id);
    }
}

#[cfg(test)]
mod tests {
    use astrpc::ErrorCode;
    use serde_json::json;

    use super::*;
    use crate::memory::MemoryConnection;

    #[tokio::test]
    async fn test_resolve_and_cancel() {
        let table = CorrelationTable::new();
        let (id, rx) = table.prepare(ConnId(1));
        assert_eq!(table.len(), 1);

        assert!(table.resolve(&id, Ok(json!(8))));
        assert_eq!(rx.await.unwrap().unwrap(), json!(8));
        assert!(!table.resolve(&id, Ok(json!(9))));

        let (id, _rx) = table.prepare(ConnId(1));
        table.cancel(&id);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_error_outcomes() {
        let table = CorrelationTable::new();

        let (id, rx) = table.prepare(ConnId(1));
        table.resolve(&id, Err(RpcError::new(ErrorCode::MethodNotFound, "x")));
        assert!(matches!(rx.await.unwrap(), Err(Error::Remote(e)) if e.kind() == Some(ErrorCode::MethodNotFound)));

        let (id, rx) = table.prepare(ConnId(1));
        table.resolve(&id, Err(RpcError::stop_iteration()));
        assert!(matches!(rx.await.unwrap(), Err(Error::Exhausted)));
    }

    #[tokio::test]
    async fn test_fail_connection_only_hits_that_connection() {
        let table = CorrelationTable::new();
        let (_, rx1) = table.prepare(ConnId(1));
        let (_, rx2) = table.prepare(ConnId(1));
        let (_, rx3) = table.prepare(ConnId(2));

        assert_eq!(table.fail_connection(ConnId(1)), 2);
        assert!(matches!(rx1.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(matches!(rx2.await.unwrap(), Err(Error::ConnectionClosed)));
        assert_eq!(table.len(), 1);
        drop(rx3);
    }

    #[tokio::test]
    async fn test_send_and_wait_times_out() {
        let table = CorrelationTable::new();
        let (a, _b) = MemoryConnection::pair();
        let result = table
            .send_and_wait(ConnId(1), &a, AstNode::leaf("ping"), Some(Duration::from_millis(20)))
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_wait_leaves_no_entry() {
        let table = CorrelationTable::new();
        let (a, _b) = MemoryConnection::pair();
        let wait = table.send_and_wait(ConnId(1), &a, AstNode::leaf("ping"), None);
        assert!(tokio::time::timeout(Duration::from_millis(20), wait).await.is_err());
        assert!(table.is_empty());
    }
}
