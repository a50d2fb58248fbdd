//! In-process transports.
//!
//! Connections are duplex pairs of unbounded mpsc channels. A listener and its
//! connectors share a channel of freshly made pairs, so a whole hub with many
//! clients can run inside one test process.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::sync::mpsc;

use crate::transport::Connection;
use crate::transport::Connector;
use crate::transport::Listener;
use crate::transport::Result;
use crate::transport::TransportError;

static NEXT_PAIR: AtomicU64 = AtomicU64::new(1);

/// One end of an in-memory duplex pair.
///
/// Frames sent on one end appear on the other end's `recv`. Closing either end
/// ends `recv` on both.
pub struct MemoryConnection {
    tx: StdMutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: AtomicBool,
    notify: Notify,
    label: String,
}

impl MemoryConnection {
    /// Creates a pair of connections wired to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        let n = NEXT_PAIR.fetch_add(1, Ordering::Relaxed);

        let a = Self::new(tx_a, rx_b, format!("memory-{}a", n));
        let b = Self::new(tx_b, rx_a, format!("memory-{}b", n));
        (a, b)
    }

    fn new(tx: mpsc::UnboundedSender<Vec<u8>>, rx: mpsc::UnboundedReceiver<Vec<u8>>, label: String) -> Self {
        Self {
            tx: StdMutex::new(Some(tx)),
            rx: Mutex::new(rx),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
            label,
        }
    }
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        let guard = self.tx.lock().map_err(|_| TransportError::Closed)?;
        let Some(tx) = guard.as_ref() else {
            return Err(TransportError::Closed);
        };
        tx.send(frame.to_vec())
            .map_err(|_| TransportError::ConnectionLost("peer dropped".into()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        // Registered before the flag check so a concurrent close is not missed.
        let closed = self.notify.notified();
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }

        let mut rx = self.rx.lock().await;
        tokio::select! {
            frame = rx.recv() => Ok(frame),
            _ = closed => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        self.notify.notify_waiters();
        Ok(())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Accepts connections made through its [`MemoryConnector`]s.
pub struct MemoryListener {
    incoming: Mutex<mpsc::UnboundedReceiver<MemoryConnection>>,
    closed: AtomicBool,
    notify: Notify,
}

/// Opens connections to a [`MemoryListener`]. Cheap to clone.
#[derive(Clone)]
pub struct MemoryConnector {
    outgoing: mpsc::UnboundedSender<MemoryConnection>,
}

/// Creates a listener and a connector bound to it.
pub fn channel() -> (MemoryListener, MemoryConnector) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = MemoryListener {
        incoming: Mutex::new(rx),
        closed: AtomicBool::new(false),
        notify: Notify::new(),
    };
    (listener, MemoryConnector { outgoing: tx })
}

#[async_trait::async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<Option<Box<dyn Connection>>> {
        let closed = self.notify.notified();
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }

        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            conn = incoming.recv() => Ok(conn.map(|c| Box::new(c) as Box<dyn Connection>)),
            _ = closed => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let (local, remote) = MemoryConnection::pair();
        self.outgoing
            .send(remote)
            .map_err(|_| TransportError::ConnectionLost("listener closed".into()))?;
        Ok(Box::new(local))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_pair_is_duplex() {
        let (a, b) = MemoryConnection::pair();
        a.send(b"ping").await.unwrap();
        b.send(b"pong").await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Some(b"ping".to_vec()));
        assert_eq!(a.recv().await.unwrap(), Some(b"pong".to_vec()));
    }

    #[tokio::test]
    async fn test_close_ends_both_sides() {
        let (a, b) = MemoryConnection::pair();
        a.close().await.unwrap();
        assert_eq!(a.recv().await.unwrap(), None);
        assert_eq!(b.recv().await.unwrap(), None);
        assert!(a.send(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_close_wakes_pending_recv() {
        let (a, _b) = MemoryConnection::pair();
        let a = Arc::new(a);
        let reader = {
            let a = a.clone();
            tokio::spawn(async move { a.recv().await })
        };
        tokio::task::yield_now().await;
        a.close().await.unwrap();
        assert_eq!(reader.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn test_connector_reaches_listener() {
        let (listener, connector) = channel();
        let client = connector.connect().await.unwrap();
        let server = listener.accept().await.unwrap().unwrap();

        client.send(b"hello").await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Some(b"hello".to_vec()));

        listener.close().await.unwrap();
        assert!(listener.accept().await.unwrap().is_none());
    }
}
