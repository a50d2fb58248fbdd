//! TCP transport: newline-delimited JSON frames.
//!
//! Frames are compact JSON, which never contains a raw newline, so a newline
//! is an unambiguous delimiter. Lines are handed up as raw bytes; a frame
//! that is not valid UTF-8 is the decoder's problem, not a transport failure.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::sync::Notify;

use crate::transport::Connection;
use crate::transport::Connector;
use crate::transport::Listener;
use crate::transport::Result;
use crate::transport::TransportError;

pub struct TcpConnection {
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    peer: String,
    closed: AtomicBool,
    notify: Notify,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "tcp".to_string());
        let (read, write) = stream.into_split();
        Self {
            reader: Mutex::new(BufReader::new(read)),
            writer: Mutex::new(write),
            peer,
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }
}

#[async_trait::async_trait]
impl Connection for TcpConnection {
    async fn send(&self, frame: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let closed = self.notify.notified();
        tokio::pin!(closed);
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }

        let mut reader = self.reader.lock().await;
        loop {
            let mut line = Vec::new();
            let read = tokio::select! {
                read = reader.read_until(b'\n', &mut line) => read?,
                _ = &mut closed => return Ok(None),
            };
            if read == 0 {
                return Ok(None);
            }
            while line.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Ok(Some(line));
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.notify.notify_waiters();
        let mut writer = self.writer.lock().await;
        // The peer may already be gone.
        let _ = writer.shutdown().await;
        Ok(())
    }

    fn describe(&self) -> String {
        self.peer.clone()
    }
}

pub struct TcpListener {
    inner: tokio::net::TcpListener,
    closed: AtomicBool,
    notify: Notify,
}

impl TcpListener {
    pub async fn bind(addr: &str) -> Result<Self> {
        let inner = tokio::net::TcpListener::bind(addr).await?;
        Ok(Self {
            inner,
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.inner.local_addr()?)
    }
}

#[async_trait::async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> Result<Option<Box<dyn Connection>>> {
        let closed = self.notify.notified();
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }

        tokio::select! {
            accepted = self.inner.accept() => {
                let (stream, _) = accepted?;
                stream.set_nodelay(true)?;
                Ok(Some(Box::new(TcpConnection::new(stream))))
            }
            _ = closed => Ok(None),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        Ok(())
    }
}

pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| TransportError::ConnectionLost(format!("{}: {}", self.addr, e)))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpConnection::new(stream)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let client = TcpConnector::new(addr).connect().await.unwrap();
        let server = listener.accept().await.unwrap().unwrap();

        client.send(br#"{"a":1}"#).await.unwrap();
        client.send(br#"{"b":"x\ny"}"#).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Some(br#"{"a":1}"#.to_vec()));
        assert_eq!(server.recv().await.unwrap(), Some(br#"{"b":"x\ny"}"#.to_vec()));

        client.close().await.unwrap();
        assert_eq!(server.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_delivered_as_a_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let client = TcpConnector::new(addr).connect().await.unwrap();
        let server = listener.accept().await.unwrap().unwrap();

        client.send(&[0xff, 0xfe, b'{']).await.unwrap();
        client.send(b"\r").await.unwrap();
        client.send(br#"{"a":1}"#).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Some(vec![0xff, 0xfe, b'{']));
        assert_eq!(server.recv().await.unwrap(), Some(br#"{"a":1}"#.to_vec()));
    }
}
