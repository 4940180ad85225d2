//! In-process transport over `tokio::io::duplex` pipes.
//!
//! Addresses are arbitrary names in a process-wide table. Mainly for
//! tests: a peer can listen and dial itself without touching the
//! network stack.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::{Conn, DialOpts, Listener, Transport};
use crate::status::Status;

const DUPLEX_BUF: usize = 64 * 1024;

static LISTENERS: RwLock<BTreeMap<String, mpsc::UnboundedSender<Conn>>> =
    RwLock::new(BTreeMap::new());
static CONN_SEQ: AtomicU64 = AtomicU64::new(1);

/// The `mem` network driver.
#[derive(Debug)]
pub struct MemTransport;

#[async_trait]
impl Transport for MemTransport {
    fn network(&self) -> &str {
        "mem"
    }

    async fn dial(&self, addr: &str, _opts: &DialOpts) -> Result<Conn, Status> {
        let tx = LISTENERS
            .read()
            .get(addr)
            .cloned()
            .ok_or_else(|| Status::transport_error(format!("mem:{addr}: connection refused")))?;

        let (ours, theirs) = tokio::io::duplex(DUPLEX_BUF);
        let n = CONN_SEQ.fetch_add(1, Ordering::Relaxed);
        let local_addr = format!("mem:conn-{n}");
        let remote_addr = format!("mem:{addr}");

        tx.send(Conn {
            stream: Box::new(theirs),
            local_addr: remote_addr.clone(),
            remote_addr: local_addr.clone(),
        })
        .map_err(|_| Status::transport_error(format!("mem:{addr}: listener gone")))?;

        Ok(Conn {
            stream: Box::new(ours),
            local_addr,
            remote_addr,
        })
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, Status> {
        let mut listeners = LISTENERS.write();
        if listeners.contains_key(addr) {
            return Err(Status::transport_error(format!(
                "mem:{addr}: address in use"
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(addr.to_owned(), tx);
        Ok(Box::new(MemListener {
            addr: addr.to_owned(),
            rx,
        }))
    }
}

struct MemListener {
    addr: String,
    rx: mpsc::UnboundedReceiver<Conn>,
}

#[async_trait]
impl Listener for MemListener {
    async fn accept(&mut self) -> Result<Conn, Status> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| Status::transport_error("mem listener closed"))
    }

    fn local_addr(&self) -> String {
        format!("mem:{}", self.addr)
    }
}

impl Drop for MemListener {
    fn drop(&mut self) {
        LISTENERS.write().remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_reaches_listener() {
        let driver = MemTransport;
        let mut listener = driver.listen("dial-reaches-listener").await.unwrap();

        let mut dialed = driver
            .dial("dial-reaches-listener", &DialOpts::default())
            .await
            .unwrap();
        let mut accepted = listener.accept().await.unwrap();

        dialed.stream.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn dial_without_listener_is_refused() {
        let err = MemTransport
            .dial("nobody-home", &DialOpts::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::status::code::TRANSPORT_ERROR);
    }

    #[tokio::test]
    async fn dropping_the_listener_frees_the_name() {
        let driver = MemTransport;
        let listener = driver.listen("freed-name").await.unwrap();
        drop(listener);
        driver.listen("freed-name").await.unwrap();
    }
}
