//! The abstract transport contract and the driver registry.
//!
//! A transport turns network names and addresses into connected byte
//! streams. The framework ships drivers for `tcp`/`tcp4`/`tcp6`,
//! `unix` (on unix targets) and the in-process `mem` network; other
//! names (`kcp`, `quic`, `unixpacket`, …) resolve only if a driver has
//! been registered with [`register_driver`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::status::Status;

pub mod mem;
pub mod stream;

/// A connected, reliable, ordered byte stream.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// Boxed stream handed to the session layer.
pub type BoxIoStream = Box<dyn IoStream>;

/// A freshly dialed or accepted connection.
pub struct Conn {
    pub stream: BoxIoStream,
    pub local_addr: String,
    pub remote_addr: String,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// Options for one dial attempt.
#[derive(Clone, Debug, Default)]
pub struct DialOpts {
    /// Local address to bind the outbound socket to, when the driver
    /// supports it. `None` or a wildcard address means "ephemeral".
    pub local_addr: Option<String>,
    /// Upper bound on the attempt; `None` means no limit.
    pub timeout: Option<Duration>,
}

/// A transport driver: listen and dial for one network family.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// The network name this driver serves (`"tcp"`, `"unix"`, …).
    fn network(&self) -> &str;

    /// Connect to `addr`.
    async fn dial(&self, addr: &str, opts: &DialOpts) -> Result<Conn, Status>;

    /// Bind a listener on `addr`.
    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, Status>;
}

/// An accept loop's source of inbound connections.
#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> Result<Conn, Status>;
    fn local_addr(&self) -> String;
}

static DRIVERS: RwLock<BTreeMap<String, Arc<dyn Transport>>> = RwLock::new(BTreeMap::new());

/// Register an external transport driver for its network name.
///
/// Built-in names cannot be overridden; registering a driver for a name
/// that already resolves fails.
pub fn register_driver(driver: Arc<dyn Transport>) -> Result<(), Status> {
    let name = driver.network().to_owned();
    if builtin(&name).is_some() {
        return Err(Status::internal(format!(
            "transport driver {name:?} is built in"
        )));
    }
    let mut drivers = DRIVERS.write();
    if drivers.contains_key(&name) {
        return Err(Status::internal(format!(
            "transport driver {name:?} already registered"
        )));
    }
    drivers.insert(name, driver);
    Ok(())
}

fn builtin(network: &str) -> Option<Arc<dyn Transport>> {
    match network {
        "tcp" | "tcp4" | "tcp6" => Some(Arc::new(stream::TcpTransport::new(network))),
        #[cfg(unix)]
        "unix" => Some(Arc::new(stream::UnixTransport)),
        "mem" => Some(Arc::new(mem::MemTransport)),
        _ => None,
    }
}

/// Resolve the driver for a network name.
pub fn for_network(network: &str) -> Result<Arc<dyn Transport>, Status> {
    if let Some(driver) = builtin(network) {
        return Ok(driver);
    }
    DRIVERS.read().get(network).cloned().ok_or_else(|| {
        Status::transport_error(format!("no transport driver for network {network:?}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_networks_resolve() {
        for net in ["tcp", "tcp4", "tcp6", "mem"] {
            assert!(for_network(net).is_ok(), "{net} should resolve");
        }
    }

    #[test]
    fn unregistered_networks_fail() {
        let err = for_network("kcp").unwrap_err();
        assert_eq!(err.code(), crate::status::code::TRANSPORT_ERROR);
    }
}
