//! Socket-backed transport drivers: TCP (`tcp`, `tcp4`, `tcp6`) and
//! Unix domain sockets (`unix`).

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use super::{Conn, DialOpts, Listener, Transport};
use crate::status::Status;

/// `":9090"` is accepted as shorthand for the loopback host.
fn normalize_dial_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("127.0.0.1{addr}")
    } else {
        addr.to_owned()
    }
}

fn family_matches(network: &str, addr: &SocketAddr) -> bool {
    match network {
        "tcp4" => addr.is_ipv4(),
        "tcp6" => addr.is_ipv6(),
        _ => true,
    }
}

/// TCP driver; the stored network name restricts the address family.
#[derive(Debug)]
pub struct TcpTransport {
    network: String,
}

impl TcpTransport {
    pub fn new(network: &str) -> Self {
        Self {
            network: network.to_owned(),
        }
    }

    async fn resolve(&self, addr: &str) -> Result<SocketAddr, Status> {
        let mut candidates = tokio::net::lookup_host(addr)
            .await
            .map_err(Status::transport_error)?;
        candidates
            .find(|a| family_matches(&self.network, a))
            .ok_or_else(|| {
                Status::transport_error(format!("no {} address for {addr:?}", self.network))
            })
    }

    async fn connect(&self, addr: &str, opts: &DialOpts) -> Result<TcpStream, Status> {
        let remote = self.resolve(addr).await?;
        let stream = match &opts.local_addr {
            Some(local) => {
                let local: SocketAddr = local
                    .parse()
                    .map_err(|e| Status::transport_error(format!("bad local addr: {e}")))?;
                let socket = if remote.is_ipv4() {
                    TcpSocket::new_v4()
                } else {
                    TcpSocket::new_v6()
                }
                .map_err(Status::transport_error)?;
                // A fixed local port must survive redials of the same peer.
                socket.set_reuseaddr(true).map_err(Status::transport_error)?;
                socket.bind(local).map_err(Status::transport_error)?;
                socket.connect(remote).await.map_err(Status::transport_error)?
            }
            None => TcpStream::connect(remote)
                .await
                .map_err(Status::transport_error)?,
        };
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn network(&self) -> &str {
        &self.network
    }

    async fn dial(&self, addr: &str, opts: &DialOpts) -> Result<Conn, Status> {
        let addr = normalize_dial_addr(addr);
        let stream = match opts.timeout {
            Some(limit) if !limit.is_zero() => {
                tokio::time::timeout(limit, self.connect(&addr, opts))
                    .await
                    .map_err(|_| Status::transport_error(format!("dial {addr:?} timed out")))??
            }
            _ => self.connect(&addr, opts).await?,
        };
        Ok(Conn {
            local_addr: stream
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            remote_addr: stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| addr.clone()),
            stream: Box::new(stream),
        })
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, Status> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(Status::transport_error)?;
        let local_addr = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_owned());
        tracing::debug!(network = %self.network, addr = %local_addr, "listening");
        Ok(Box::new(TcpAcceptor {
            listener,
            local_addr,
        }))
    }
}

struct TcpAcceptor {
    listener: TcpListener,
    local_addr: String,
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&mut self) -> Result<Conn, Status> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(Status::transport_error)?;
        let _ = stream.set_nodelay(true);
        Ok(Conn {
            local_addr: self.local_addr.clone(),
            remote_addr: peer.to_string(),
            stream: Box::new(stream),
        })
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }
}

/// Unix domain socket driver; addresses are filesystem paths.
#[cfg(unix)]
#[derive(Debug)]
pub struct UnixTransport;

#[cfg(unix)]
#[async_trait]
impl Transport for UnixTransport {
    fn network(&self) -> &str {
        "unix"
    }

    async fn dial(&self, addr: &str, opts: &DialOpts) -> Result<Conn, Status> {
        let connect = tokio::net::UnixStream::connect(addr);
        let stream = match opts.timeout {
            Some(limit) if !limit.is_zero() => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| Status::transport_error(format!("dial {addr:?} timed out")))?
                .map_err(Status::transport_error)?,
            _ => connect.await.map_err(Status::transport_error)?,
        };
        Ok(Conn {
            local_addr: "unix:".to_owned(),
            remote_addr: format!("unix:{addr}"),
            stream: Box::new(stream),
        })
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Listener>, Status> {
        let listener = tokio::net::UnixListener::bind(addr).map_err(Status::transport_error)?;
        Ok(Box::new(UnixAcceptor {
            listener,
            local_addr: format!("unix:{addr}"),
        }))
    }
}

#[cfg(unix)]
struct UnixAcceptor {
    listener: tokio::net::UnixListener,
    local_addr: String,
}

#[cfg(unix)]
#[async_trait]
impl Listener for UnixAcceptor {
    async fn accept(&mut self) -> Result<Conn, Status> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(Status::transport_error)?;
        Ok(Conn {
            local_addr: self.local_addr.clone(),
            remote_addr: "unix:".to_owned(),
            stream: Box::new(stream),
        })
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn tcp_dial_and_accept() {
        let driver = TcpTransport::new("tcp");
        let mut listener = driver.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();

        let dial = tokio::spawn(async move {
            TcpTransport::new("tcp")
                .dial(&addr, &DialOpts::default())
                .await
                .unwrap()
        });
        let mut accepted = listener.accept().await.unwrap();
        let mut dialed = dial.await.unwrap();

        dialed.stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn loopback_shorthand() {
        let driver = TcpTransport::new("tcp");
        let mut listener = driver.listen("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().rsplit(':').next().unwrap().to_owned();

        let dial = tokio::spawn(async move {
            TcpTransport::new("tcp")
                .dial(&format!(":{port}"), &DialOpts::default())
                .await
                .unwrap()
        });
        listener.accept().await.unwrap();
        dial.await.unwrap();
    }
}
