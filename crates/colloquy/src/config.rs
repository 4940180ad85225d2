//! Peer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use colloquy_core::proto::DEFAULT_READ_LIMIT;
use colloquy_core::Status;

/// Environment variable overriding the frame read limit (bytes).
pub const READ_LIMIT_ENV: &str = "COLLOQUY_READ_LIMIT";

const KNOWN_NETWORKS: &[&str] = &[
    "tcp",
    "tcp4",
    "tcp6",
    "unix",
    "unixpacket",
    "kcp",
    "quic",
    "mem",
];

/// All tunables of a [`Peer`](crate::Peer).
///
/// Zero durations mean "unbounded" (or "disabled" for
/// `slow_comet_duration`); [`PeerConfig::check`] fills in the documented
/// defaults for empty fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Network name: `tcp`, `tcp4`, `tcp6`, `unix`, `unixpacket`, `kcp`,
    /// `quic` or the in-process `mem`. Defaults to `tcp`.
    pub network: String,
    /// Bind IP for the listener and for outbound sockets. Defaults to
    /// `0.0.0.0`. For `unix` networks this is the socket path; for `mem`
    /// it is ignored.
    pub local_ip: String,
    /// Outbound local port (client role); 0 means ephemeral.
    pub local_port: u16,
    /// Server listen port.
    pub listen_port: u16,
    /// Upper bound on one dial attempt; zero means no limit.
    pub dial_timeout: Duration,
    /// Redial attempts after an unexpected disconnect: negative means
    /// unlimited, zero disables redialing.
    pub redial_times: i32,
    /// Wait between redial attempts. Defaults to 100 ms.
    pub redial_interval: Duration,
    /// Body codec name used when a call does not pick one. Defaults to
    /// `json`.
    pub default_body_codec: String,
    /// Sessions are closed this long after creation; zero means
    /// unbounded.
    pub default_session_age: Duration,
    /// Default per-CALL deadline; zero means unbounded.
    pub default_context_age: Duration,
    /// Handler completions slower than this are logged at WARN; zero
    /// disables the check.
    pub slow_comet_duration: Duration,
    /// Include body and metadata in log output.
    pub print_detail: bool,
    /// Record handler cost times in log output.
    pub count_time: bool,
    /// Maximum frame size accepted from the wire. Zero resolves to the
    /// `COLLOQUY_READ_LIMIT` environment variable, then to 1 GiB.
    pub read_limit: u32,
    /// Bound on concurrently running handlers; zero means effectively
    /// unbounded.
    pub worker_pool_capacity: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            network: String::new(),
            local_ip: String::new(),
            local_port: 0,
            listen_port: 0,
            dial_timeout: Duration::ZERO,
            redial_times: 0,
            redial_interval: Duration::ZERO,
            default_body_codec: String::new(),
            default_session_age: Duration::ZERO,
            default_context_age: Duration::ZERO,
            slow_comet_duration: Duration::ZERO,
            print_detail: false,
            count_time: false,
            read_limit: 0,
            worker_pool_capacity: 0,
        }
    }
}

impl PeerConfig {
    /// Validate the config and fill in defaults for empty fields.
    pub fn check(&mut self) -> Result<(), Status> {
        if self.network.is_empty() {
            self.network = "tcp".to_owned();
        }
        if !KNOWN_NETWORKS.contains(&self.network.as_str()) {
            return Err(Status::internal(format!(
                "invalid network config {:?}, expected one of {}",
                self.network,
                KNOWN_NETWORKS.join(", ")
            )));
        }
        if self.local_ip.is_empty() {
            self.local_ip = "0.0.0.0".to_owned();
        }
        if self.redial_interval.is_zero() {
            self.redial_interval = Duration::from_millis(100);
        }
        if self.default_body_codec.is_empty() {
            self.default_body_codec = "json".to_owned();
        }
        if self.read_limit == 0 {
            self.read_limit = env_read_limit().unwrap_or(DEFAULT_READ_LIMIT);
        }
        Ok(())
    }

    /// The address the listener binds to.
    pub fn listen_addr(&self) -> String {
        match self.network.as_str() {
            "unix" | "unixpacket" => self.local_ip.clone(),
            "mem" => self.listen_port.to_string(),
            _ => format!("{}:{}", self.local_ip, self.listen_port),
        }
    }

    /// The local address outbound sockets bind to, if one is pinned.
    pub fn dial_local_addr(&self) -> Option<String> {
        match self.network.as_str() {
            "tcp" | "tcp4" | "tcp6" if self.local_port != 0 => {
                Some(format!("{}:{}", self.local_ip, self.local_port))
            }
            _ => None,
        }
    }

    /// `dial_timeout` with zero mapped to `None`.
    pub fn dial_deadline(&self) -> Option<Duration> {
        (!self.dial_timeout.is_zero()).then_some(self.dial_timeout)
    }
}

fn env_read_limit() -> Option<u32> {
    std::env::var(READ_LIMIT_ENV)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
}
