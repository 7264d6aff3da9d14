//! Route Resolver
//!
//! Asks the OS routing table which route a destination takes, so new
//! flows can be pinned to a physical interface instead of looping back
//! into the tunnel.
//!
//! Resolution is synchronous and blocks on a routing socket; never call
//! it from the bridge's packet-processing task.

mod message;
#[cfg(any(target_os = "macos", target_os = "ios"))]
mod socket;

use std::io;
use std::net::IpAddr;
use std::sync::{Mutex, OnceLock};
use thiserror::Error;
use tracing::{debug, warn};

pub use message::{ReplyOutcome, decode_reply, encode_query};

/// Name prefix of the OS tunnel interfaces
const TUNNEL_INTERFACE_PREFIX: &str = "utun";

/// Result of one routing table lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteResolution {
    pub destination: IpAddr,
    pub gateway: Option<IpAddr>,
    pub netmask: Option<String>,
    pub interface_name: String,
    pub interface_index: u16,
}

impl RouteResolution {
    /// Whether the route leads into a tunnel interface
    pub fn is_tunnel_interface(&self) -> bool {
        self.interface_name.starts_with(TUNNEL_INTERFACE_PREFIX)
    }

    /// Pick the available interface the route goes through.
    pub fn select_interface<'a, I>(&self, available: &'a [I]) -> Option<&'a I>
    where
        I: AsRef<str>,
    {
        if self.interface_name.is_empty() {
            return None;
        }
        available
            .iter()
            .find(|iface| iface.as_ref() == self.interface_name)
    }
}

/// Route resolution errors
#[derive(Debug, Error)]
pub enum RouteResolutionError {
    #[error("Failed to open routing socket: {0}")]
    OpenSocket(#[source] io::Error),

    #[error("Failed to write into routing socket: {0}")]
    Write(#[source] io::Error),

    #[error("Failed to read from routing socket: {0}")]
    Read(#[source] io::Error),

    #[error("Invalid message length")]
    InvalidMessageLength,

    #[error("Invalid message version")]
    InvalidVersion,

    #[error("Reply contains errno: {0}")]
    MessageWithError(i32),

    #[error("No addresses returned with reply")]
    NoAddresses,

    #[error("Cannot parse destination IP")]
    ParseDestination,

    #[error("Cannot parse gateway IP")]
    ParseGateway,

    #[error("Cannot parse netmask")]
    ParseNetmask,

    #[error("Routing socket queries are not supported on this platform")]
    Unsupported,
}

impl RouteResolutionError {
    /// OS error code behind a transport failure, if any
    pub fn os_error(&self) -> Option<i32> {
        match self {
            Self::OpenSocket(e) | Self::Write(e) | Self::Read(e) => e.raw_os_error(),
            Self::MessageWithError(code) => Some(*code),
            _ => None,
        }
    }
}

/// Issues routing socket queries, tagging each with a unique sequence
/// number.
#[derive(Debug, Default)]
pub struct RouteResolver {
    sequence: Mutex<i32>,
}

impl RouteResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide resolver, so unrelated callers never reuse a sequence
    /// number.
    pub fn shared() -> &'static RouteResolver {
        static SHARED: OnceLock<RouteResolver> = OnceLock::new();
        SHARED.get_or_init(RouteResolver::new)
    }

    /// Next sequence number: strictly increasing, wrapping to 1 (never 0).
    pub fn next_sequence(&self) -> i32 {
        let mut sequence = self
            .sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *sequence = match sequence.checked_add(1) {
            Some(next) => next,
            None => 1,
        };
        *sequence
    }

    /// Look up the route to `destination`.
    pub fn resolve(&self, destination: IpAddr) -> Result<RouteResolution, RouteResolutionError> {
        let seq = self.next_sequence();
        let pid = std::process::id() as i32;

        let result = self.query(destination, pid, seq);
        match &result {
            Ok(route) => debug!(
                "Route to {} goes via {} (index {}, gateway {:?})",
                destination, route.interface_name, route.interface_index, route.gateway
            ),
            Err(e) => warn!("Failed to resolve route to {}: {}", destination, e),
        }
        result
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn query(
        &self,
        destination: IpAddr,
        pid: i32,
        seq: i32,
    ) -> Result<RouteResolution, RouteResolutionError> {
        let mut socket = socket::RoutingSocket::open().map_err(RouteResolutionError::OpenSocket)?;
        socket
            .send(&encode_query(destination, pid, seq))
            .map_err(RouteResolutionError::Write)?;

        let mut buf = vec![0u8; 4096];
        loop {
            let n = socket.recv(&mut buf).map_err(RouteResolutionError::Read)?;
            match decode_reply(&buf[..n], pid, seq, destination)? {
                ReplyOutcome::Skip => continue,
                ReplyOutcome::Resolved(route) => return Ok(route),
            }
        }
    }

    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    fn query(
        &self,
        _destination: IpAddr,
        _pid: i32,
        _seq: i32,
    ) -> Result<RouteResolution, RouteResolutionError> {
        Err(RouteResolutionError::Unsupported)
    }
}
