//! Tunnel engine interface
//!
//! The engine is opaque: it consumes raw packets and emits packets through
//! the callbacks it was initialized with. Callbacks may fire from inside
//! any `handle_*` call and must not call back into the engine.

use crate::config::EngineParams;
use std::net::{SocketAddrV4, SocketAddrV6};

type SendUdpV4 = Box<dyn Fn(SocketAddrV4, &[u8]) + Send + Sync>;
type SendUdpV6 = Box<dyn Fn(SocketAddrV6, &[u8]) + Send + Sync>;
type WriteTunnel = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Outputs of the engine
pub struct EngineCallbacks {
    send_udp_v4: SendUdpV4,
    send_udp_v6: SendUdpV6,
    write_tunnel_v4: WriteTunnel,
    write_tunnel_v6: WriteTunnel,
}

impl EngineCallbacks {
    pub fn new(
        send_udp_v4: impl Fn(SocketAddrV4, &[u8]) + Send + Sync + 'static,
        send_udp_v6: impl Fn(SocketAddrV6, &[u8]) + Send + Sync + 'static,
        write_tunnel_v4: impl Fn(&[u8]) + Send + Sync + 'static,
        write_tunnel_v6: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Self {
        Self {
            send_udp_v4: Box::new(send_udp_v4),
            send_udp_v6: Box::new(send_udp_v6),
            write_tunnel_v4: Box::new(write_tunnel_v4),
            write_tunnel_v6: Box::new(write_tunnel_v6),
        }
    }

    /// Encrypted datagram for the network
    pub fn send_udp_v4(&self, endpoint: SocketAddrV4, datagram: &[u8]) {
        (self.send_udp_v4)(endpoint, datagram)
    }

    /// Encrypted datagram for an IPv6 endpoint
    pub fn send_udp_v6(&self, endpoint: SocketAddrV6, datagram: &[u8]) {
        (self.send_udp_v6)(endpoint, datagram)
    }

    /// Decrypted packet for the host
    pub fn write_tunnel_v4(&self, packet: &[u8]) {
        (self.write_tunnel_v4)(packet)
    }

    /// Decrypted IPv6 packet for the host
    pub fn write_tunnel_v6(&self, packet: &[u8]) {
        (self.write_tunnel_v6)(packet)
    }
}

/// A live engine instance. Dropped after `shutdown`.
pub trait TunnelEngine: Send {
    /// Encrypted datagram received from the network
    fn handle_tunnel_traffic(&mut self, datagram: &[u8]);

    /// Plaintext packet read from the host
    fn handle_host_traffic(&mut self, packet: &[u8]);

    /// Periodic handshake and keepalive housekeeping
    fn handle_timer_tick(&mut self);

    fn shutdown(&mut self);
}

/// Creates engines. `None` means initialization failed.
pub trait EngineFactory: Send + Sync {
    fn init(&self, params: &EngineParams, callbacks: EngineCallbacks) -> Option<Box<dyn TunnelEngine>>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Tunnel engine failed to initialize")]
    InitializationFailed,
}
