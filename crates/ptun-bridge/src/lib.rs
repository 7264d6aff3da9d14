//! ptun bridge - data plane of the packet tunnel
//!
//! # Architecture
//!
//! ```text
//! host packet flow ──▶ TunnelBridge ──▶ engine ──▶ UdpSessionMultiplexer ──▶ network
//!        ▲                                 │                  │
//!        └──────── decrypted packets ◀─────┘◀── datagrams ────┘
//! ```
//!
//! The engine, the packet flow and the OS UDP session API sit behind
//! traits ([`EngineFactory`], [`PacketFlow`], [`UdpSessionFactory`]).
//! [`TokioUdpSessionFactory`] provides sessions over plain tokio sockets.
//!
//! # Usage
//!
//! ```rust,ignore
//! let bridge = TunnelBridge::spawn(engines, flow, Arc::new(TokioUdpSessionFactory::new()), BridgeOptions::default());
//! bridge.start(TunnelConfig::from_toml(&config)?).await?;
//! println!("{}", bridge.stats().await?.format());
//! bridge.stop();
//! ```

mod bridge;
mod config;
mod engine;
mod flow;
mod keys;
mod session;
mod tokio_session;
mod udp_mux;

pub use bridge::{BridgeError, BridgeOptions, DEFAULT_TIMER_INTERVAL, TrafficStats, TunnelBridge};
pub use config::{ConfigError, EngineParams, PeerConfig, TunnelConfig};
pub use engine::{EngineCallbacks, EngineError, EngineFactory, TunnelEngine};
pub use flow::{PacketBatchHandler, PacketFlow, ProtocolFamily};
pub use keys::{KeyError, PrivateKey, PublicKey};
pub use session::{
    SessionEvent, SessionEventSink, SessionId, SessionNotification, SessionState,
    UdpSessionFactory, UdpSessionHandle, WriteCompletion,
};
pub use tokio_session::{DEFAULT_READ_BATCH_SIZE, TokioUdpSessionFactory};
pub use udp_mux::{SessionInfo, UdpSessionMultiplexer};
