//! Tunnel engine bridge
//!
//! Connects the engine to the host packet flow and to the network through
//! the [`UdpSessionMultiplexer`]. A single actor task owns the engine, the
//! session table and the traffic counters. Everything that touches them
//! (host packet batches, engine output, session events, write completions,
//! timer ticks, control calls) arrives as a message on the actor's
//! channels.
//!
//! Each successful `start` opens a new epoch. Messages carrying an older
//! epoch (a pending read, an engine callback, a write completion) belong
//! to a stopped engine and are dropped.

use crate::config::{ConfigError, TunnelConfig};
use crate::engine::{EngineCallbacks, EngineError, EngineFactory, TunnelEngine};
use crate::flow::{PacketFlow, ProtocolFamily};
use crate::session::{SessionNotification, UdpSessionFactory};
use crate::udp_mux::{SessionInfo, UdpSessionMultiplexer};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Interval between engine timer ticks
pub const DEFAULT_TIMER_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeOptions {
    pub timer_interval: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            timer_interval: DEFAULT_TIMER_INTERVAL,
        }
    }
}

/// Traffic through the network side since the last `start`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
}

impl TrafficStats {
    pub fn format(&self) -> String {
        format!(
            "TX: {:.2}MB ({} datagrams), RX: {:.2}MB ({} datagrams)",
            self.bytes_sent as f64 / (1024.0 * 1024.0),
            self.datagrams_sent,
            self.bytes_received as f64 / (1024.0 * 1024.0),
            self.datagrams_received
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Bridge task is not running")]
    Closed,
}

enum BridgeCommand {
    Start {
        config: TunnelConfig,
        reply: oneshot::Sender<Result<(), BridgeError>>,
    },
    Stop,
    Stats(oneshot::Sender<TrafficStats>),
    Sessions(oneshot::Sender<Vec<SessionInfo>>),
    HostPackets {
        epoch: u64,
        packets: Vec<Vec<u8>>,
    },
    EngineSendUdp {
        epoch: u64,
        endpoint: SocketAddr,
        datagram: Vec<u8>,
    },
    EngineWriteTunnel {
        epoch: u64,
        packet: Vec<u8>,
        family: ProtocolFamily,
    },
    WriteCompleted {
        epoch: u64,
        len: usize,
        result: io::Result<()>,
    },
    Shutdown,
}

/// Handle to the bridge actor
pub struct TunnelBridge {
    commands: mpsc::UnboundedSender<BridgeCommand>,
}

impl TunnelBridge {
    /// Spawn the bridge actor on the current tokio runtime.
    pub fn spawn(
        engine_factory: Arc<dyn EngineFactory>,
        flow: Arc<dyn PacketFlow>,
        session_factory: Arc<dyn UdpSessionFactory>,
        options: BridgeOptions,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (notifications_tx, notifications_rx) = mpsc::unbounded_channel();

        let actor = BridgeActor {
            engine_factory,
            flow,
            options,
            mux: UdpSessionMultiplexer::new(session_factory, notifications_tx),
            engine: None,
            epoch: 0,
            stats: TrafficStats::default(),
            commands: commands_tx.clone(),
        };
        tokio::spawn(actor.run(commands_rx, notifications_rx));

        Self {
            commands: commands_tx,
        }
    }

    /// Start the engine with `config`, replacing a running one.
    pub async fn start(&self, config: TunnelConfig) -> Result<(), BridgeError> {
        let (reply, rx) = oneshot::channel();
        self.send(BridgeCommand::Start { config, reply })?;
        rx.await.map_err(|_| BridgeError::Closed)?
    }

    /// Restart with a new configuration. Traffic counters start over.
    pub async fn update(&self, config: TunnelConfig) -> Result<(), BridgeError> {
        self.stop();
        self.start(config).await
    }

    /// Stop the engine and cancel all sessions. Safe to call from any
    /// thread, any number of times.
    pub fn stop(&self) {
        let _ = self.commands.send(BridgeCommand::Stop);
    }

    pub async fn stats(&self) -> Result<TrafficStats, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.send(BridgeCommand::Stats(tx))?;
        rx.await.map_err(|_| BridgeError::Closed)
    }

    pub async fn sessions(&self) -> Result<Vec<SessionInfo>, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.send(BridgeCommand::Sessions(tx))?;
        rx.await.map_err(|_| BridgeError::Closed)
    }

    pub async fn session_count(&self) -> Result<usize, BridgeError> {
        Ok(self.sessions().await?.len())
    }

    fn send(&self, command: BridgeCommand) -> Result<(), BridgeError> {
        self.commands.send(command).map_err(|_| BridgeError::Closed)
    }
}

impl Drop for TunnelBridge {
    fn drop(&mut self) {
        let _ = self.commands.send(BridgeCommand::Shutdown);
    }
}

struct BridgeActor {
    engine_factory: Arc<dyn EngineFactory>,
    flow: Arc<dyn PacketFlow>,
    options: BridgeOptions,
    mux: UdpSessionMultiplexer,
    engine: Option<Box<dyn TunnelEngine>>,
    epoch: u64,
    stats: TrafficStats,
    commands: mpsc::UnboundedSender<BridgeCommand>,
}

impl BridgeActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<BridgeCommand>,
        mut notifications: mpsc::UnboundedReceiver<SessionNotification>,
    ) {
        let mut timer: Option<Interval> = None;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(BridgeCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(notification) = notifications.recv() => {
                    self.handle_notification(notification);
                }
                _ = next_tick(&mut timer) => self.tick(),
            }

            // The timer runs exactly while an engine is live.
            let running = self.engine.is_some();
            if running && timer.is_none() {
                timer = Some(self.make_timer());
            } else if !running {
                timer = None;
            }
        }

        self.stop_engine();
        debug!("Tunnel bridge task finished");
    }

    fn make_timer(&self) -> Interval {
        let period = self.options.timer_interval;
        let mut timer = time::interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        timer
    }

    fn handle_command(&mut self, command: BridgeCommand) {
        match command {
            BridgeCommand::Start { config, reply } => {
                let result = self.start_engine(config);
                if let Err(e) = &result {
                    warn!("Failed to start tunnel engine: {}", e);
                }
                let _ = reply.send(result);
            }
            BridgeCommand::Stop => self.stop_engine(),
            BridgeCommand::Stats(reply) => {
                let _ = reply.send(self.stats);
            }
            BridgeCommand::Sessions(reply) => {
                let _ = reply.send(self.mux.sessions());
            }
            BridgeCommand::HostPackets { epoch, packets } => {
                self.handle_host_packets(epoch, packets)
            }
            BridgeCommand::EngineSendUdp {
                epoch,
                endpoint,
                datagram,
            } => self.send_udp(epoch, endpoint, datagram),
            BridgeCommand::EngineWriteTunnel {
                epoch,
                packet,
                family,
            } => {
                if self.is_current(epoch) {
                    self.flow.write_packets(vec![packet], vec![family]);
                }
            }
            BridgeCommand::WriteCompleted { epoch, len, result } => {
                if !self.is_current(epoch) {
                    return;
                }
                match result {
                    Ok(()) => {
                        self.stats.bytes_sent += len as u64;
                        self.stats.datagrams_sent += 1;
                    }
                    Err(e) => warn!("Failed to send datagram: {}", e),
                }
            }
            // Handled by the run loop.
            BridgeCommand::Shutdown => {}
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.engine.is_some() && epoch == self.epoch
    }

    fn start_engine(&mut self, config: TunnelConfig) -> Result<(), BridgeError> {
        self.stop_engine();

        let params = config.engine_params()?;
        self.epoch += 1;
        let epoch = self.epoch;

        let engine = self
            .engine_factory
            .init(&params, self.engine_callbacks(epoch))
            .ok_or(EngineError::InitializationFailed)?;

        self.engine = Some(engine);
        self.stats = TrafficStats::default();
        self.mux.set_required_interface(config.required_interface);
        self.read_host_packets(epoch);

        info!("Tunnel engine started towards {}", params.peer_endpoint);
        Ok(())
    }

    fn stop_engine(&mut self) {
        self.mux.cancel_all();
        if let Some(mut engine) = self.engine.take() {
            engine.shutdown();
            self.epoch += 1;
            info!("Tunnel engine stopped ({})", self.stats.format());
        }
    }

    fn engine_callbacks(&self, epoch: u64) -> EngineCallbacks {
        let send_v4 = self.commands.clone();
        let send_v6 = self.commands.clone();
        let write_v4 = self.commands.clone();
        let write_v6 = self.commands.clone();

        EngineCallbacks::new(
            move |endpoint, datagram| {
                let _ = send_v4.send(BridgeCommand::EngineSendUdp {
                    epoch,
                    endpoint: SocketAddr::V4(endpoint),
                    datagram: datagram.to_vec(),
                });
            },
            move |endpoint, datagram| {
                let _ = send_v6.send(BridgeCommand::EngineSendUdp {
                    epoch,
                    endpoint: SocketAddr::V6(endpoint),
                    datagram: datagram.to_vec(),
                });
            },
            move |packet| {
                let _ = write_v4.send(BridgeCommand::EngineWriteTunnel {
                    epoch,
                    packet: packet.to_vec(),
                    family: ProtocolFamily::Inet,
                });
            },
            move |packet| {
                let _ = write_v6.send(BridgeCommand::EngineWriteTunnel {
                    epoch,
                    packet: packet.to_vec(),
                    family: ProtocolFamily::Inet6,
                });
            },
        )
    }

    fn read_host_packets(&self, epoch: u64) {
        let commands = self.commands.clone();
        self.flow.read_packets(Box::new(move |packets, _families| {
            let _ = commands.send(BridgeCommand::HostPackets { epoch, packets });
        }));
    }

    fn handle_host_packets(&mut self, epoch: u64, packets: Vec<Vec<u8>>) {
        if !self.is_current(epoch) {
            return;
        }
        let Some(engine) = self.engine.as_mut() else {
            return;
        };

        trace!("Read {} packets from host", packets.len());
        for packet in &packets {
            engine.handle_host_traffic(packet);
        }
        self.read_host_packets(epoch);
    }

    fn send_udp(&mut self, epoch: u64, endpoint: SocketAddr, datagram: Vec<u8>) {
        if !self.is_current(epoch) {
            return;
        }

        let commands = self.commands.clone();
        let len = datagram.len();
        self.mux.send(
            endpoint,
            datagram,
            Box::new(move |result| {
                let _ = commands.send(BridgeCommand::WriteCompleted { epoch, len, result });
            }),
        );
    }

    fn handle_notification(&mut self, notification: SessionNotification) {
        if self.engine.is_none() {
            return;
        }
        let Some(datagrams) = self.mux.handle_event(notification) else {
            return;
        };
        let Some(engine) = self.engine.as_mut() else {
            return;
        };

        for datagram in &datagrams {
            self.stats.bytes_received += datagram.len() as u64;
            self.stats.datagrams_received += 1;
            engine.handle_tunnel_traffic(datagram);
        }
    }

    fn tick(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.handle_timer_tick();
        }
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
