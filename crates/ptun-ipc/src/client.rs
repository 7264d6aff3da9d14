//! IPC client (host side)
//!
//! Starts the server, keeps its reply window filled, and turns pushed
//! replies into [`ClientEvent`]s. Commands are sent from one serial
//! queue; decoded replies are dispatched from a second one so a slow
//! event consumer never stalls the sends.

use crate::command::{IpcAction, IpcCommand, IpcReply, SERVER_BUFFER_SIZE, decode, encode};
use crate::error::IpcError;
use crate::queue::SerialQueue;
use crate::transport::{ProviderTransport, ReplyHandler};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Stopped,
    WaitingForServerStart,
    FillingServerBuffer,
    Standby,
}

/// Events surfaced to the host application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The tunnel reconnected to this endpoint
    Reconnected(String),
    /// The server window was (re)filled with this many commands
    BufferFilled { commands: usize },
    /// The extension answered with no data; the client is stopped
    ServerGone,
}

struct ClientCore {
    state: ClientState,
    buffer_size: usize,
    transport: Arc<dyn ProviderTransport>,
    commands: SerialQueue<ClientCore>,
    replies: SerialQueue<()>,
    events: Sender<ClientEvent>,
}

impl ClientCore {
    fn start(&mut self) {
        if self.state != ClientState::Stopped {
            debug!("IPC client already running ({:?})", self.state);
            return;
        }
        self.state = ClientState::WaitingForServerStart;
        self.send(IpcCommand::new(IpcAction::Start));
    }

    fn stop(&mut self) {
        self.state = ClientState::Stopped;
    }

    fn server_did_start(&mut self) {
        if self.state != ClientState::WaitingForServerStart {
            warn!("Unexpected server start while {:?}", self.state);
            return;
        }
        self.fill_server_buffer();
    }

    fn need_buffer(&mut self) {
        if self.state == ClientState::Stopped {
            return;
        }
        self.fill_server_buffer();
    }

    fn fill_server_buffer(&mut self) {
        self.state = ClientState::FillingServerBuffer;
        let mut sent = 0;
        for _ in 0..self.buffer_size {
            self.send(IpcCommand::new(IpcAction::FillBuffer));
            if self.state == ClientState::Stopped {
                return;
            }
            sent += 1;
        }
        self.state = ClientState::Standby;
        debug!("Filled server buffer with {} commands", sent);
        let _ = self.events.send(ClientEvent::BufferFilled { commands: sent });
    }

    fn server_gone(&mut self) {
        if self.state == ClientState::Stopped {
            return;
        }
        warn!("Extension went away, stopping IPC client");
        self.state = ClientState::Stopped;
        let _ = self.events.send(ClientEvent::ServerGone);
    }

    fn send(&mut self, command: IpcCommand<IpcAction>) {
        let payload = match encode(&command) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode command {}: {}", command.id, e);
                return;
            }
        };

        let commands = self.commands.clone();
        let replies = self.replies.clone();
        let events = self.events.clone();
        let reply: ReplyHandler = Box::new(move |data| match data {
            None => {
                let _ = commands.post(|core| core.server_gone());
            }
            Some(bytes) => match decode::<IpcReply>(&bytes) {
                Ok(reply) => {
                    let _ = replies.post(move |_| dispatch_reply(reply, &commands, &events));
                }
                Err(e) => warn!("Ignoring undecodable reply: {}", e),
            },
        });

        if let Err(e) = self.transport.send_provider_message(payload, reply) {
            warn!("Failed to send command {}: {}", command.id, e);
            self.server_gone();
        }
    }
}

fn dispatch_reply(
    reply: IpcCommand<IpcReply>,
    commands: &SerialQueue<ClientCore>,
    events: &Sender<ClientEvent>,
) {
    match reply.action {
        IpcReply::ServerStarted => {
            let _ = commands.post(|core| core.server_did_start());
        }
        IpcReply::NeedBuffer => {
            let _ = commands.post(|core| core.need_buffer());
        }
        IpcReply::Reconnected(endpoint) => {
            info!("Tunnel reconnected to {}", endpoint);
            let _ = events.send(ClientEvent::Reconnected(endpoint));
        }
    }
}

/// Host-side IPC endpoint
pub struct IpcClient {
    commands: SerialQueue<ClientCore>,
    replies: SerialQueue<()>,
}

impl IpcClient {
    /// Create a stopped client with the default window size.
    pub fn new(
        transport: Arc<dyn ProviderTransport>,
    ) -> Result<(Self, Receiver<ClientEvent>), IpcError> {
        Self::with_buffer_size(transport, SERVER_BUFFER_SIZE)
    }

    /// Like [`IpcClient::new`] with a custom window size.
    pub fn with_buffer_size(
        transport: Arc<dyn ProviderTransport>,
        buffer_size: usize,
    ) -> Result<(Self, Receiver<ClientEvent>), IpcError> {
        let (events_tx, events_rx) = unbounded();
        let replies = SerialQueue::spawn("ipc-client-replies", |_| ())?;
        let reply_handle = replies.clone();
        let commands = SerialQueue::spawn("ipc-client-commands", move |commands| ClientCore {
            state: ClientState::Stopped,
            buffer_size,
            transport,
            commands,
            replies: reply_handle,
            events: events_tx,
        })?;

        Ok((Self { commands, replies }, events_rx))
    }

    /// Start the server and fill its window. No-op unless stopped.
    pub fn start(&self) -> Result<(), IpcError> {
        self.commands.post(|core| core.start())
    }

    /// Stop reacting to server replies. Restartable with [`IpcClient::start`].
    pub fn stop(&self) -> Result<(), IpcError> {
        self.commands.post(|core| core.stop())
    }

    /// Current lifecycle state, read on the command queue.
    pub fn state(&self) -> Result<ClientState, IpcError> {
        self.commands.query(|core| core.state)
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        self.commands.shutdown();
        self.replies.shutdown();
    }
}
