//! ptun IPC - request/response channel between the host app and the
//! tunnel extension
//!
//! The extension can only answer messages, never initiate them. The
//! client therefore keeps a window of open `FillBuffer` requests on the
//! server, and the server pushes events by answering them.

mod client;
mod command;
mod error;
mod queue;
mod server;
mod transport;

pub use client::{ClientEvent, ClientState, IpcClient};
pub use command::{IpcAction, IpcCommand, IpcReply, SERVER_BUFFER_SIZE, decode, encode};
pub use error::IpcError;
pub use queue::SerialQueue;
pub use server::IpcServer;
pub use transport::{InProcessTransport, ProviderTransport, ReplyHandler};
