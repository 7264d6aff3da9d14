//! Message transport between the host app and the tunnel extension

use crate::command::{IpcAction, decode};
use crate::error::IpcError;
use crate::server::IpcServer;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// One-shot reply callback. `None` means the other side is gone.
pub type ReplyHandler = Box<dyn FnOnce(Option<Vec<u8>>) + Send>;

/// Host-side channel to the extension.
///
/// `reply` is invoked at most once, at any later time and on any thread.
/// Dropping it without invoking it means no reply will ever come.
pub trait ProviderTransport: Send + Sync {
    fn send_provider_message(&self, payload: Vec<u8>, reply: ReplyHandler) -> Result<(), IpcError>;
}

/// Transport delivering straight into an [`IpcServer`] in the same process.
pub struct InProcessTransport {
    server: RwLock<Option<Arc<IpcServer>>>,
}

impl InProcessTransport {
    /// Connect to `server`.
    pub fn new(server: Arc<IpcServer>) -> Self {
        Self {
            server: RwLock::new(Some(server)),
        }
    }

    /// Simulate the extension going away: later messages are answered
    /// with no data.
    pub fn disconnect(&self) {
        let mut server = self
            .server
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *server = None;
    }
}

impl ProviderTransport for InProcessTransport {
    fn send_provider_message(&self, payload: Vec<u8>, reply: ReplyHandler) -> Result<(), IpcError> {
        let server = self
            .server
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let Some(server) = server else {
            debug!("Extension disconnected, answering with no data");
            reply(None);
            return Ok(());
        };

        let command = decode::<IpcAction>(&payload)?;
        server.handle(command, reply)
    }
}
