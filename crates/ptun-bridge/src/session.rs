//! UDP session interface
//!
//! The OS hands out connected UDP sessions and reports their state
//! changes asynchronously. Here those reports are events sent through a
//! [`SessionEventSink`], tagged with the session id and the generation of
//! the handle that produced them.

use std::io;
use std::net::SocketAddr;
use tokio::sync::mpsc;

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Preparing,
    Ready,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// A better network path exists; the session should be upgraded
    BetterPathAvailable,
    ViabilityChanged(bool),
    Datagrams(Vec<Vec<u8>>),
    ReadError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionNotification {
    pub session: SessionId,
    pub generation: u64,
    pub event: SessionEvent,
}

/// Where a session handle reports its events
#[derive(Debug, Clone)]
pub struct SessionEventSink {
    session: SessionId,
    generation: u64,
    tx: mpsc::UnboundedSender<SessionNotification>,
}

impl SessionEventSink {
    pub fn new(
        session: SessionId,
        generation: u64,
        tx: mpsc::UnboundedSender<SessionNotification>,
    ) -> Self {
        Self {
            session,
            generation,
            tx,
        }
    }

    /// Returns false once nobody listens anymore.
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.tx
            .send(SessionNotification {
                session: self.session,
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Called once a datagram write finished
pub type WriteCompletion = Box<dyn FnOnce(io::Result<()>) + Send>;

pub trait UdpSessionHandle: Send {
    /// Queue `datagram`. Writes go out in call order.
    fn write_datagram(&self, datagram: Vec<u8>, completion: WriteCompletion);

    fn cancel(&self);
}

pub trait UdpSessionFactory: Send + Sync {
    fn create_session(
        &self,
        endpoint: SocketAddr,
        required_interface: Option<&str>,
        sink: SessionEventSink,
    ) -> Box<dyn UdpSessionHandle>;

    /// Session over the better path announced for `endpoint`.
    fn upgrade_session(
        &self,
        endpoint: SocketAddr,
        required_interface: Option<&str>,
        sink: SessionEventSink,
    ) -> Box<dyn UdpSessionHandle> {
        self.create_session(endpoint, required_interface, sink)
    }
}
