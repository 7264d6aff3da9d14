//! UDP session multiplexer
//!
//! Maps each destination endpoint the engine talks to onto one OS UDP
//! session, created lazily on the first datagram. Sessions live in an
//! arena keyed by [`SessionId`]; handles and events refer to them by id.
//!
//! On path migration the session keeps its id and endpoint, only the
//! handle is replaced. Every handle gets a fresh generation, so events
//! still in flight from a replaced handle are recognized and dropped.

use crate::session::{
    SessionEvent, SessionEventSink, SessionId, SessionNotification, SessionState,
    UdpSessionFactory, UdpSessionHandle, WriteCompletion,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

struct UdpSession {
    endpoint: SocketAddr,
    handle: Box<dyn UdpSessionHandle>,
    generation: u64,
    is_ready: bool,
    is_viable: bool,
}

/// Snapshot of one session for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub endpoint: SocketAddr,
    pub is_ready: bool,
    pub is_viable: bool,
}

pub struct UdpSessionMultiplexer {
    factory: Arc<dyn UdpSessionFactory>,
    required_interface: Option<String>,
    notifications: mpsc::UnboundedSender<SessionNotification>,
    sessions: HashMap<SessionId, UdpSession>,
    by_endpoint: HashMap<SocketAddr, SessionId>,
    next_id: SessionId,
    next_generation: u64,
}

impl UdpSessionMultiplexer {
    /// Create an empty multiplexer reporting to `notifications`.
    pub fn new(
        factory: Arc<dyn UdpSessionFactory>,
        notifications: mpsc::UnboundedSender<SessionNotification>,
    ) -> Self {
        Self {
            factory,
            required_interface: None,
            notifications,
            sessions: HashMap::new(),
            by_endpoint: HashMap::new(),
            next_id: 1,
            next_generation: 1,
        }
    }

    /// Interface new sessions bind to. Existing sessions are unaffected.
    pub fn set_required_interface(&mut self, interface: Option<String>) {
        self.required_interface = interface;
    }

    /// Write `datagram` to `endpoint`, creating its session if needed.
    pub fn send(
        &mut self,
        endpoint: SocketAddr,
        datagram: Vec<u8>,
        completion: WriteCompletion,
    ) -> SessionId {
        let id = match self.by_endpoint.get(&endpoint) {
            Some(&id) => id,
            None => self.create(endpoint),
        };

        if let Some(session) = self.sessions.get(&id) {
            trace!("Writing {} bytes to {}", datagram.len(), endpoint);
            session.handle.write_datagram(datagram, completion);
        }
        id
    }

    fn create(&mut self, endpoint: SocketAddr) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        let generation = self.bump_generation();

        let sink = SessionEventSink::new(id, generation, self.notifications.clone());
        let handle =
            self.factory
                .create_session(endpoint, self.required_interface.as_deref(), sink);
        debug!(
            "Created UDP session {} to {} (interface {:?})",
            id, endpoint, self.required_interface
        );

        self.sessions.insert(
            id,
            UdpSession {
                endpoint,
                handle,
                generation,
                is_ready: false,
                is_viable: true,
            },
        );
        self.by_endpoint.insert(endpoint, id);
        id
    }

    fn bump_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    /// Apply a session event. Returns datagrams received from the network.
    pub fn handle_event(&mut self, notification: SessionNotification) -> Option<Vec<Vec<u8>>> {
        let SessionNotification {
            session: id,
            generation,
            event,
        } = notification;

        let session = self.sessions.get_mut(&id)?;
        if session.generation != generation {
            trace!("Dropping stale event for session {}: {:?}", id, event);
            return None;
        }

        match event {
            SessionEvent::StateChanged(SessionState::Ready) => {
                debug!("UDP session {} to {} is ready", id, session.endpoint);
                session.is_ready = true;
            }
            SessionEvent::StateChanged(SessionState::Preparing) => {
                session.is_ready = false;
            }
            SessionEvent::StateChanged(SessionState::Failed) => {
                warn!("UDP session {} to {} failed", id, session.endpoint);
                session.is_ready = false;
            }
            SessionEvent::StateChanged(SessionState::Cancelled) => {
                debug!("UDP session {} to {} cancelled by the OS", id, session.endpoint);
                self.remove(id);
            }
            SessionEvent::ViabilityChanged(is_viable) => {
                debug!("UDP session {} viable: {}", id, is_viable);
                session.is_viable = is_viable;
            }
            SessionEvent::BetterPathAvailable => self.migrate(id),
            SessionEvent::Datagrams(datagrams) => return Some(datagrams),
            SessionEvent::ReadError(e) => {
                warn!("UDP session {} to {} read error: {}", id, session.endpoint, e);
            }
        }
        None
    }

    fn migrate(&mut self, id: SessionId) {
        let generation = self.bump_generation();
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };

        let sink = SessionEventSink::new(id, generation, self.notifications.clone());
        let upgraded = self.factory.upgrade_session(
            session.endpoint,
            self.required_interface.as_deref(),
            sink,
        );
        let previous = std::mem::replace(&mut session.handle, upgraded);
        session.generation = generation;
        session.is_ready = false;
        session.is_viable = true;
        previous.cancel();

        info!("UDP session {} to {} migrated to a better path", id, session.endpoint);
    }

    fn remove(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.remove(&id) {
            if self.by_endpoint.get(&session.endpoint) == Some(&id) {
                self.by_endpoint.remove(&session.endpoint);
            }
        }
    }

    /// Cancel and forget every session.
    pub fn cancel_all(&mut self) {
        if self.sessions.is_empty() {
            return;
        }
        debug!("Cancelling {} UDP sessions", self.sessions.len());
        for (_, session) in self.sessions.drain() {
            session.handle.cancel();
        }
        self.by_endpoint.clear();
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Session currently serving `endpoint`, if any
    pub fn session_for(&self, endpoint: &SocketAddr) -> Option<SessionId> {
        self.by_endpoint.get(endpoint).copied()
    }

    /// Snapshot of all live sessions, ordered by id
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<_> = self
            .sessions
            .iter()
            .map(|(&id, session)| SessionInfo {
                id,
                endpoint: session.endpoint,
                is_ready: session.is_ready,
                is_viable: session.is_viable,
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}
