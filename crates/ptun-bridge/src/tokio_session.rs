//! UDP sessions over tokio sockets
//!
//! Each session is one task owning a connected `UdpSocket`. Writes are
//! queued to the task and go out in order; received datagrams are
//! reported in batches of up to `read_batch_size`.

use crate::session::{
    SessionEvent, SessionEventSink, SessionState, UdpSessionFactory, UdpSessionHandle,
    WriteCompletion,
};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Upper bound on datagrams reported in one batch
pub const DEFAULT_READ_BATCH_SIZE: usize = 2000;

const MAX_DATAGRAM_SIZE: usize = 65535;

type WriteRequest = (Vec<u8>, WriteCompletion);

/// Creates sessions on the current tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioUdpSessionFactory {
    read_batch_size: usize,
}

impl TokioUdpSessionFactory {
    pub fn new() -> Self {
        Self::with_read_batch_size(DEFAULT_READ_BATCH_SIZE)
    }

    /// Factory reporting at most `read_batch_size` datagrams per batch
    pub fn with_read_batch_size(read_batch_size: usize) -> Self {
        Self {
            read_batch_size: read_batch_size.max(1),
        }
    }
}

impl Default for TokioUdpSessionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpSessionFactory for TokioUdpSessionFactory {
    fn create_session(
        &self,
        endpoint: SocketAddr,
        required_interface: Option<&str>,
        sink: SessionEventSink,
    ) -> Box<dyn UdpSessionHandle> {
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_session(
            endpoint,
            required_interface.map(str::to_string),
            sink.clone(),
            writes_rx,
            self.read_batch_size,
        ));

        Box::new(TokioUdpSession {
            writes: writes_tx,
            task,
            sink,
        })
    }
}

struct TokioUdpSession {
    writes: mpsc::UnboundedSender<WriteRequest>,
    task: JoinHandle<()>,
    sink: SessionEventSink,
}

impl UdpSessionHandle for TokioUdpSession {
    fn write_datagram(&self, datagram: Vec<u8>, completion: WriteCompletion) {
        if let Err(mpsc::error::SendError((_, completion))) = self.writes.send((datagram, completion))
        {
            completion(Err(io::Error::from(io::ErrorKind::NotConnected)));
        }
    }

    fn cancel(&self) {
        if !self.task.is_finished() {
            self.task.abort();
            self.sink
                .emit(SessionEvent::StateChanged(SessionState::Cancelled));
        }
    }
}

impl Drop for TokioUdpSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn connect(endpoint: SocketAddr, required_interface: Option<&str>) -> io::Result<UdpSocket> {
    let local: SocketAddr = match endpoint {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    if let Some(interface) = required_interface {
        bind_to_interface(&socket, interface)?;
    }
    socket.connect(endpoint).await?;
    Ok(socket)
}

#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
fn bind_to_interface(socket: &UdpSocket, interface: &str) -> io::Result<()> {
    socket.bind_device(Some(interface.as_bytes()))
}

#[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
fn bind_to_interface(_socket: &UdpSocket, interface: &str) -> io::Result<()> {
    debug!("Interface binding unsupported here, ignoring {}", interface);
    Ok(())
}

async fn run_session(
    endpoint: SocketAddr,
    required_interface: Option<String>,
    sink: SessionEventSink,
    mut writes: mpsc::UnboundedReceiver<WriteRequest>,
    read_batch_size: usize,
) {
    sink.emit(SessionEvent::StateChanged(SessionState::Preparing));

    let socket = match connect(endpoint, required_interface.as_deref()).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Failed to open UDP session to {}: {}", endpoint, e);
            sink.emit(SessionEvent::StateChanged(SessionState::Failed));
            sink.emit(SessionEvent::ViabilityChanged(false));
            // Keep failing writes until the session is cancelled.
            while let Some((_, completion)) = writes.recv().await {
                completion(Err(io::Error::new(e.kind(), e.to_string())));
            }
            return;
        }
    };

    debug!("UDP session to {} ready", endpoint);
    sink.emit(SessionEvent::StateChanged(SessionState::Ready));
    sink.emit(SessionEvent::ViabilityChanged(true));

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            write = writes.recv() => {
                let Some((datagram, completion)) = write else {
                    break;
                };
                completion(socket.send(&datagram).await.map(|_| ()));
            }
            result = socket.recv(&mut buf) => match result {
                Ok(n) => {
                    let batch = read_batch(&socket, &mut buf, n, read_batch_size, &sink);
                    if !sink.emit(SessionEvent::Datagrams(batch)) {
                        break;
                    }
                }
                Err(e) => {
                    if !sink.emit(SessionEvent::ReadError(e.to_string())) {
                        break;
                    }
                }
            },
        }
    }
    debug!("UDP session to {} closed", endpoint);
}

/// Collect the datagram already in `buf` plus whatever else is queued.
fn read_batch(
    socket: &UdpSocket,
    buf: &mut [u8],
    first: usize,
    limit: usize,
    sink: &SessionEventSink,
) -> Vec<Vec<u8>> {
    let mut batch = vec![buf[..first].to_vec()];
    while batch.len() < limit {
        match socket.try_recv(buf) {
            Ok(n) => batch.push(buf[..n].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                sink.emit(SessionEvent::ReadError(e.to_string()));
                break;
            }
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionNotification;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionNotification>) -> SessionEvent {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap().event
    }

    async fn wait_ready(rx: &mut mpsc::UnboundedReceiver<SessionNotification>) {
        loop {
            if next_event(rx).await == SessionEvent::StateChanged(SessionState::Ready) {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_round_trip_over_loopback() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let factory = TokioUdpSessionFactory::new();
        let session = factory.create_session(
            peer.local_addr().unwrap(),
            None,
            SessionEventSink::new(1, 1, tx),
        );
        wait_ready(&mut rx).await;

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        session.write_datagram(
            b"handshake".to_vec(),
            Box::new(move |result| {
                let _ = done_tx.send(result.is_ok());
            }),
        );
        assert!(timeout(WAIT, done_rx).await.unwrap().unwrap());

        let mut buf = [0u8; 64];
        let (n, from) = timeout(WAIT, peer.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"handshake");

        peer.send_to(b"response", from).await.unwrap();
        loop {
            if let SessionEvent::Datagrams(batch) = next_event(&mut rx).await {
                assert_eq!(batch, vec![b"response".to_vec()]);
                break;
            }
        }
        session.cancel();
    }

    #[tokio::test]
    async fn test_writes_keep_order() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = TokioUdpSessionFactory::new().create_session(
            peer.local_addr().unwrap(),
            None,
            SessionEventSink::new(1, 1, tx),
        );

        for i in 0..10u8 {
            session.write_datagram(vec![i], Box::new(|_| {}));
        }
        wait_ready(&mut rx).await;

        let mut buf = [0u8; 8];
        for i in 0..10u8 {
            let n = timeout(WAIT, peer.recv(&mut buf)).await.unwrap().unwrap();
            assert_eq!(&buf[..n], &[i]);
        }
    }

    #[tokio::test]
    async fn test_cancel_reports_and_fails_later_writes() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = TokioUdpSessionFactory::new().create_session(
            peer.local_addr().unwrap(),
            None,
            SessionEventSink::new(1, 1, tx),
        );
        wait_ready(&mut rx).await;

        session.cancel();
        loop {
            if next_event(&mut rx).await == SessionEvent::StateChanged(SessionState::Cancelled) {
                break;
            }
        }

        // Give the runtime a moment to tear the task down.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        session.write_datagram(
            vec![1],
            Box::new(move |result| {
                let _ = done_tx.send(result.is_err());
            }),
        );
        assert!(timeout(WAIT, done_rx).await.unwrap().unwrap());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_unknown_interface_fails_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = TokioUdpSessionFactory::new().create_session(
            "127.0.0.1:9".parse().unwrap(),
            Some("ptun-missing0"),
            SessionEventSink::new(1, 1, tx),
        );

        assert_eq!(
            next_event(&mut rx).await,
            SessionEvent::StateChanged(SessionState::Preparing)
        );
        assert_eq!(
            next_event(&mut rx).await,
            SessionEvent::StateChanged(SessionState::Failed)
        );
        assert_eq!(
            next_event(&mut rx).await,
            SessionEvent::ViabilityChanged(false)
        );

        for _ in 0..2 {
            let (done_tx, done_rx) = tokio::sync::oneshot::channel();
            session.write_datagram(
                vec![1],
                Box::new(move |result| {
                    let _ = done_tx.send(result.is_err());
                }),
            );
            assert!(timeout(WAIT, done_rx).await.unwrap().unwrap());
        }
        session.cancel();
    }
}
