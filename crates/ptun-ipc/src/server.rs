//! IPC server (extension side)
//!
//! The host cannot be messaged directly, so it keeps a window of
//! `FillBuffer` commands open here. Each event the server pushes consumes
//! one of them. When only one would remain after a push, that last one is
//! answered with `NeedBuffer` so the host refills the window.

use crate::command::{IpcAction, IpcCommand, IpcReply, decode, encode};
use crate::error::IpcError;
use crate::queue::SerialQueue;
use crate::transport::ReplyHandler;
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};

struct BufferedCommand {
    command: IpcCommand<IpcAction>,
    reply: ReplyHandler,
}

struct ServerCore {
    buffered: VecDeque<BufferedCommand>,
}

impl ServerCore {
    fn handle(&mut self, command: IpcCommand<IpcAction>, reply: ReplyHandler) {
        match command.action {
            IpcAction::Start => self.start(reply),
            IpcAction::FillBuffer => self.buffer(command, reply),
        }
    }

    fn start(&mut self, reply: ReplyHandler) {
        if !self.buffered.is_empty() {
            debug!("Dropping {} buffered commands on restart", self.buffered.len());
        }
        self.buffered.clear();
        respond(reply, IpcReply::ServerStarted);
    }

    fn buffer(&mut self, command: IpcCommand<IpcAction>, reply: ReplyHandler) {
        match self.buffered.iter_mut().find(|b| b.command == command) {
            Some(existing) => {
                warn!("Command {} buffered twice, keeping the latest reply", command.id);
                existing.reply = reply;
            }
            None => self.buffered.push_back(BufferedCommand { command, reply }),
        }
    }

    fn dequeue(&mut self) -> Result<ReplyHandler, IpcError> {
        let first = self.buffered.pop_front().ok_or(IpcError::BufferUnderflow)?;
        if self.buffered.len() == 1 {
            self.request_buffer();
        }
        Ok(first.reply)
    }

    fn request_buffer(&mut self) {
        if let Some(last) = self.buffered.pop_front() {
            debug!("Asking the host to refill the buffer");
            respond(last.reply, IpcReply::NeedBuffer);
        }
    }

    fn send_reconnected_to(&mut self, endpoint: String) -> Result<(), IpcError> {
        let reply = self.dequeue()?;
        info!("Notifying host of reconnection to {}", endpoint);
        respond(reply, IpcReply::Reconnected(endpoint));
        Ok(())
    }
}

fn respond(reply: ReplyHandler, action: IpcReply) {
    match encode(&IpcCommand::new(action)) {
        Ok(bytes) => reply(Some(bytes)),
        Err(e) => {
            error!("Failed to encode reply: {}", e);
            reply(None);
        }
    }
}

/// Extension-side endpoint. All state lives on one serial queue.
pub struct IpcServer {
    queue: SerialQueue<ServerCore>,
}

impl IpcServer {
    /// Spawn the server queue with an empty window.
    pub fn new() -> Result<Self, IpcError> {
        let queue = SerialQueue::spawn("ipc-server", |_| ServerCore {
            buffered: VecDeque::new(),
        })?;
        Ok(Self { queue })
    }

    /// Accept a decoded command from the host.
    pub fn handle(&self, command: IpcCommand<IpcAction>, reply: ReplyHandler) -> Result<(), IpcError> {
        self.queue.post(move |core| core.handle(command, reply))
    }

    /// Accept a raw message from the host.
    pub fn handle_message(&self, payload: &[u8], reply: ReplyHandler) -> Result<(), IpcError> {
        let command = decode::<IpcAction>(payload)?;
        self.handle(command, reply)
    }

    /// Push a reconnection event to the host through one buffered slot.
    ///
    /// Fails with [`IpcError::BufferUnderflow`] when the host has not
    /// refilled the window in time. Blocks the calling thread until the
    /// server queue has run the push, so never call it from a tokio worker
    /// or from a job on the server queue; use
    /// [`IpcServer::post_reconnected_to`] there.
    pub fn send_reconnected_to(&self, endpoint: impl Into<String>) -> Result<(), IpcError> {
        let endpoint = endpoint.into();
        self.queue.query(move |core| core.send_reconnected_to(endpoint))?
    }

    /// Non-blocking [`IpcServer::send_reconnected_to`]. `on_result` runs on
    /// the server queue once the push has been attempted.
    pub fn post_reconnected_to<F>(&self, endpoint: impl Into<String>, on_result: F) -> Result<(), IpcError>
    where
        F: FnOnce(Result<(), IpcError>) + Send + 'static,
    {
        let endpoint = endpoint.into();
        self.queue
            .post(move |core| on_result(core.send_reconnected_to(endpoint)))
    }

    /// Number of slots currently held
    pub fn buffered_count(&self) -> Result<usize, IpcError> {
        self.queue.query(|core| core.buffered.len())
    }

    /// Drop all buffered slots without answering them.
    pub fn stop(&self) -> Result<(), IpcError> {
        self.queue.post(|core| core.buffered.clear())
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.queue.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{Receiver, unbounded};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(2);

    fn recorder() -> (impl Fn() -> ReplyHandler, Receiver<Option<IpcReply>>) {
        let (tx, rx) = unbounded();
        let make = move || -> ReplyHandler {
            let tx = tx.clone();
            Box::new(move |data: Option<Vec<u8>>| {
                let reply = data.map(|bytes| decode::<IpcReply>(&bytes).unwrap().action);
                let _ = tx.send(reply);
            })
        };
        (make, rx)
    }

    fn fill(server: &IpcServer, make: &impl Fn() -> ReplyHandler, count: usize) {
        for _ in 0..count {
            server
                .handle(IpcCommand::new(IpcAction::FillBuffer), make())
                .unwrap();
        }
    }

    #[test]
    fn test_start_replies_and_clears() {
        let server = IpcServer::new().unwrap();
        let (make, rx) = recorder();

        fill(&server, &make, 3);
        assert_eq!(server.buffered_count().unwrap(), 3);

        server
            .handle(IpcCommand::new(IpcAction::Start), make())
            .unwrap();
        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            Some(IpcReply::ServerStarted)
        );
        assert_eq!(server.buffered_count().unwrap(), 0);
    }

    #[test]
    fn test_push_consumes_oldest_slot() {
        let server = IpcServer::new().unwrap();
        let (make, rx) = recorder();
        fill(&server, &make, 5);

        server.send_reconnected_to("10.0.0.1:51820").unwrap();
        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            Some(IpcReply::Reconnected("10.0.0.1:51820".into()))
        );
        assert_eq!(server.buffered_count().unwrap(), 4);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_need_buffer_when_one_slot_left() {
        let server = IpcServer::new().unwrap();
        let (make, rx) = recorder();
        fill(&server, &make, 5);

        for i in 0..3 {
            server.send_reconnected_to(format!("endpoint-{}", i)).unwrap();
            assert!(matches!(
                rx.recv_timeout(TIMEOUT).unwrap(),
                Some(IpcReply::Reconnected(_))
            ));
        }
        assert_eq!(server.buffered_count().unwrap(), 2);

        // Popping one leaves exactly one: it is spent on NeedBuffer.
        server.send_reconnected_to("endpoint-3").unwrap();
        assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Some(IpcReply::NeedBuffer));
        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            Some(IpcReply::Reconnected("endpoint-3".into()))
        );
        assert_eq!(server.buffered_count().unwrap(), 0);
    }

    #[test]
    fn test_push_without_slots_underflows() {
        let server = IpcServer::new().unwrap();
        assert!(matches!(
            server.send_reconnected_to("10.0.0.1:51820"),
            Err(IpcError::BufferUnderflow)
        ));
    }

    #[test]
    fn test_posted_push_reports_result() {
        let server = IpcServer::new().unwrap();
        let (make, rx) = recorder();
        let (result_tx, result_rx) = unbounded();

        let tx = result_tx.clone();
        server
            .post_reconnected_to("10.0.0.1:51820", move |result| {
                let _ = tx.send(result);
            })
            .unwrap();
        assert!(matches!(
            result_rx.recv_timeout(TIMEOUT).unwrap(),
            Err(IpcError::BufferUnderflow)
        ));

        fill(&server, &make, 5);
        server
            .post_reconnected_to("10.0.0.1:51820", move |result| {
                let _ = result_tx.send(result);
            })
            .unwrap();
        assert!(result_rx.recv_timeout(TIMEOUT).unwrap().is_ok());
        assert_eq!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            Some(IpcReply::Reconnected("10.0.0.1:51820".into()))
        );
    }

    #[test]
    fn test_duplicate_command_replaces_reply() {
        let server = IpcServer::new().unwrap();
        let (make, rx) = recorder();
        let command = IpcCommand::new(IpcAction::FillBuffer);

        server.handle(command.clone(), make()).unwrap();
        server.handle(command, make()).unwrap();
        assert_eq!(server.buffered_count().unwrap(), 1);

        server.send_reconnected_to("10.0.0.1:51820").unwrap();
        assert!(matches!(
            rx.recv_timeout(TIMEOUT).unwrap(),
            Some(IpcReply::Reconnected(_))
        ));
        // The replaced handler was dropped unanswered.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_handle_message_rejects_garbage() {
        let server = IpcServer::new().unwrap();
        let (make, _rx) = recorder();
        assert!(matches!(
            server.handle_message(b"not json", make()),
            Err(IpcError::Codec(_))
        ));
    }

    #[test]
    fn test_stop_drops_slots() {
        let server = IpcServer::new().unwrap();
        let (make, rx) = recorder();
        fill(&server, &make, 5);

        server.stop().unwrap();
        assert_eq!(server.buffered_count().unwrap(), 0);
        assert!(rx.try_recv().is_err());
    }
}
