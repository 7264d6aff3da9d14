//! Serial worker queue
//!
//! A named thread owning some state `S` and running posted jobs against
//! it one at a time, in posting order. Client and server both use one so
//! their state never needs a lock.

use crate::error::IpcError;
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use tracing::{debug, error};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

enum QueueMessage<S> {
    Run(Job<S>),
    Shutdown,
}

/// Handle to a serial worker. Cloning yields another handle to the same
/// worker.
pub struct SerialQueue<S> {
    name: String,
    tx: Sender<QueueMessage<S>>,
}

impl<S> Clone for SerialQueue<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<S: Send + 'static> SerialQueue<S> {
    /// Spawn the worker. `make_state` receives a handle to the queue being
    /// created so the state can post follow-up jobs to itself.
    pub fn spawn<F>(name: &str, make_state: F) -> Result<Self, IpcError>
    where
        F: FnOnce(SerialQueue<S>) -> S,
    {
        let (tx, rx) = unbounded();
        let queue = Self {
            name: name.to_string(),
            tx,
        };
        let state = make_state(queue.clone());

        let thread_name = name.to_string();
        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                debug!("Queue {} started", thread_name);
                run_queue_loop(&thread_name, state, rx);
                debug!("Queue {} stopped", thread_name);
            })?;

        Ok(queue)
    }

    /// Enqueue `job` without waiting for it.
    pub fn post<F>(&self, job: F) -> Result<(), IpcError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.tx
            .send(QueueMessage::Run(Box::new(job)))
            .map_err(|_| IpcError::QueueClosed)
    }

    /// Run `job` on the worker and wait for its result.
    ///
    /// Must not be called from a job running on the same queue.
    pub fn query<R, F>(&self, job: F) -> Result<R, IpcError>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = bounded(1);
        self.post(move |state| {
            let _ = reply_tx.send(job(state));
        })?;
        reply_rx.recv().map_err(|_| IpcError::QueueClosed)
    }

    /// Stop the worker after the jobs already posted.
    pub fn shutdown(&self) {
        if self.tx.send(QueueMessage::Shutdown).is_ok() {
            debug!("Shutdown requested for queue {}", self.name);
        }
    }
}

fn run_queue_loop<S>(name: &str, mut state: S, rx: Receiver<QueueMessage<S>>) {
    while let Ok(message) = rx.recv() {
        let job = match message {
            QueueMessage::Run(job) => job,
            QueueMessage::Shutdown => break,
        };

        // A panicking job must not take the whole queue down with it.
        let result = panic::catch_unwind(AssertUnwindSafe(|| job(&mut state)));
        if let Err(panic_info) = result {
            let message = if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!("Job on queue {} panicked: {}", name, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_in_order() {
        let queue = SerialQueue::spawn("test-order", |_| Vec::new()).unwrap();
        for i in 0..100 {
            queue.post(move |v: &mut Vec<i32>| v.push(i)).unwrap();
        }
        let seen = queue.query(|v| v.clone()).unwrap();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        queue.shutdown();
    }

    #[test]
    fn test_state_can_post_to_itself() {
        struct Counter {
            queue: SerialQueue<Counter>,
            hits: u32,
        }

        let queue = SerialQueue::spawn("test-self", |queue| Counter { queue, hits: 0 }).unwrap();
        queue
            .post(|c: &mut Counter| {
                c.hits += 1;
                let _ = c.queue.post(|c| c.hits += 10);
            })
            .unwrap();

        // The follow-up was posted before this query.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.query(|c| c.hits).unwrap(), 11);
        queue.shutdown();
    }

    #[test]
    fn test_panicking_job_is_isolated() {
        let queue = SerialQueue::spawn("test-panic", |_| 0u32).unwrap();
        queue.post(|_| panic!("boom")).unwrap();
        queue.post(|n| *n += 1).unwrap();
        assert_eq!(queue.query(|n| *n).unwrap(), 1);
        queue.shutdown();
    }

    #[test]
    fn test_post_after_shutdown_fails() {
        let queue = SerialQueue::spawn("test-shutdown", |_| ()).unwrap();
        queue.shutdown();

        // Wait for the worker to drop its receiver.
        for _ in 0..100 {
            if queue.post(|_| {}).is_err() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("queue still accepting jobs after shutdown");
    }
}
