//! Shared FIFO between the ingestion loop and the AI workers.
//!
//! Capacity policy: `enqueue` never blocks. When a bounded queue is full the
//! request is handed back inside `QueueError::Full` so the caller can tell
//! the user the system is overloaded. A capacity of `0` means unbounded.
//!
//! `shutdown` stops new enqueues and wakes every suspended `dequeue`. Items
//! already buffered are still handed out, so workers can drain in-flight work
//! before they observe the end of the queue.

use crate::request::Request;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("request queue is full (capacity {capacity})")]
    Full {
        request: Box<Request>,
        capacity: usize,
    },

    #[error("request queue is shut down")]
    Closed { request: Box<Request> },
}

impl QueueError {
    /// Returns the rejected request to the caller.
    pub fn into_request(self) -> Request {
        match self {
            Self::Full { request, .. } | Self::Closed { request } => *request,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Request>,
    closed: bool,
}

#[derive(Debug)]
pub struct RequestQueue {
    state: Mutex<QueueState>,
    available: Notify,
    capacity: usize,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            capacity,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn enqueue(&self, request: Request) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::Closed {
                    request: Box::new(request),
                });
            }
            if self.capacity > 0 && state.items.len() >= self.capacity {
                return Err(QueueError::Full {
                    request: Box::new(request),
                    capacity: self.capacity,
                });
            }
            state.items.push_back(request);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Waits for the next request. Returns `None` once the queue has been
    /// shut down and every buffered request has been handed out.
    ///
    /// Cancel safe: a request is only removed when this future completes.
    pub async fn dequeue(&self) -> Option<Request> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent enqueue or
            // shutdown cannot slip between the check and the wait.
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(request) = state.items.pop_front() {
                    if !state.items.is_empty() {
                        self.available.notify_one();
                    }
                    return Some(request);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Non-blocking variant of `dequeue`.
    pub fn try_dequeue(&self) -> Option<Request> {
        self.lock().items.pop_front()
    }

    /// Idempotent. Rejects further enqueues and releases all waiting consumers.
    pub fn shutdown(&self) {
        let newly_closed = {
            let mut state = self.lock();
            let newly_closed = !state.closed;
            state.closed = true;
            newly_closed
        };
        if newly_closed {
            tracing::info!(depth = self.len(), "request queue shut down");
        }
        self.available.notify_waiters();
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().closed
    }

    /// Current number of buffered requests, for backpressure decisions.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured bound, `0` when unbounded.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
