//! Bounded multi-producer multi-consumer FIFO queue.
//!
//! Each provider gets one of these; dispatchers are the producers and the
//! provider's workers are the consumers. `tokio::sync::mpsc` is single
//! consumer, so the pool's shared-consumer discipline lives here: a mutexed
//! deque plus two [`Notify`] wakers, with waiters registered before the state
//! check so wakeups cannot be lost.
//!
//! Closing the queue stops admissions immediately; items already buffered
//! stay receivable until drained, matching the wind-down semantics the worker
//! pool relies on.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

pub enum TrySendError<T> {
    Full(T),
    Closed(T),
}

impl<T> TrySendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(item) | TrySendError::Closed(item) => item,
        }
    }
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    recv_notify: Notify,
    send_notify: Notify,
}

pub struct RequestQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for RequestQueue<T> {
    fn clone(&self) -> Self {
        RequestQueue {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> RequestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RequestQueue {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: VecDeque::with_capacity(capacity),
                    closed: false,
                }),
                capacity,
                recv_notify: Notify::new(),
                send_notify: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().unwrap().closed
    }

    /// Non-blocking admission.
    pub fn try_send(&self, item: T) -> Result<(), TrySendError<T>> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return Err(TrySendError::Closed(item));
            }
            if state.items.len() >= self.shared.capacity {
                return Err(TrySendError::Full(item));
            }
            state.items.push_back(item);
        }
        self.shared.recv_notify.notify_waiters();
        Ok(())
    }

    /// Blocking admission: waits for space. Returns the item back if the
    /// queue closes while waiting.
    pub async fn send(&self, mut item: T) -> Result<(), T> {
        loop {
            let notified = self.shared.send_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock().unwrap();
                if state.closed {
                    return Err(item);
                }
                if state.items.len() < self.shared.capacity {
                    state.items.push_back(item);
                    drop(state);
                    self.shared.recv_notify.notify_waiters();
                    return Ok(());
                }
            }

            notified.await;
            // Space may have been claimed by another sender; loop and retry.
        }
    }

    /// Waits for the next item. Returns `None` once the queue is closed and
    /// drained.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.shared.recv_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock().unwrap();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.shared.send_notify.notify_waiters();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Removes and returns everything currently buffered, leaving the queue
    /// open. Used by hot reconfiguration to transfer buffered work.
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = {
            let mut state = self.shared.state.lock().unwrap();
            state.items.drain(..).collect()
        };
        if !drained.is_empty() {
            self.shared.send_notify.notify_waiters();
        }
        drained
    }

    /// Stops admissions and wakes every waiter. Idempotent; buffered items
    /// remain receivable.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.shared.recv_notify.notify_waiters();
        self.shared.send_notify.notify_waiters();
    }
}
