//! Buffer for driver sends issued before the supervisor started.
//!
//! The queue is a `VecDeque` behind a mutex that is retired after its single
//! drain: once drained, `defer` hands every value straight back so the caller
//! delivers it directly.

use std::{
    collections::VecDeque,
    sync::{Mutex, PoisonError},
};

use serde_json::Value;

#[derive(Debug)]
pub(crate) struct SendQueue {
    // `None` once drained.
    inner: Mutex<Option<VecDeque<Value>>>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Some(VecDeque::new())),
        }
    }

    /// Enqueues `data` while the queue is live. Returns it back once the queue
    /// has been retired.
    pub fn defer(&self, data: Value) -> Option<Value> {
        match self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some(queue) => {
                queue.push_back(data);
                None
            }
            None => Some(data),
        }
    }

    /// Hands every queued value to `deliver` in FIFO order and retires the
    /// queue. The lock is held throughout so a concurrent `defer` either lands
    /// in this drain or observes the retired queue afterwards.
    ///
    /// Returns the number of values delivered; a second call delivers nothing.
    pub fn drain(&self, mut deliver: impl FnMut(Value)) -> usize {
        let mut locked = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(values) = locked.take() else {
            return 0;
        };

        let count = values.len();
        for value in values {
            deliver(value);
        }

        count
    }

    pub fn is_retired(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
