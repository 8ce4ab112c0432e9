//! Topic-keyed fan-out of supervisor events to embedder callbacks.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use serde_json::Value;

/// Topic carrying `EMIT` payloads from the driver.
pub const EMIT: &str = "emit";
/// Topic fired once when the pool terminates. `null` on a clean shutdown,
/// the error message otherwise.
pub const CLOSE: &str = "close";
/// Topic carrying `{workerId, error}` for every `WORKER_ERROR`.
pub const WORKER_ERROR: &str = "worker_error";

pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Shared between the supervisor (`on`/`off`) and the router (`emit`).
#[derive(Clone, Default)]
pub struct ListenerBus {
    listeners: Arc<Mutex<HashMap<String, Vec<Callback>>>>,
}

impl fmt::Debug for ListenerBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let topics: HashMap<&str, usize> = listeners
            .iter()
            .map(|(topic, callbacks)| (topic.as_str(), callbacks.len()))
            .collect();

        f.debug_struct("ListenerBus").field("topics", &topics).finish()
    }
}

impl ListenerBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, topic: impl Into<String>, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.into())
            .or_default()
            .push(Arc::new(callback));
    }

    /// Drops every callback registered for `topic`.
    pub fn off(&self, topic: &str) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);
    }

    /// Runs every callback for `topic` in registration order on the calling
    /// task. A panicking callback is not caught.
    pub fn emit(&self, topic: &str, payload: &Value) {
        // Callbacks run without the lock held so they may call `on`/`off`.
        let callbacks = match self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
        {
            Some(callbacks) => callbacks.clone(),
            None => return,
        };

        tracing::trace!(topic, listeners = callbacks.len(), "emitting");
        for callback in &callbacks {
            callback(payload);
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn callbacks_run_in_registration_order() {
        let bus = ListenerBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            bus.on(EMIT, move |payload: &Value| {
                seen.lock().unwrap().push(format!("{tag}:{payload}"));
            });
        }

        bus.emit(EMIT, &json!("hello"));
        bus.emit(CLOSE, &Value::Null);

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:\"hello\"".to_string(), "second:\"hello\"".to_string()]
        );
    }

    #[test]
    fn off_removes_the_whole_topic() {
        let bus = ListenerBus::new();
        let seen = Arc::new(Mutex::new(0));

        for _ in 0..2 {
            let seen = seen.clone();
            bus.on(EMIT, move |_: &Value| *seen.lock().unwrap() += 1);
        }

        bus.off(EMIT);
        bus.off(EMIT);
        bus.emit(EMIT, &json!(1));

        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[test]
    #[should_panic(expected = "misregistered")]
    fn callback_panics_propagate() {
        let bus = ListenerBus::new();
        bus.on(CLOSE, |_: &Value| panic!("misregistered"));
        bus.emit(CLOSE, &Value::Null);
    }
}
