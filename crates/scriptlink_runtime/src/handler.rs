//! Named Handler Invocation
//!
//! Replies to `emit_with_callback` are delivered to a handler chosen by name
//! on a target object. The lookup is a capability injected into each owner.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

/// Errors from invoking a named handler
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("No handler '{handler}' on target '{target}'")]
    NotFound { target: String, handler: String },

    #[error("Handler '{handler}' failed: {message}")]
    Failed { handler: String, message: String },
}

/// Invoke a handler by name on a target
pub trait HandlerInvoker: Send + Sync {
    /// Call `handler_name` on `target` with the reply as both its JSON text
    /// and its decoded value.
    fn invoke(
        &self,
        target: &str,
        handler_name: &str,
        message: &str,
        payload: &Value,
    ) -> Result<(), HandlerError>;
}

/// A handler registered in a [`HandlerTable`]
pub type NamedHandler = Arc<dyn Fn(&str, &Value) -> Result<(), String> + Send + Sync>;

/// [`HandlerInvoker`] backed by a `(target, name) -> closure` table.
///
/// Handlers run with no lock on the table held, so they may register or
/// remove handlers themselves.
#[derive(Default)]
pub struct HandlerTable {
    handlers: DashMap<(String, String), NamedHandler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same name
    pub fn register(
        &self,
        target: impl Into<String>,
        handler_name: impl Into<String>,
        handler: impl Fn(&str, &Value) -> Result<(), String> + Send + Sync + 'static,
    ) {
        self.handlers
            .insert((target.into(), handler_name.into()), Arc::new(handler));
    }

    pub fn remove(&self, target: &str, handler_name: &str) -> bool {
        self.handlers
            .remove(&(target.to_string(), handler_name.to_string()))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl HandlerInvoker for HandlerTable {
    fn invoke(
        &self,
        target: &str,
        handler_name: &str,
        message: &str,
        payload: &Value,
    ) -> Result<(), HandlerError> {
        let key = (target.to_string(), handler_name.to_string());
        let handler = self
            .handlers
            .get(&key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| HandlerError::NotFound {
                target: target.to_string(),
                handler: handler_name.to_string(),
            })?;

        handler(message, payload).map_err(|message| HandlerError::Failed {
            handler: handler_name.to_string(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_invoke_registered_handler() {
        let table = HandlerTable::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        table.register("hud", "onScore", move |msg, payload| {
            *sink.lock().unwrap() = Some((msg.to_string(), payload.clone()));
            Ok(())
        });

        table.invoke("hud", "onScore", "12", &json!(12)).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(("12".to_string(), json!(12))));
    }

    #[test]
    fn test_missing_handler_is_not_found() {
        let table = HandlerTable::new();
        table.register("hud", "onScore", |_, _| Ok(()));

        let err = table.invoke("menu", "onScore", "", &Value::Null).unwrap_err();
        assert!(matches!(err, HandlerError::NotFound { .. }));
    }

    #[test]
    fn test_handler_failure_is_reported() {
        let table = HandlerTable::new();
        table.register("hud", "onScore", |_, _| Err("bad payload".into()));

        let err = table.invoke("hud", "onScore", "", &Value::Null).unwrap_err();
        assert_eq!(
            err,
            HandlerError::Failed {
                handler: "onScore".into(),
                message: "bad payload".into()
            }
        );
    }

    #[test]
    fn test_handler_can_replace_itself() {
        let table = Arc::new(HandlerTable::new());
        let inner = Arc::clone(&table);
        table.register("hud", "onScore", move |_, _| {
            inner.register("hud", "onScore", |_, _| Err("replaced".into()));
            Ok(())
        });

        let (done_tx, done_rx) = mpsc::channel();
        let worker = Arc::clone(&table);
        std::thread::spawn(move || {
            let first = worker.invoke("hud", "onScore", "", &Value::Null);
            let second = worker.invoke("hud", "onScore", "", &Value::Null);
            let _ = done_tx.send((first, second));
        });

        let (first, second) = done_rx
            .recv_timeout(Duration::from_secs(3))
            .expect("handler registering on its own table blocked");
        assert_eq!(first, Ok(()));
        assert!(matches!(second, Err(HandlerError::Failed { .. })));
        assert_eq!(table.len(), 1);
    }
}
