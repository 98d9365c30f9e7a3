use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;

/// Metadata for a message moving through the consumer.
#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Uniform failure type for the handling path: hook failures, handler
/// failures, and recovered panics all flow through it.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("{code}: {message}")]
    Hook { code: String, message: String },
    #[error("handler error: {0}")]
    Handler(String),
    #[error("panic recovered: {0}")]
    Panic(String),
}

impl HandleError {
    pub fn hook(code: &str, message: impl Into<String>) -> Self {
        Self::Hook {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Lifecycle hooks around message handling. `before_handle` may
/// rewrite the payload; returning an error skips the handler and
/// routes the message down the error path.
pub trait ConsumerHook: Send + Sync {
    fn before_handle(&self, meta: &MessageMeta, payload: Vec<u8>) -> Result<Vec<u8>, HandleError> {
        let _ = meta;
        Ok(payload)
    }

    fn after_handle(&self, meta: &MessageMeta, payload: &[u8], err: Option<&HandleError>) {
        let _ = (meta, payload, err);
    }

    fn on_error(&self, meta: &MessageMeta, payload: &[u8], err: &HandleError) {
        let _ = (meta, payload, err);
    }
}

/// Default hook: does nothing.
pub struct NoopHook;

impl ConsumerHook for NoopHook {}

/// Composes hooks with stack semantics:
/// - `before_handle` runs in order, threading the payload through; the
///   first error short-circuits and notifies every hook's `on_error`.
/// - `after_handle` runs in reverse order.
/// - `on_error` notifies every hook.
/// Every hook invocation is panic-guarded; a misbehaving hook cannot
/// crash the consumer.
pub struct HookChain {
    hooks: Vec<Arc<dyn ConsumerHook>>,
}

impl HookChain {
    pub fn new(hooks: Vec<Arc<dyn ConsumerHook>>) -> Self {
        Self { hooks }
    }

    pub fn noop() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn before_handle(
        &self,
        meta: &MessageMeta,
        mut payload: Vec<u8>,
    ) -> Result<Vec<u8>, HandleError> {
        for hook in &self.hooks {
            let input = payload.clone();
            let res = catch_unwind(AssertUnwindSafe(|| hook.before_handle(meta, input)));
            match res {
                Ok(Ok(next)) => payload = next,
                Ok(Err(err)) => {
                    self.on_error(meta, &payload, &err);
                    return Err(err);
                }
                Err(_) => {
                    let err = HandleError::Panic("before_handle hook panicked".to_string());
                    self.on_error(meta, &payload, &err);
                    return Err(err);
                }
            }
        }
        Ok(payload)
    }

    pub fn after_handle(&self, meta: &MessageMeta, payload: &[u8], err: Option<&HandleError>) {
        for hook in self.hooks.iter().rev() {
            let _ = catch_unwind(AssertUnwindSafe(|| hook.after_handle(meta, payload, err)));
        }
    }

    pub fn on_error(&self, meta: &MessageMeta, payload: &[u8], err: &HandleError) {
        for hook in &self.hooks {
            let _ = catch_unwind(AssertUnwindSafe(|| hook.on_error(meta, payload, err)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn meta() -> MessageMeta {
        MessageMeta {
            topic: "t".to_string(),
            partition: 0,
            offset: 7,
        }
    }

    /// Records each lifecycle call into a shared log for order checks.
    struct TracingHook {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_before: bool,
        panic_before: bool,
    }

    impl TracingHook {
        fn new(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                log,
                fail_before: false,
                panic_before: false,
            })
        }
    }

    impl ConsumerHook for TracingHook {
        fn before_handle(
            &self,
            _meta: &MessageMeta,
            mut payload: Vec<u8>,
        ) -> Result<Vec<u8>, HandleError> {
            self.log.lock().unwrap().push(format!("before:{}", self.name));
            if self.panic_before {
                panic!("boom");
            }
            if self.fail_before {
                return Err(HandleError::hook("ERR_VALIDATION", "rejected"));
            }
            payload.extend_from_slice(self.name.as_bytes());
            Ok(payload)
        }

        fn after_handle(&self, _meta: &MessageMeta, _payload: &[u8], _err: Option<&HandleError>) {
            self.log.lock().unwrap().push(format!("after:{}", self.name));
        }

        fn on_error(&self, _meta: &MessageMeta, _payload: &[u8], _err: &HandleError) {
            self.log.lock().unwrap().push(format!("error:{}", self.name));
        }
    }

    #[test]
    fn before_runs_in_order_and_threads_payload() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = HookChain::new(vec![
            TracingHook::new("a", log.clone()),
            TracingHook::new("b", log.clone()),
        ]);
        let out = chain.before_handle(&meta(), b"p:".to_vec()).unwrap();
        assert_eq!(out, b"p:ab");
        assert_eq!(*log.lock().unwrap(), vec!["before:a", "before:b"]);
    }

    #[test]
    fn after_runs_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = HookChain::new(vec![
            TracingHook::new("a", log.clone()),
            TracingHook::new("b", log.clone()),
        ]);
        chain.after_handle(&meta(), b"", None);
        assert_eq!(*log.lock().unwrap(), vec!["after:b", "after:a"]);
    }

    #[test]
    fn before_error_short_circuits_and_notifies_every_hook() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing = Arc::new(TracingHook {
            name: "bad",
            log: log.clone(),
            fail_before: true,
            panic_before: false,
        });
        let chain = HookChain::new(vec![
            TracingHook::new("a", log.clone()),
            failing,
            TracingHook::new("z", log.clone()),
        ]);
        let err = chain.before_handle(&meta(), Vec::new()).unwrap_err();
        assert!(matches!(err, HandleError::Hook { .. }));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "before:a",
                "before:bad",
                "error:a",
                "error:bad",
                "error:z"
            ]
        );
    }

    #[test]
    fn panicking_hook_is_contained_and_reported() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let panicking = Arc::new(TracingHook {
            name: "p",
            log: log.clone(),
            fail_before: false,
            panic_before: true,
        });
        let chain = HookChain::new(vec![panicking, TracingHook::new("z", log.clone())]);
        let err = chain.before_handle(&meta(), Vec::new()).unwrap_err();
        assert!(matches!(err, HandleError::Panic(_)));
        // Both hooks were still notified of the error.
        let log = log.lock().unwrap();
        assert!(log.contains(&"error:p".to_string()));
        assert!(log.contains(&"error:z".to_string()));
    }

    #[test]
    fn empty_chain_passes_payload_through() {
        let chain = HookChain::noop();
        let out = chain.before_handle(&meta(), b"x".to_vec()).unwrap();
        assert_eq!(out, b"x");
        chain.after_handle(&meta(), b"x", None);
        chain.on_error(&meta(), b"x", &HandleError::Handler("e".to_string()));
    }
}
