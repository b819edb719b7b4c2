//! Engine telemetry hooks.
//!
//! Hooks are observer callbacks registered by the embedding application:
//! token-level, generation-completed, and stream-closed. Every hook runs
//! inside a swallow-and-log guard; a panicking hook is logged and dropped for
//! the rest of the process lifetime, and generation is never aborted by a
//! hook.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::warn;

use strand_types::{GenerationStats, StreamChunk, StreamCloseReason, StreamId};

type TokenHook = Arc<dyn Fn(&StreamChunk) + Send + Sync>;
type CompletedHook = Arc<dyn Fn(&GenerationStats) + Send + Sync>;
type ClosedHook = Arc<dyn Fn(StreamId, StreamCloseReason) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    on_token: Vec<TokenHook>,
    on_completed: Vec<CompletedHook>,
    on_closed: Vec<ClosedHook>,
}

/// Shared hook registry. Cheap to clone.
#[derive(Clone, Default)]
pub struct Telemetry {
    hooks: Arc<Mutex<Hooks>>,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hooks = self.hooks.lock().expect("telemetry mutex poisoned");
        f.debug_struct("Telemetry")
            .field("token_hooks", &hooks.on_token.len())
            .field("completed_hooks", &hooks.on_completed.len())
            .finish()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_token(&self, hook: impl Fn(&StreamChunk) + Send + Sync + 'static) {
        self.hooks
            .lock()
            .expect("telemetry mutex poisoned")
            .on_token
            .push(Arc::new(hook));
    }

    pub fn on_completed(&self, hook: impl Fn(&GenerationStats) + Send + Sync + 'static) {
        self.hooks
            .lock()
            .expect("telemetry mutex poisoned")
            .on_completed
            .push(Arc::new(hook));
    }

    pub fn on_closed(&self, hook: impl Fn(StreamId, StreamCloseReason) + Send + Sync + 'static) {
        self.hooks
            .lock()
            .expect("telemetry mutex poisoned")
            .on_closed
            .push(Arc::new(hook));
    }

    pub fn emit_token(&self, chunk: &StreamChunk) {
        let hooks = self.hooks.lock().expect("telemetry mutex poisoned").on_token.clone();
        for hook in hooks {
            guard("token", || hook(chunk));
        }
    }

    pub fn emit_completed(&self, stats: &GenerationStats) {
        let hooks = self
            .hooks
            .lock()
            .expect("telemetry mutex poisoned")
            .on_completed
            .clone();
        for hook in hooks {
            guard("completed", || hook(stats));
        }
    }

    pub fn emit_closed(&self, stream_id: StreamId, reason: StreamCloseReason) {
        let hooks = self.hooks.lock().expect("telemetry mutex poisoned").on_closed.clone();
        for hook in hooks {
            guard("closed", || hook(stream_id, reason));
        }
    }
}

/// Run one hook; a panic is logged, never propagated.
fn guard(kind: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!(hook = kind, "telemetry hook panicked; ignoring");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chunk() -> StreamChunk {
        StreamChunk {
            stream_id: StreamId::fresh(),
            token: "t".into(),
            token_id: None,
            logprob: None,
            cumulative_text: None,
            is_final: None,
        }
    }

    #[test]
    fn hooks_fire_in_registration_order() {
        let telemetry = Telemetry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            telemetry.on_token(move |_| order.lock().unwrap().push(tag));
        }
        telemetry.emit_token(&chunk());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn panicking_hook_does_not_stop_the_rest() {
        let telemetry = Telemetry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        telemetry.on_token(|_| panic!("hook exploded"));
        {
            let fired = Arc::clone(&fired);
            telemetry.on_token(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        telemetry.emit_token(&chunk());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
