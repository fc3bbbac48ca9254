//! Cross-thread event injection.
//!
//! The engine itself is single-threaded; other threads hand it work
//! through an [`EventInjector`], a cloneable handle onto a mutex-guarded
//! queue drained at cycle start.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use warden_types::GenId;

/// One injected operation.
#[derive(Debug, Clone)]
pub(crate) enum ExternalOp {
    /// Invoke the target's command.
    Call {
        target: GenId,
        context: Vec<Value>,
    },
    /// Emit the target.
    Emit {
        target: GenId,
        context: Vec<Value>,
    },
}

/// Thread-safe handle injecting events into the engine.
///
/// Injected operations are processed at the start of the next cycle,
/// in injection order.
///
/// # Example
///
/// ```no_run
/// # use warden_engine::EventInjector;
/// # use warden_types::GenId;
/// fn from_sensor_thread(injector: &EventInjector, obstacle: GenId) {
///     injector.emit(obstacle, vec![serde_json::json!({"distance": 0.4})]);
/// }
/// ```
#[derive(Clone, Default)]
pub struct EventInjector {
    queue: Arc<Mutex<VecDeque<ExternalOp>>>,
}

impl EventInjector {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queues a command invocation.
    pub fn call(&self, target: GenId, context: Vec<Value>) {
        self.queue
            .lock()
            .push_back(ExternalOp::Call { target, context });
    }

    /// Queues an emission.
    pub fn emit(&self, target: GenId, context: Vec<Value>) {
        self.queue
            .lock()
            .push_back(ExternalOp::Emit { target, context });
    }

    /// Number of operations waiting for the next cycle.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub(crate) fn drain(&self) -> Vec<ExternalOp> {
        self.queue.lock().drain(..).collect()
    }
}
