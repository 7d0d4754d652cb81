//! Load finished / load error notifications.
//!
//! Listeners are registered per resource and run in insertion order. A
//! panicking listener is logged and skipped; the remaining listeners still
//! run.

use crate::resource::ResourceId;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Called after a load generation committed its pixels
pub type FinishedListener = Box<dyn FnMut() + Send>;

/// Called after a load generation failed, with its numeric error code
pub type ErrorListener = Box<dyn FnMut(u8) + Send>;

enum Listener {
    Finished(FinishedListener),
    Error(ErrorListener),
}

/// Ordered, typed listener registry
#[derive(Default)]
pub struct EventDispatcher {
    listeners: HashMap<ResourceId, Vec<Listener>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_load_finished(&mut self, id: ResourceId, listener: FinishedListener) {
        self.listeners
            .entry(id)
            .or_default()
            .push(Listener::Finished(listener));
    }

    pub fn on_error(&mut self, id: ResourceId, listener: ErrorListener) {
        self.listeners
            .entry(id)
            .or_default()
            .push(Listener::Error(listener));
    }

    /// Number of listeners registered for `id`
    pub fn listener_count(&self, id: ResourceId) -> usize {
        self.listeners.get(&id).map_or(0, Vec::len)
    }

    /// Run the finished listeners of `id`; returns how many ran to completion
    pub fn dispatch_finished(&mut self, id: ResourceId) -> usize {
        self.dispatch(id, "load finished", |listener| match listener {
            Listener::Finished(f) => {
                f();
                true
            }
            Listener::Error(_) => false,
        })
    }

    /// Run the error listeners of `id`; returns how many ran to completion
    pub fn dispatch_error(&mut self, id: ResourceId, code: u8) -> usize {
        self.dispatch(id, "load error", |listener| match listener {
            Listener::Error(f) => {
                f(code);
                true
            }
            Listener::Finished(_) => false,
        })
    }

    fn dispatch(
        &mut self,
        id: ResourceId,
        event: &str,
        mut call: impl FnMut(&mut Listener) -> bool,
    ) -> usize {
        let Some(listeners) = self.listeners.get_mut(&id) else {
            return 0;
        };

        let mut completed = 0;
        for (index, listener) in listeners.iter_mut().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| call(listener))) {
                Ok(true) => completed += 1,
                Ok(false) => {}
                Err(_) => {
                    tracing::error!("{} listener {} of resource {} panicked", event, index, id);
                }
            }
        }
        completed
    }
}
