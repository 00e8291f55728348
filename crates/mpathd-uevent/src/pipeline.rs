use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

use crate::event::Uevent;

/// Shared state of the listener → dispatcher handoff.
///
/// One value owns the queue, its condition, and the servicing flag; both
/// entry points ([`listen`](UeventPipeline::listen) and
/// [`dispatch`](UeventPipeline::dispatch)) borrow it, and quiescence
/// probes go through [`is_busy`](UeventPipeline::is_busy).
pub struct UeventPipeline {
    state: Mutex<PipelineState>,
    wakeup: Condvar,
}

struct PipelineState {
    pending: VecDeque<Uevent>,
    servicing: bool,
    shutdown: bool,
}

impl UeventPipeline {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PipelineState {
                pending: VecDeque::new(),
                servicing: false,
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        }
    }

    /// True while events are queued or a service pass is running.
    pub fn is_busy(&self) -> bool {
        let state = self.lock();
        !state.pending.is_empty() || state.servicing
    }

    /// Ask both loops to wind down. The dispatcher wakes immediately and
    /// releases anything still queued; the listener exits on its next
    /// poll wakeup.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.wakeup.notify_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shutdown
    }

    /// Splice a whole staging batch onto the queue tail and wake the
    /// dispatcher. Listener-insertion order is preserved.
    pub(crate) fn append_batch(&self, batch: &mut Vec<Uevent>) {
        let mut state = self.lock();
        state.pending.extend(batch.drain(..));
        self.wakeup.notify_one();
    }

    /// Block until events are queued, then take the whole queue as one
    /// snapshot. Returns `None` once the pipeline is shut down, after
    /// releasing anything still pending.
    pub(crate) fn drain_wait(&self) -> Option<Vec<Uevent>> {
        let mut state = self.lock();
        state.servicing = false;
        loop {
            if state.shutdown {
                let leftover: Vec<_> = state.pending.drain(..).collect();
                drop(state);
                drop(leftover);
                return None;
            }
            if !state.pending.is_empty() {
                break;
            }
            state = self.wakeup.wait(state).expect("pipeline lock poisoned");
        }
        state.servicing = true;
        Some(state.pending.drain(..).collect())
    }

    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state.lock().expect("pipeline lock poisoned")
    }
}

impl Default for UeventPipeline {
    fn default() -> Self {
        Self::new()
    }
}
