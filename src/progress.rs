//! Progress reporting: a side-channel observer with no back-pressure.
//!
//! The store writes to a reporter after each chunk or cluster; observers
//! receive events over bounded channels with `try_send`, so a slow consumer
//! can never block generation.

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A progress snapshot sent to observers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// What is being generated (e.g. "features and masks: disk").
    pub task: &'static str,
    pub value: u64,
    pub max: u64,
    pub complete: bool,
}

#[derive(Default)]
struct ProgressState {
    value: u64,
    max: u64,
    complete: bool,
}

/// Settable-maximum, incrementable-value, completable progress counter.
pub struct ProgressReporter {
    task: &'static str,
    state: Mutex<ProgressState>,
    observers: Mutex<Vec<Sender<ProgressEvent>>>,
}

impl ProgressReporter {
    pub fn new(task: &'static str) -> Self {
        Self {
            task,
            state: Mutex::new(ProgressState::default()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to progress events with the given buffer size.
    pub fn subscribe(&self, buffer_size: usize) -> Receiver<ProgressEvent> {
        let (tx, rx) = bounded(buffer_size.max(1));
        self.observers.lock().push(tx);
        rx
    }

    /// Reset the counter and set a new maximum.
    pub fn set_max(&self, max: u64) {
        {
            let mut state = self.state.lock();
            state.max = max;
            state.value = 0;
            state.complete = false;
        }
        self.notify();
    }

    /// Advance the counter by one.
    pub fn increment(&self) {
        self.state.lock().value += 1;
        self.notify();
    }

    /// Mark the pass as finished.
    pub fn set_complete(&self) {
        {
            let mut state = self.state.lock();
            state.complete = true;
            state.value = state.max;
        }
        self.notify();
    }

    pub fn value(&self) -> u64 {
        self.state.lock().value
    }

    pub fn max(&self) -> u64 {
        self.state.lock().max
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    fn notify(&self) {
        let event = {
            let state = self.state.lock();
            ProgressEvent {
                task: self.task,
                value: state.value,
                max: state.max,
                complete: state.complete,
            }
        };

        // try_send only: full or disconnected observers are skipped, never
        // waited on.
        self.observers
            .lock()
            .retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(crossbeam_channel::TrySendError::Full(_)) => true,
                Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_lifecycle() {
        let pr = ProgressReporter::new("test");
        pr.set_max(3);
        assert_eq!(pr.value(), 0);
        assert!(!pr.is_complete());

        pr.increment();
        pr.increment();
        assert_eq!(pr.value(), 2);

        pr.set_complete();
        assert!(pr.is_complete());
        assert_eq!(pr.value(), 3);
    }

    #[test]
    fn test_observer_receives_events() {
        let pr = ProgressReporter::new("test");
        let rx = pr.subscribe(16);

        pr.set_max(2);
        pr.increment();
        pr.set_complete();

        let events: Vec<ProgressEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].value, 1);
        assert!(events[2].complete);
    }

    #[test]
    fn test_full_observer_never_blocks() {
        let pr = ProgressReporter::new("test");
        let _rx = pr.subscribe(1);

        // Far more events than the buffer holds; must not block or fail.
        pr.set_max(100);
        for _ in 0..100 {
            pr.increment();
        }
        pr.set_complete();
        assert!(pr.is_complete());
    }

    #[test]
    fn test_disconnected_observer_is_dropped() {
        let pr = ProgressReporter::new("test");
        let rx = pr.subscribe(4);
        drop(rx);

        pr.set_max(1);
        pr.increment();
        assert_eq!(pr.value(), 1);
    }
}
