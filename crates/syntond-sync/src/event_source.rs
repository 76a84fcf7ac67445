//! Timed-event sources.
//!
//! A pulse source delivers `(sequence, hardware timestamp)` tuples. The
//! kernel-facing implementations (PHC external timestamps, PPS devices)
//! live behind this trait outside the core; the daemon itself ships the
//! queue-backed source used by simulation and tests, which is also what the
//! bogus-event test mode rides on.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use syntond_types::PulseEvent;

/// The event source failed; the instance goes faulty until a subsequent
/// read succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event source failed")]
pub struct EventSourceFault;

/// A poll-mode source of timed events.
///
/// `poll` never blocks: it returns `Ok(Some(event))` while events are
/// queued, `Ok(None)` when the source is idle, and `Err` when the source
/// itself is broken.
pub trait EventSource: Send {
    fn poll(&mut self) -> Result<Option<PulseEvent>, EventSourceFault>;
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<Result<PulseEvent, EventSourceFault>>,
}

/// Producer side of a [`QueuedPulseSource`].
///
/// Cloneable; a simulator thread pushes events (or faults) and the owning
/// sync instance drains them on its poll.
#[derive(Debug, Clone, Default)]
pub struct PulseInjector {
    state: Arc<Mutex<QueueState>>,
}

impl PulseInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one pulse event.
    pub fn push(&self, event: PulseEvent) {
        self.state
            .lock()
            .expect("pulse queue poisoned")
            .events
            .push_back(Ok(event));
    }

    /// Queues a source fault.
    pub fn push_fault(&self) {
        self.state
            .lock()
            .expect("pulse queue poisoned")
            .events
            .push_back(Err(EventSourceFault));
    }

    /// Builds the consuming source for this queue.
    pub fn source(&self) -> QueuedPulseSource {
        QueuedPulseSource {
            state: Arc::clone(&self.state),
        }
    }
}

/// Queue-backed event source.
#[derive(Debug)]
pub struct QueuedPulseSource {
    state: Arc<Mutex<QueueState>>,
}

impl EventSource for QueuedPulseSource {
    fn poll(&mut self) -> Result<Option<PulseEvent>, EventSourceFault> {
        match self
            .state
            .lock()
            .expect("pulse queue poisoned")
            .events
            .pop_front()
        {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(fault)) => Err(fault),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syntond_types::WallTime;

    #[test]
    fn poll_drains_in_order() {
        let injector = PulseInjector::new();
        let mut source = injector.source();

        injector.push(PulseEvent {
            seq: 1,
            timestamp: WallTime::new(1_000_000_000),
        });
        injector.push(PulseEvent {
            seq: 2,
            timestamp: WallTime::new(2_000_000_000),
        });

        assert_eq!(source.poll().unwrap().unwrap().seq, 1);
        assert_eq!(source.poll().unwrap().unwrap().seq, 2);
        assert_eq!(source.poll().unwrap(), None);
    }

    #[test]
    fn fault_surfaces_then_queue_continues() {
        let injector = PulseInjector::new();
        let mut source = injector.source();

        injector.push_fault();
        injector.push(PulseEvent {
            seq: 9,
            timestamp: WallTime::new(9_000_000_000),
        });

        assert_eq!(source.poll(), Err(EventSourceFault));
        assert_eq!(source.poll().unwrap().unwrap().seq, 9);
    }
}
