//! The feed worker and its public handle.

use std::sync::Arc;
use std::time::Duration;

use syntond_clock::{monotonic_now, realtime_now, ClockId, ReferenceClock};
use syntond_runtime::{reply_slot, ReplySender, Worker, WorkerHandle};
use syntond_types::MonoTime;

use crate::source::{ClockSample, SourceInner};
use crate::{FeedError, Subscription};

/// Fixed number of cycle-event subscriber slots.
pub const EVENT_SUBSCRIBER_CAPACITY: usize = 4;

/// Default sampling period: 2^-2 s = 250 ms.
pub const DEFAULT_POLL_PERIOD_LOG2: i32 = -2;

/// Emitted to registered sinks after each complete sampling cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleEvent {
    /// Cycle counter at completion.
    pub cycle: u64,
    /// Monotonic completion time.
    pub mono: MonoTime,
}

/// A named delivery endpoint for cycle-complete events.
///
/// The closure adapts the feed's event into the subscriber's own typed
/// inbox; returning the event back signals backpressure, in which case the
/// feed skips that subscriber for this cycle rather than blocking.
pub struct CycleSink {
    name: String,
    deliver: Box<dyn Fn(CycleEvent) -> Result<(), CycleEvent> + Send>,
}

impl CycleSink {
    pub fn new(
        name: impl Into<String>,
        deliver: impl Fn(CycleEvent) -> Result<(), CycleEvent> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            deliver: Box::new(deliver),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for CycleSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleSink").field("name", &self.name).finish()
    }
}

/// Messages handled by the feed worker.
pub enum FeedMsg {
    AddClock {
        clock: Arc<dyn ReferenceClock>,
        poll_period_log2: i32,
        reply: ReplySender<Result<(), FeedError>>,
    },
    RemoveClock {
        clock: ClockId,
        reply: ReplySender<Result<(), FeedError>>,
    },
    Subscribe {
        clock: ClockId,
        reply: ReplySender<Result<Subscription, FeedError>>,
    },
    SubscribeEvents {
        sink: CycleSink,
        reply: ReplySender<Result<(), FeedError>>,
    },
    UnsubscribeEvents {
        name: String,
        reply: ReplySender<Result<(), FeedError>>,
    },
}

struct SourceEntry {
    inner: Arc<SourceInner>,
    /// Ticks seen by this source; drives sub-rate sampling.
    cycles: u64,
}

/// The feed worker: samples every active source on its tick, maintains the
/// source lifecycle and fans out cycle events.
pub struct FeedWorker {
    poll_period_log2: i32,
    active: Vec<SourceEntry>,
    inactive: Vec<Arc<SourceInner>>,
    sinks: Vec<CycleSink>,
    cycle: u64,
}

impl FeedWorker {
    pub fn new(poll_period_log2: i32) -> Self {
        Self {
            poll_period_log2,
            active: Vec::new(),
            inactive: Vec::new(),
            sinks: Vec::new(),
            cycle: 0,
        }
    }

    fn find_active(&self, clock: &ClockId) -> Option<usize> {
        self.active
            .iter()
            .position(|e| e.inner.clock_id() == clock)
    }

    fn is_registered(&self, clock: &ClockId) -> bool {
        self.find_active(clock).is_some()
            || self.inactive.iter().any(|s| s.clock_id() == clock)
    }

    /// Registers a clock for periodic sampling.
    pub fn add_clock(
        &mut self,
        clock: Arc<dyn ReferenceClock>,
        poll_period_log2: i32,
    ) -> Result<(), FeedError> {
        if self.is_registered(clock.id()) {
            return Err(FeedError::AlreadyRegistered {
                clock: clock.id().to_string(),
            });
        }

        let period_log2 = if poll_period_log2 < self.poll_period_log2 {
            tracing::warn!(
                clock = %clock.id(),
                requested = poll_period_log2,
                clamped = self.poll_period_log2,
                "requested poll period shorter than feed period; clamping"
            );
            self.poll_period_log2
        } else {
            poll_period_log2
        };

        tracing::info!(clock = %clock.id(), poll_period_log2 = period_log2, "clock added to feed");
        self.active.push(SourceEntry {
            inner: Arc::new(SourceInner::new(clock, period_log2)),
            cycles: 0,
        });
        Ok(())
    }

    /// Moves a source to the inactive list; it is reclaimed once its last
    /// subscription drops.
    pub fn remove_clock(&mut self, clock: &ClockId) -> Result<(), FeedError> {
        let Some(index) = self.find_active(clock) else {
            tracing::warn!(clock = %clock, "remove of unknown clock");
            return Err(FeedError::NotFound {
                clock: clock.to_string(),
            });
        };

        let entry = self.active.swap_remove(index);
        entry.inner.mark_inactive();
        if entry.inner.subscriber_count() > 0 {
            tracing::info!(clock = %clock, "clock removed; parked until subscribers drop");
            self.inactive.push(entry.inner);
        } else {
            tracing::info!(clock = %clock, "clock removed from feed");
        }
        Ok(())
    }

    /// Opens a subscription on a registered clock. The system clock gets
    /// the null subscription.
    pub fn subscribe(&mut self, clock: &ClockId) -> Result<Subscription, FeedError> {
        if clock.is_system() {
            return Ok(Subscription::null());
        }
        if let Some(index) = self.find_active(clock) {
            return Ok(Subscription::new(Arc::clone(&self.active[index].inner)));
        }
        if let Some(source) = self.inactive.iter().find(|s| s.clock_id() == clock) {
            tracing::warn!(clock = %clock, "subscribing to an inactive source");
            return Ok(Subscription::new(Arc::clone(source)));
        }
        Err(FeedError::NotFound {
            clock: clock.to_string(),
        })
    }

    /// Registers a cycle-event sink. Capacity is fixed; exhaustion is an
    /// error for the requester, not for the feed.
    pub fn subscribe_events(&mut self, sink: CycleSink) -> Result<(), FeedError> {
        if self.sinks.len() >= EVENT_SUBSCRIBER_CAPACITY {
            return Err(FeedError::EventCapacity);
        }
        tracing::info!(subscriber = sink.name(), "cycle-event sink registered");
        self.sinks.push(sink);
        Ok(())
    }

    pub fn unsubscribe_events(&mut self, name: &str) -> Result<(), FeedError> {
        let before = self.sinks.len();
        self.sinks.retain(|s| s.name() != name);
        if self.sinks.len() == before {
            return Err(FeedError::NotFound {
                clock: name.to_string(),
            });
        }
        Ok(())
    }

    /// Runs one sampling cycle over all active sources, then notifies the
    /// cycle sinks and reaps abandoned inactive sources.
    pub fn run_cycle(&mut self) {
        for entry in &mut self.active {
            let shift = (entry.inner.poll_period_log2() - self.poll_period_log2) as u32;
            let mask = (1u64 << shift) - 1;
            if entry.cycles & mask == 0 {
                Self::sample(&entry.inner);
            }
            entry.cycles += 1;
        }
        self.cycle += 1;

        let event = CycleEvent {
            cycle: self.cycle,
            mono: monotonic_now(),
        };
        for sink in &self.sinks {
            if (sink.deliver)(event).is_err() {
                tracing::debug!(subscriber = sink.name(), "cycle event dropped: subscriber busy");
            }
        }

        self.reap();
    }

    fn sample(source: &SourceInner) {
        let compared = source.clock().compare_to_system();
        let mono = monotonic_now();
        let system = realtime_now();

        let sample = match compared {
            Ok(diff) => ClockSample {
                seq: 0, // assigned by the ring
                ok: true,
                mono,
                system,
                snapshot: system + diff,
            },
            Err(error) => {
                tracing::warn!(clock = %source.clock_id(), %error, "clock comparison failed");
                ClockSample {
                    seq: 0,
                    ok: false,
                    mono,
                    system,
                    snapshot: syntond_types::WallTime::new(0),
                }
            }
        };
        source.push_sample(sample);
    }

    fn reap(&mut self) {
        self.inactive.retain(|source| {
            let keep = source.subscriber_count() > 0;
            if !keep {
                tracing::debug!(clock = %source.clock_id(), "reclaiming abandoned source");
            }
            keep
        });
    }

    #[cfg(test)]
    fn active_count(&self) -> usize {
        self.active.len()
    }

    #[cfg(test)]
    fn inactive_count(&self) -> usize {
        self.inactive.len()
    }
}

impl Worker for FeedWorker {
    type Msg = FeedMsg;

    fn on_message(&mut self, msg: FeedMsg) {
        match msg {
            FeedMsg::AddClock {
                clock,
                poll_period_log2,
                reply,
            } => reply.send(self.add_clock(clock, poll_period_log2)),
            FeedMsg::RemoveClock { clock, reply } => reply.send(self.remove_clock(&clock)),
            FeedMsg::Subscribe { clock, reply } => reply.send(self.subscribe(&clock)),
            FeedMsg::SubscribeEvents { sink, reply } => reply.send(self.subscribe_events(sink)),
            FeedMsg::UnsubscribeEvents { name, reply } => {
                reply.send(self.unsubscribe_events(&name));
            }
        }
    }

    fn on_tick(&mut self) {
        self.run_cycle();
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(2f64.powi(self.poll_period_log2))
    }
}

/// Process-wide handle to the feed service.
///
/// The feed is initialized before any sync module starts and torn down
/// after all of them stop; modules receive a clone of this handle rather
/// than reaching for a global.
#[derive(Clone)]
pub struct FeedHandle {
    worker: Arc<WorkerHandle<FeedMsg>>,
}

impl FeedHandle {
    /// Starts the feed worker thread.
    pub fn spawn(poll_period_log2: i32) -> Self {
        let worker = syntond_runtime::spawn("syntond-feed", 32, FeedWorker::new(poll_period_log2));
        Self {
            worker: Arc::new(worker),
        }
    }

    fn request<T>(
        &self,
        build: impl FnOnce(ReplySender<Result<T, FeedError>>) -> FeedMsg,
    ) -> Result<T, FeedError> {
        let (tx, rx) = reply_slot();
        self.worker
            .send(build(tx))
            .map_err(|_| FeedError::ServiceStopped)?;
        rx.wait().map_err(|_| FeedError::ServiceStopped)?
    }

    /// Registers a clock for sampling at `2^poll_period_log2` seconds.
    pub fn add_clock(
        &self,
        clock: Arc<dyn ReferenceClock>,
        poll_period_log2: i32,
    ) -> Result<(), FeedError> {
        self.request(|reply| FeedMsg::AddClock {
            clock,
            poll_period_log2,
            reply,
        })
    }

    /// Deregisters a clock.
    pub fn remove_clock(&self, clock: &ClockId) -> Result<(), FeedError> {
        self.request(|reply| FeedMsg::RemoveClock {
            clock: clock.clone(),
            reply,
        })
    }

    /// Opens a subscription for the named clock.
    pub fn subscribe(&self, clock: &ClockId) -> Result<Subscription, FeedError> {
        self.request(|reply| FeedMsg::Subscribe {
            clock: clock.clone(),
            reply,
        })
    }

    /// Releases a subscription.
    pub fn unsubscribe(&self, subscription: Subscription) {
        // Dropping the handle releases the source's subscriber slot; the
        // feed reaps abandoned inactive sources on its next cycle.
        drop(subscription);
    }

    /// Registers a cycle-event sink.
    pub fn subscribe_events(&self, sink: CycleSink) -> Result<(), FeedError> {
        self.request(|reply| FeedMsg::SubscribeEvents { sink, reply })
    }

    /// Deregisters the cycle-event sink with the given name.
    pub fn unsubscribe_events(&self, name: &str) -> Result<(), FeedError> {
        self.request(|reply| FeedMsg::UnsubscribeEvents {
            name: name.to_string(),
            reply,
        })
    }
}
