//! Named worker threads with an inbox and a periodic tick.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::Inbox;

/// A module body run on its own worker thread.
///
/// The harness serializes everything: inbox messages are handled one at a
/// time, and `on_tick` fires between messages when the tick interval has
/// elapsed. Handlers must not block; synchronous callers are waiting on
/// reply slots.
pub trait Worker: Send + 'static {
    type Msg: Send + 'static;

    /// Handles one inbound message.
    fn on_message(&mut self, msg: Self::Msg);

    /// Runs one periodic tick.
    fn on_tick(&mut self);

    /// Interval between ticks.
    fn tick_interval(&self) -> Duration;

    /// Called once after the loop exits, before the thread terminates.
    fn on_shutdown(&mut self) {}
}

enum Directive<M> {
    Message(M),
    Shutdown,
}

/// Handle to a spawned worker: send messages, then shut down and join.
///
/// Dropping the handle shuts the worker down.
pub struct WorkerHandle<M> {
    name: String,
    inbox: Arc<Inbox<Directive<M>>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl<M> WorkerHandle<M> {
    /// Enqueues a message, waking the worker. Returns the message when the
    /// inbox is full.
    pub fn send(&self, msg: M) -> Result<(), M> {
        match self.inbox.send(Directive::Message(msg)) {
            Ok(()) => {
                self.unpark();
                Ok(())
            }
            Err(Directive::Message(msg)) => Err(msg),
            Err(Directive::Shutdown) => unreachable!("send() only enqueues messages"),
        }
    }

    fn unpark(&self) {
        if let Some(handle) = &self.thread {
            handle.thread().unpark();
        }
    }

    /// Queues the shutdown directive. The inbox may be momentarily full;
    /// the worker is draining it, so spinning here terminates unless the
    /// thread already died, which the loop also checks.
    fn signal_shutdown(&self) {
        loop {
            let finished = self.thread.as_ref().map_or(true, thread::JoinHandle::is_finished);
            if finished || self.inbox.send(Directive::Shutdown).is_ok() {
                break;
            }
            self.unpark();
            thread::yield_now();
        }
        self.unpark();
    }

    /// Stops the worker and joins its thread. Idempotent.
    pub fn shutdown(&mut self) {
        if self.thread.is_none() {
            return;
        }
        self.signal_shutdown();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!(worker = %self.name, "worker thread panicked");
            }
        }
    }
}

impl<M> Drop for WorkerHandle<M> {
    fn drop(&mut self) {
        if self.thread.is_none() {
            return;
        }
        self.signal_shutdown();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Spawns `worker` on a named thread with a bounded inbox.
///
/// # Panics
///
/// Panics if the OS refuses to spawn the thread.
pub fn spawn<W: Worker>(name: &str, inbox_capacity: usize, mut worker: W) -> WorkerHandle<W::Msg> {
    let inbox: Arc<Inbox<Directive<W::Msg>>> = Arc::new(Inbox::new(inbox_capacity));
    let loop_inbox = Arc::clone(&inbox);
    let thread_name = name.to_string();

    let handle = thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let mut next_tick = Instant::now() + worker.tick_interval();
            loop {
                // Drain the inbox before looking at the clock so message
                // handling latency stays bounded by handler cost alone.
                let mut stop = false;
                while let Some(directive) = loop_inbox.try_recv() {
                    match directive {
                        Directive::Message(msg) => worker.on_message(msg),
                        Directive::Shutdown => {
                            stop = true;
                            break;
                        }
                    }
                }
                if stop {
                    break;
                }

                let now = Instant::now();
                if now >= next_tick {
                    worker.on_tick();
                    // Schedule from the intended instant, not from now, so
                    // ticks do not drift under load.
                    next_tick += worker.tick_interval();
                    if next_tick < now {
                        next_tick = now + worker.tick_interval();
                    }
                } else {
                    thread::park_timeout(next_tick - now);
                }
            }
            worker.on_shutdown();
        })
        .expect("failed to spawn worker thread");

    WorkerHandle {
        name: name.to_string(),
        inbox,
        thread: Some(handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    struct Recorder {
        messages: Arc<Mutex<Vec<u32>>>,
        ticks: Arc<AtomicU64>,
        shutdowns: Arc<AtomicU64>,
    }

    impl Worker for Recorder {
        type Msg = u32;

        fn on_message(&mut self, msg: u32) {
            self.messages.lock().unwrap().push(msg);
        }

        fn on_tick(&mut self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }

        fn tick_interval(&self) -> Duration {
            Duration::from_millis(5)
        }

        fn on_shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn messages_are_handled_in_order() {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let worker = Recorder {
            messages: Arc::clone(&messages),
            ticks: Arc::new(AtomicU64::new(0)),
            shutdowns: Arc::new(AtomicU64::new(0)),
        };

        let mut handle = spawn("test-order", 16, worker);
        for i in 0..10 {
            handle.send(i).unwrap();
        }
        handle.shutdown();

        assert_eq!(*messages.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn ticks_fire_and_shutdown_hook_runs() {
        let ticks = Arc::new(AtomicU64::new(0));
        let shutdowns = Arc::new(AtomicU64::new(0));
        let worker = Recorder {
            messages: Arc::new(Mutex::new(Vec::new())),
            ticks: Arc::clone(&ticks),
            shutdowns: Arc::clone(&shutdowns),
        };

        let mut handle = spawn("test-ticks", 16, worker);
        thread::sleep(Duration::from_millis(40));
        handle.shutdown();

        assert!(ticks.load(Ordering::SeqCst) >= 2);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let worker = Recorder {
            messages: Arc::new(Mutex::new(Vec::new())),
            ticks: Arc::new(AtomicU64::new(0)),
            shutdowns: Arc::new(AtomicU64::new(0)),
        };
        let mut handle = spawn("test-idem", 4, worker);
        handle.shutdown();
        handle.shutdown();
    }

    #[test]
    fn drop_joins_the_thread() {
        let shutdowns = Arc::new(AtomicU64::new(0));
        {
            let worker = Recorder {
                messages: Arc::new(Mutex::new(Vec::new())),
                ticks: Arc::new(AtomicU64::new(0)),
                shutdowns: Arc::clone(&shutdowns),
            };
            let _handle = spawn("test-drop", 4, worker);
        }
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }
}
