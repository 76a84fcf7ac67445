//! # syntond-runtime: Worker threads and message plumbing
//!
//! The daemon's concurrency model is one OS thread per module, each owning a
//! bounded inbox. Handlers run sequentially within a worker; cross-worker
//! state travels only in message payloads and read-mostly shared handles.
//! This crate provides the three pieces every module builds on:
//!
//! - [`Inbox`] — a bounded, lock-free MPSC queue with backpressure
//!   signalling (full inboxes return the message to the sender instead of
//!   blocking or growing).
//! - [`ReplySlot`] — a one-shot rendezvous for synchronous requests: the
//!   caller blocks on [`ReplyReceiver::wait`] until the worker delivers the
//!   reply. No implicit timeout; the design assumes non-blocking handlers.
//! - [`Worker`] / [`spawn`] — a named worker thread draining its inbox and
//!   running a periodic tick, with cooperative shutdown and join-on-drop.

mod inbox;
mod reply;
mod worker;

pub use inbox::Inbox;
pub use reply::{reply_slot, ReplyError, ReplyReceiver, ReplySender};
pub use worker::{spawn, Worker, WorkerHandle};
