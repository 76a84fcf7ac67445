//! One-shot reply slots for synchronous requests.

use std::sync::mpsc;

/// The callee went away without replying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no reply: worker dropped the request")]
pub struct ReplyError;

/// The sending half of a reply slot, carried inside a request message.
#[derive(Debug)]
pub struct ReplySender<T> {
    tx: mpsc::SyncSender<T>,
}

impl<T> ReplySender<T> {
    /// Delivers the reply. Delivery to a caller that stopped waiting is
    /// silently dropped.
    pub fn send(self, value: T) {
        let _ = self.tx.send(value);
    }
}

/// The receiving half of a reply slot, held by the caller.
#[derive(Debug)]
pub struct ReplyReceiver<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> ReplyReceiver<T> {
    /// Blocks until the reply arrives.
    ///
    /// There is no implicit timeout: a worker that never replies hangs its
    /// caller, which is why handlers must not block.
    pub fn wait(self) -> Result<T, ReplyError> {
        self.rx.recv().map_err(|_| ReplyError)
    }
}

/// Creates a connected reply slot pair.
pub fn reply_slot<T>() -> (ReplySender<T>, ReplyReceiver<T>) {
    // Rendezvous capacity 1: the worker's send never blocks and the value
    // is buffered until the caller collects it.
    let (tx, rx) = mpsc::sync_channel(1);
    (ReplySender { tx }, ReplyReceiver { rx })
}
