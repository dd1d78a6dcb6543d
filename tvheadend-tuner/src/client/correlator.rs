//! Request/response correlation by sequence number.
//!
//! Callers register a completion slot before transmitting and wait on it;
//! the connection's read loop resolves slots as replies arrive. Once the
//! connection fails, every slot is failed and the table refuses new
//! registrations, so no caller is left waiting on a dead socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use htsp_protocol::Message;

use crate::error::HtspError;

/// Outcome delivered to a waiting caller.
pub type Reply = Result<Message, HtspError>;

enum Slot {
    /// Resolved by the first reply.
    Single(oneshot::Sender<Reply>),
    /// Receives every reply with the sequence number until the caller cancels.
    Stream(mpsc::UnboundedSender<Reply>),
}

#[derive(Default)]
struct PendingTable {
    slots: HashMap<u32, Slot>,
    closed: Option<HtspError>,
}

/// Sequence-number keyed table of pending requests for one connection.
pub struct Correlator {
    next_seq: Arc<AtomicU32>,
    table: Mutex<PendingTable>,
}

impl Correlator {
    /// Create a correlator drawing sequence numbers from a shared counter.
    ///
    /// Sharing the counter across reconnects keeps numbers from one
    /// connection from being handed out again on the next.
    pub fn new(next_seq: Arc<AtomicU32>) -> Self {
        Self {
            next_seq,
            table: Mutex::new(PendingTable::default()),
        }
    }

    fn allocate(&self, table: &PendingTable) -> Result<u32, HtspError> {
        if let Some(err) = &table.closed {
            return Err(err.clone());
        }
        loop {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            if !table.slots.contains_key(&seq) {
                return Ok(seq);
            }
        }
    }

    /// Register a single-reply slot.
    pub fn register(&self) -> Result<(u32, oneshot::Receiver<Reply>), HtspError> {
        let mut table = self.table.lock();
        let seq = self.allocate(&table)?;
        let (tx, rx) = oneshot::channel();
        table.slots.insert(seq, Slot::Single(tx));
        Ok((seq, rx))
    }

    /// Register a slot that accepts any number of replies.
    pub fn register_stream(&self) -> Result<(u32, mpsc::UnboundedReceiver<Reply>), HtspError> {
        let mut table = self.table.lock();
        let seq = self.allocate(&table)?;
        let (tx, rx) = mpsc::unbounded_channel();
        table.slots.insert(seq, Slot::Stream(tx));
        Ok((seq, rx))
    }

    /// Deliver a reply. Returns false if nobody is waiting for `seq`.
    pub fn resolve(&self, seq: u32, msg: Message) -> bool {
        let mut table = self.table.lock();
        match table.slots.get(&seq) {
            None => false,
            Some(Slot::Stream(tx)) => {
                if tx.send(Ok(msg)).is_err() {
                    table.slots.remove(&seq);
                    return false;
                }
                true
            }
            Some(Slot::Single(_)) => match table.slots.remove(&seq) {
                Some(Slot::Single(tx)) => tx.send(Ok(msg)).is_ok(),
                _ => false,
            },
        }
    }

    /// Drop the slot for `seq`; later replies with that number are discarded.
    pub fn cancel(&self, seq: u32) -> bool {
        self.table.lock().slots.remove(&seq).is_some()
    }

    /// Fail every pending slot with `error` and refuse new registrations.
    pub fn fail_all(&self, error: HtspError) -> usize {
        let slots = {
            let mut table = self.table.lock();
            table.closed.get_or_insert_with(|| error.clone());
            std::mem::take(&mut table.slots)
        };

        let count = slots.len();
        for (seq, slot) in slots {
            trace!("Failing pending request seq={} with {}", seq, error);
            match slot {
                Slot::Single(tx) => {
                    let _ = tx.send(Err(error.clone()));
                }
                Slot::Stream(tx) => {
                    let _ = tx.send(Err(error.clone()));
                }
            }
        }
        count
    }

    /// Number of requests still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.table.lock().slots.len()
    }

    pub fn is_closed(&self) -> bool {
        self.table.lock().closed.is_some()
    }

    /// Remove the slot for `seq` when the returned guard is dropped.
    pub fn guard(&self, seq: u32) -> PendingGuard<'_> {
        PendingGuard {
            correlator: self,
            seq,
        }
    }
}

/// Removes an abandoned slot when a caller stops waiting (timeout, cancellation).
pub struct PendingGuard<'a> {
    correlator: &'a Correlator,
    seq: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.cancel(self.seq);
    }
}
