//! Completion notification channels
//!
//! Each monitored input endpoint holds one [`CompletionToken`] obtained from
//! its device's [`CompletionHub`]. The reaping side posts
//! [`CompletionEvent`]s onto the token's channel and the monitor consumes
//! them cooperatively from [`UsbDevice::handle_events`](crate::UsbDevice::handle_events).
//!
//! ```text
//!   reap ──Completed(id)──►┐
//!                          ├──► token channel ──► monitor state machine
//!   timer ──ResubmitDue───►┘
//! ```
//!
//! The hub has a fixed number of slots. Running out of slots means the
//! endpoint stays on the synchronous path.

use crate::request::RequestId;
use async_channel::{Receiver, Sender, unbounded};
use tracing::{debug, trace};

/// Event delivered to an input monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionEvent {
    /// The request was reaped and filed on its endpoint's queue
    Completed(RequestId),
    /// The backoff timer elapsed; the parked request should go back out
    ResubmitDue,
}

/// A claimed completion slot and its channel
#[derive(Debug)]
pub struct CompletionToken {
    slot: usize,
    tx: Sender<CompletionEvent>,
    rx: Receiver<CompletionEvent>,
}

impl CompletionToken {
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Queue an event for the owning monitor
    ///
    /// Returns false if the channel has been closed.
    pub fn post(&self, event: CompletionEvent) -> bool {
        trace!("completion event on slot {}: {:?}", self.slot, event);
        self.tx.try_send(event).is_ok()
    }

    /// Take the next queued event, if any
    pub fn next_event(&self) -> Option<CompletionEvent> {
        self.rx.try_recv().ok()
    }

    /// Number of events waiting
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

/// Fixed pool of completion slots
#[derive(Debug)]
pub struct CompletionHub {
    in_use: Vec<bool>,
}

impl CompletionHub {
    pub fn new(slots: usize) -> Self {
        Self {
            in_use: vec![false; slots],
        }
    }

    /// Claim a free slot
    pub fn obtain(&mut self) -> Option<CompletionToken> {
        let slot = self.in_use.iter().position(|used| !used)?;
        self.in_use[slot] = true;

        let (tx, rx) = unbounded();
        debug!("completion slot obtained: {}", slot);
        Some(CompletionToken { slot, tx, rx })
    }

    /// Return a slot to the pool, discarding undelivered events
    pub fn relinquish(&mut self, token: CompletionToken) {
        let discarded = token.rx.len();
        token.rx.close();
        if let Some(used) = self.in_use.get_mut(token.slot) {
            *used = false;
        }
        debug!(
            "completion slot relinquished: {} ({} events discarded)",
            token.slot, discarded
        );
    }

    /// Number of free slots
    pub fn available(&self) -> usize {
        self.in_use.iter().filter(|used| !**used).count()
    }
}
