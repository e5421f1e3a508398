//! Response queue (`spec.md` §3, §4.5).
//!
//! Producers are request-handler continuations running on arbitrary Tokio tasks; the single
//! consumer is the dedicated ZMQ send thread. `std::sync::mpsc` already models "multiple
//! producers, one consumer" directly, so it stands in for the spec's lock-free MPMC ring without
//! reaching for an external queue crate the rest of the stack doesn't otherwise need.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    mpsc, Arc,
};

use crate::query::QueryLineage;

/// A completed response awaiting delivery to its originating ZMQ client.
#[derive(Clone, Debug)]
pub struct ResponseEnvelope {
    /// Client id the response must be routed back to.
    pub client_id: u32,
    /// Request id being acknowledged.
    pub request_id: u32,
    /// Predicted output value.
    pub output: f64,
    /// Pipeline lineage to serialize alongside the response.
    pub lineage: QueryLineage,
}

/// Shared producer handle plus a soft-cap depth counter.
#[derive(Clone)]
pub struct ResponseQueueSender {
    sender: mpsc::Sender<ResponseEnvelope>,
    depth: Arc<AtomicUsize>,
    soft_cap: usize,
}

impl ResponseQueueSender {
    /// Enqueue `envelope`. Never blocks and never rejects: at soft capacity the entry is still
    /// enqueued and `true` is returned to signal the caller should mark a drop/overflow meter.
    ///
    /// Returns `false` if the send thread has gone away and the entry could not be delivered.
    pub fn send(&self, envelope: ResponseEnvelope) -> bool {
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        let over_cap = depth > self.soft_cap;
        if self.sender.send(envelope).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        over_cap
    }
}

/// Consumer half, owned by the ZMQ send thread.
pub struct ResponseQueueReceiver {
    receiver: mpsc::Receiver<ResponseEnvelope>,
    depth: Arc<AtomicUsize>,
}

impl ResponseQueueReceiver {
    /// Drain up to `max` entries without blocking.
    pub fn drain(&self, max: usize) -> Vec<ResponseEnvelope> {
        let mut out = Vec::with_capacity(max.min(64));
        while out.len() < max {
            match self.receiver.try_recv() {
                Ok(envelope) => {
                    self.depth.fetch_sub(1, Ordering::AcqRel);
                    out.push(envelope);
                }
                Err(_) => break,
            }
        }
        out
    }

    /// Block until at least one entry is available, or the queue is closed.
    pub fn recv(&self) -> Option<ResponseEnvelope> {
        let envelope = self.receiver.recv().ok()?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(envelope)
    }
}

/// Construct a response queue with the given soft capacity (`spec.md` default 80 000).
#[must_use]
pub fn response_queue(soft_cap: usize) -> (ResponseQueueSender, ResponseQueueReceiver) {
    let (sender, receiver) = mpsc::channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        ResponseQueueSender {
            sender,
            depth: depth.clone(),
            soft_cap,
        },
        ResponseQueueReceiver { receiver, depth },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(request_id: u32) -> ResponseEnvelope {
        ResponseEnvelope {
            client_id: 1,
            request_id,
            output: 1.0,
            lineage: QueryLineage::default(),
        }
    }

    #[test]
    fn send_then_recv_round_trips() {
        let (tx, rx) = response_queue(10);
        tx.send(sample(1));
        let envelope = rx.recv().unwrap();
        assert_eq!(envelope.request_id, 1);
    }

    #[test]
    fn drain_returns_at_most_max_entries() {
        let (tx, rx) = response_queue(10);
        for i in 0..5 {
            tx.send(sample(i));
        }
        let drained = rx.drain(3);
        assert_eq!(drained.len(), 3);
        assert_eq!(rx.drain(10).len(), 2);
    }

    #[test]
    fn send_past_soft_cap_still_enqueues_but_reports_overflow() {
        let (tx, _rx) = response_queue(2);
        assert!(!tx.send(sample(1)));
        assert!(!tx.send(sample(2)));
        assert!(tx.send(sample(3)));
    }
}
