//! Progress aggregation.
//!
//! [`ProgressAggregator`] is the single writer: it is owned by the
//! scheduler and advanced only when a part is acknowledged by the server,
//! never by retries or in-flight work.  Completed bytes are summed, so the
//! emitted value is monotonic whatever order parts finish in.
//!
//! Readers hold a [`ProgressReceiver`], backed by a `tokio::sync::watch`
//! channel: it always sees the latest snapshot and never buffers missed
//! ones.  Push-style callers can register callbacks instead.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use tokio::sync::watch;

/// Immutable view of a transfer's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    /// Bytes in acknowledged parts.
    pub bytes_completed: u64,
    /// Size of the source.
    pub total_bytes: u64,
    /// Number of acknowledged parts.
    pub parts_completed: usize,
    /// Number of planned parts.
    pub total_parts: usize,
    /// When this snapshot was produced.
    pub timestamp: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Fraction complete in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.bytes_completed as f64 / self.total_bytes as f64
    }

    /// Whether every byte has been acknowledged.
    pub fn is_complete(&self) -> bool {
        self.bytes_completed >= self.total_bytes
    }
}

/// Callback invoked with every new snapshot.
pub type ProgressCallback = Box<dyn Fn(&ProgressSnapshot) + Send + Sync>;

/// Single-writer progress counter.
pub struct ProgressAggregator {
    tx: watch::Sender<ProgressSnapshot>,
    counted: BTreeSet<u32>,
    callbacks: Vec<ProgressCallback>,
}

impl std::fmt::Debug for ProgressAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressAggregator")
            .field("snapshot", &*self.tx.borrow())
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl ProgressAggregator {
    /// Start a fresh counter.
    pub fn new(total_bytes: u64, total_parts: usize) -> Self {
        let (tx, _) = watch::channel(ProgressSnapshot {
            bytes_completed: 0,
            total_bytes,
            parts_completed: 0,
            total_parts,
            timestamp: Utc::now(),
        });
        Self {
            tx,
            counted: BTreeSet::new(),
            callbacks: Vec::new(),
        }
    }

    /// Reset the totals (used once a plan is known) without emitting.
    pub fn reset(&mut self, total_bytes: u64, total_parts: usize) {
        self.counted.clear();
        self.tx.send_replace(ProgressSnapshot {
            bytes_completed: 0,
            total_bytes,
            parts_completed: 0,
            total_parts,
            timestamp: Utc::now(),
        });
    }

    /// Register a push-style callback.
    pub fn on_progress(&mut self, callback: ProgressCallback) {
        self.callbacks.push(callback);
    }

    /// Create a new pull-style reader.
    pub fn subscribe(&self) -> ProgressReceiver {
        ProgressReceiver {
            rx: self.tx.subscribe(),
        }
    }

    /// Latest snapshot.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.tx.borrow().clone()
    }

    /// Record that part `number` of `size` bytes was acknowledged.
    ///
    /// A part already counted is ignored, so the counter can never
    /// overshoot.
    pub fn record_part(&mut self, number: u32, size: u64) {
        if !self.counted.insert(number) {
            return;
        }
        self.tx.send_modify(|snap| {
            snap.bytes_completed = (snap.bytes_completed + size).min(snap.total_bytes);
            snap.parts_completed += 1;
            snap.timestamp = Utc::now();
        });
        self.emit();
    }

    /// Record a batch of parts the server already holds (resume).
    pub fn record_existing<I>(&mut self, parts: I)
    where
        I: IntoIterator<Item = (u32, u64)>,
    {
        let mut added = false;
        for (number, size) in parts {
            if self.counted.insert(number) {
                self.tx.send_modify(|snap| {
                    snap.bytes_completed = (snap.bytes_completed + size).min(snap.total_bytes);
                    snap.parts_completed += 1;
                });
                added = true;
            }
        }
        if added {
            self.tx.send_modify(|snap| snap.timestamp = Utc::now());
            self.emit();
        }
    }

    fn emit(&self) {
        if self.callbacks.is_empty() {
            return;
        }
        let snap = self.snapshot();
        for cb in &self.callbacks {
            cb(&snap);
        }
    }
}

/// Pull-style reader of progress snapshots.
///
/// Cloning yields an independent reader starting from the latest value.
#[derive(Debug, Clone)]
pub struct ProgressReceiver {
    rx: watch::Receiver<ProgressSnapshot>,
}

impl ProgressReceiver {
    /// Latest snapshot, without waiting.
    pub fn latest(&self) -> ProgressSnapshot {
        self.rx.borrow().clone()
    }

    /// Wait for a snapshot newer than the last one seen.  Returns `None`
    /// once the transfer has finished and no more updates will come.
    pub async fn changed(&mut self) -> Option<ProgressSnapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_sums_bytes_not_order() {
        let mut agg = ProgressAggregator::new(25, 3);
        agg.record_part(3, 5);
        agg.record_part(1, 10);
        let snap = agg.snapshot();
        assert_eq!(snap.bytes_completed, 15);
        assert_eq!(snap.parts_completed, 2);
        agg.record_part(2, 10);
        assert!(agg.snapshot().is_complete());
        assert_eq!(agg.snapshot().fraction(), 1.0);
    }

    #[test]
    fn test_duplicate_part_ignored() {
        let mut agg = ProgressAggregator::new(20, 2);
        agg.record_part(1, 10);
        agg.record_part(1, 10);
        assert_eq!(agg.snapshot().bytes_completed, 10);
        assert_eq!(agg.snapshot().parts_completed, 1);
    }

    #[test]
    fn test_callbacks_see_monotonic_values() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut agg = ProgressAggregator::new(100, 10);
        let sink = Arc::clone(&seen);
        agg.on_progress(Box::new(move |snap| {
            sink.lock().unwrap().push(snap.bytes_completed);
        }));
        for n in [7u32, 2, 9, 1, 10, 3, 5, 4, 8, 6] {
            agg.record_part(n, 10);
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 10);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 100);
    }

    #[test]
    fn test_record_existing_emits_once() {
        let calls = Arc::new(Mutex::new(0));
        let mut agg = ProgressAggregator::new(30, 3);
        let counter = Arc::clone(&calls);
        agg.on_progress(Box::new(move |_| *counter.lock().unwrap() += 1));
        agg.record_existing(vec![(1, 10), (2, 10)]);
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(agg.snapshot().bytes_completed, 20);
        agg.record_part(2, 10);
        assert_eq!(agg.snapshot().bytes_completed, 20);
    }

    #[tokio::test]
    async fn test_receiver_gets_latest_only() {
        let mut agg = ProgressAggregator::new(30, 3);
        let mut rx = agg.subscribe();
        agg.record_part(1, 10);
        agg.record_part(2, 10);
        let snap = rx.changed().await.unwrap();
        assert_eq!(snap.bytes_completed, 20);

        // A restarted reader starts from the latest value.
        let late = rx.clone();
        assert_eq!(late.latest().bytes_completed, 20);

        drop(agg);
        assert!(rx.changed().await.is_none());
    }
}
