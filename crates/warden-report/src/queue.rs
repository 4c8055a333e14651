//! Bounded lock-free report queue.
//!
//! A multi-producer single-consumer ring: producers are the arbitrary OS
//! threads making file accesses, the consumer is the client transport
//! draining the queue memory. A full queue fails the push; the accessing
//! thread is never blocked behind a slow client.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_channel::Sender;
use once_cell::sync::OnceCell;

use crate::AccessReport;

// Force wide alignment so producer and consumer counters never share a
// cache line; adjacent-line prefetchers make 128 the safe unit.
#[repr(align(128))]
struct CachePadded<T>(T);

/// Marker sent through a notification port when a queue transitions from
/// empty to non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSignal;

/// Wakeup channel for a client waiting on queue data. The transport hands
/// the receiving end to the client; the queue only ever signals, never
/// blocks.
#[derive(Clone)]
pub struct NotificationPort {
    sender: Sender<QueueSignal>,
}

impl NotificationPort {
    pub fn new(sender: Sender<QueueSignal>) -> Self {
        NotificationPort { sender }
    }

    fn signal(&self) {
        // A lagging receiver just misses coalesced wakeups.
        let _ = self.sender.try_send(QueueSignal);
    }
}

/// Push/pop/drop counters, updated with relaxed atomics off the hot path's
/// critical ordering.
#[derive(Debug, Default)]
pub struct QueueStats {
    pub pushes: AtomicU64,
    pub pops: AtomicU64,
    pub drops: AtomicU64,
}

struct Slot {
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<AccessReport>>,
}

/// A bounded MPSC ring of fixed-size [`AccessReport`] records.
///
/// Per-slot sequence numbers publish records to the consumer: a producer
/// reserves a slot by advancing `head` with a compare-and-swap, writes the
/// record, then releases the slot's sequence. The consumer observes a slot
/// as ready only after that release.
pub struct ReportQueue {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    slots: Box<[Slot]>,
    mask: usize,
    port: OnceCell<NotificationPort>,
    handle_taken: AtomicUsize,
    stats: QueueStats,
}

unsafe impl Send for ReportQueue {}
unsafe impl Sync for ReportQueue {}

impl ReportQueue {
    /// Creates a queue holding at least `entry_count` records. The capacity
    /// is rounded up to a power of two (minimum 2) for masked indexing.
    pub fn with_entries(entry_count: u32) -> Option<ReportQueue> {
        if entry_count == 0 {
            return None;
        }
        let capacity = (entry_count as usize).next_power_of_two().max(2);
        let slots = (0..capacity)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Some(ReportQueue {
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
            slots,
            mask: capacity - 1,
            port: OnceCell::new(),
            handle_taken: AtomicUsize::new(0),
            stats: QueueStats::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attaches the notification port. May only happen once per queue;
    /// returns false if a port is already attached.
    pub fn set_notification_port(&self, port: NotificationPort) -> bool {
        self.port.set(port).is_ok()
    }

    pub fn has_notification_port(&self) -> bool {
        self.port.get().is_some()
    }

    /// Marks this queue's memory as handed out to the client transport.
    /// Returns false if it already was.
    pub(crate) fn take_handle(&self) -> bool {
        self.handle_taken.swap(1, Ordering::AcqRel) == 0
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.pushes.load(Ordering::Relaxed),
            self.stats.pops.load(Ordering::Relaxed),
            self.stats.drops.load(Ordering::Relaxed),
        )
    }

    /// Writes one record. Returns false when the queue is full; the record
    /// is dropped and counted, never retried and never blocking.
    pub fn try_push(&self, report: &AccessReport) -> bool {
        let mut head = self.head.0.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[head & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let lag = seq as isize - head as isize;
            if lag == 0 {
                match self.head.0.compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let was_empty = head == self.tail.0.load(Ordering::Acquire);
                        // Safety: the CAS above made this producer the sole
                        // owner of the slot until its sequence is released.
                        unsafe { (*slot.value.get()).write(*report) };
                        slot.seq.store(head.wrapping_add(1), Ordering::Release);
                        self.stats.pushes.fetch_add(1, Ordering::Relaxed);
                        if was_empty {
                            if let Some(port) = self.port.get() {
                                port.signal();
                            }
                        }
                        return true;
                    }
                    Err(actual) => head = actual,
                }
            } else if lag < 0 {
                // The slot still carries an unconsumed record from the
                // previous lap: the queue is full.
                self.stats.drops.fetch_add(1, Ordering::Relaxed);
                return false;
            } else {
                head = self.head.0.load(Ordering::Relaxed);
            }
        }
    }

    /// Takes the oldest record. Only the consuming side may call this.
    pub fn pop(&self) -> Option<AccessReport> {
        let tail = self.tail.0.load(Ordering::Relaxed);
        let slot = &self.slots[tail & self.mask];
        let seq = slot.seq.load(Ordering::Acquire);
        if seq != tail.wrapping_add(1) {
            // Empty, or a producer reserved the slot but has not published.
            return None;
        }
        // Safety: the sequence check above proves the producer released
        // this slot and the single consumer owns it now.
        let report = unsafe { (*slot.value.get()).assume_init_read() };
        slot.seq
            .store(tail.wrapping_add(self.mask + 1), Ordering::Release);
        self.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        self.stats.pops.fetch_add(1, Ordering::Relaxed);
        Some(report)
    }

    /// Drains up to `max` records in one pass.
    pub fn pop_batch(&self, batch: &mut Vec<AccessReport>, max: usize) -> usize {
        let mut count = 0;
        while count < max {
            match self.pop() {
                Some(report) => {
                    batch.push(report);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReportOperation;
    use std::sync::Arc;
    use std::thread;
    use warden_manifest::{FileAccessStatus, PipId, RequestedAccess};

    fn report(pid: u32, path: &str) -> AccessReport {
        AccessReport::new(
            ReportOperation::FileRead,
            FileAccessStatus::Allowed,
            1,
            pid,
            1,
            RequestedAccess::READ,
            PipId(1),
            path,
        )
    }

    #[test]
    fn test_zero_entries_rejected() {
        assert!(ReportQueue::with_entries(0).is_none());
    }

    #[test]
    fn test_push_pop_roundtrip() {
        let queue = ReportQueue::with_entries(8).unwrap();
        assert!(queue.try_push(&report(42, "/a")));
        let popped = queue.pop().unwrap();
        assert_eq!(popped.pid, 42);
        assert_eq!(popped.path_str(), "/a");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_full_queue_drops() {
        let queue = ReportQueue::with_entries(2).unwrap();
        assert!(queue.try_push(&report(1, "/a")));
        assert!(queue.try_push(&report(2, "/b")));
        assert!(!queue.try_push(&report(3, "/c")));
        let (pushes, _, drops) = queue.stats();
        assert_eq!(pushes, 2);
        assert_eq!(drops, 1);
        // Draining frees capacity again.
        assert!(queue.pop().is_some());
        assert!(queue.try_push(&report(3, "/c")));
    }

    #[test]
    fn test_fifo_order_across_wraparound() {
        let queue = ReportQueue::with_entries(4).unwrap();
        for lap in 0u32..3 {
            for i in 0..4 {
                assert!(queue.try_push(&report(lap * 10 + i, "/f")));
            }
            for i in 0..4 {
                assert_eq!(queue.pop().unwrap().pid, lap * 10 + i);
            }
        }
    }

    #[test]
    fn test_notification_on_empty_transition_only() {
        let queue = ReportQueue::with_entries(8).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(16);
        assert!(queue.set_notification_port(NotificationPort::new(tx)));
        assert!(!queue.set_notification_port(NotificationPort::new(
            crossbeam_channel::bounded(1).0
        )));

        queue.try_push(&report(1, "/a"));
        queue.try_push(&report(2, "/b"));
        assert_eq!(rx.try_iter().count(), 1);

        queue.pop();
        queue.pop();
        queue.try_push(&report(3, "/c"));
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn test_pop_batch() {
        let queue = ReportQueue::with_entries(8).unwrap();
        for i in 0..5 {
            queue.try_push(&report(i, "/f"));
        }
        let mut batch = Vec::new();
        assert_eq!(queue.pop_batch(&mut batch, 3), 3);
        assert_eq!(queue.pop_batch(&mut batch, 10), 2);
        assert_eq!(batch.len(), 5);
    }

    #[test]
    fn test_concurrent_producers_lose_nothing_under_capacity() {
        let queue = Arc::new(ReportQueue::with_entries(1024).unwrap());
        let mut handles = vec![];
        for t in 0..4u32 {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    assert!(queue.try_push(&report(t * 1000 + i, "/f")));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let mut seen = Vec::new();
        while let Some(r) = queue.pop() {
            seen.push(r.pid);
        }
        seen.sort_unstable();
        let mut expected: Vec<u32> = (0..4u32)
            .flat_map(|t| (0..100).map(move |i| t * 1000 + i))
            .collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }
}
