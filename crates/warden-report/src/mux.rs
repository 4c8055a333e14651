//! Per-client report queue multiplexer.
//!
//! Maps a client pid to a bucket of one or more bounded queues and
//! distributes outbound reports to them, optionally round-robin. The bucket
//! dictionary is a uint-keyed trie so the hot enqueue path stays lock-free
//! end to end.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::{debug, error};

use crate::queue::{NotificationPort, ReportQueue};
use crate::AccessReport;
use warden_trie::{Trie, TrieResult};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MuxError {
    #[error("no report queues allocated for client pid {0}")]
    NoQueues(u32),
    #[error("invalid queue geometry: {entries} entries of {entry_size} bytes")]
    InvalidGeometry { entries: u32, entry_size: u32 },
    #[error("all queues for client pid {0} already have a notification port")]
    PortsExhausted(u32),
    #[error("all queue memory for client pid {0} already handed out")]
    HandlesExhausted(u32),
}

/// Consumer-side handle to one queue's memory, handed to the client
/// transport exactly once per queue.
pub struct QueueHandle {
    queue: Arc<ReportQueue>,
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("capacity", &self.queue.capacity())
            .finish_non_exhaustive()
    }
}

impl QueueHandle {
    pub fn entry_size(&self) -> usize {
        AccessReport::SIZE
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn pop(&self) -> Option<AccessReport> {
        self.queue.pop()
    }

    pub fn pop_batch(&self, batch: &mut Vec<AccessReport>, max: usize) -> usize {
        self.queue.pop_batch(batch, max)
    }
}

/// One client's set of queues. The queue list is an immutable snapshot
/// behind an atomic pointer: enqueue loads it without locking, allocation
/// swaps in a grown copy.
struct ClientBucket {
    queues: ArcSwap<Vec<Arc<ReportQueue>>>,
    cursor: AtomicUsize,
}

impl ClientBucket {
    fn new() -> Self {
        ClientBucket {
            queues: ArcSwap::from_pointee(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }
}

/// Fans reports out to per-client bounded queues.
pub struct ReportMultiplexer {
    buckets: Trie<ClientBucket>,
}

impl Default for ReportMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReportMultiplexer {
    pub fn new() -> Self {
        ReportMultiplexer {
            buckets: Trie::uint_keyed(),
        }
    }

    /// Number of clients that currently own at least one queue.
    pub fn client_count(&self) -> usize {
        self.buckets.count()
    }

    /// Allocates one more queue for `client_pid`, holding `entry_count`
    /// records of `entry_size` bytes. The entry size must match the report
    /// record layout the transport was compiled against.
    pub fn allocate_queue(
        &self,
        client_pid: u32,
        entry_count: u32,
        entry_size: u32,
    ) -> Result<(), MuxError> {
        if entry_size as usize != AccessReport::SIZE {
            return Err(MuxError::InvalidGeometry {
                entries: entry_count,
                entry_size,
            });
        }
        let queue = ReportQueue::with_entries(entry_count).ok_or(MuxError::InvalidGeometry {
            entries: entry_count,
            entry_size,
        })?;
        let queue = Arc::new(queue);

        let bucket = self
            .buckets
            .get_or_add(client_pid as u64, ClientBucket::new)
            .expect("uint keys are always representable");
        bucket.queues.rcu(|queues| {
            let mut grown = Vec::with_capacity(queues.len() + 1);
            grown.extend(queues.iter().cloned());
            grown.push(Arc::clone(&queue));
            grown
        });
        debug!(
            client_pid,
            entries = entry_count,
            "allocated report queue for client"
        );
        Ok(())
    }

    /// Releases every queue owned by `client_pid`. Subsequent enqueues for
    /// the client fail.
    pub fn free_queues(&self, client_pid: u32) -> Result<(), MuxError> {
        match self.buckets.remove(client_pid as u64) {
            TrieResult::Removed => {
                debug!(
                    client_pid,
                    remaining_clients = self.buckets.count(),
                    "freed report queues for client"
                );
                Ok(())
            }
            _ => Err(MuxError::NoQueues(client_pid)),
        }
    }

    /// Attaches `port` to the client's next queue that has no notification
    /// port yet.
    pub fn set_notification_port(
        &self,
        client_pid: u32,
        port: NotificationPort,
    ) -> Result<(), MuxError> {
        let bucket = self
            .buckets
            .get(client_pid as u64)
            .ok_or(MuxError::NoQueues(client_pid))?;
        for queue in bucket.queues.load().iter() {
            if !queue.has_notification_port() && queue.set_notification_port(port.clone()) {
                return Ok(());
            }
        }
        Err(MuxError::PortsExhausted(client_pid))
    }

    /// Hands out the memory of the client's next queue that has not been
    /// queried yet.
    pub fn memory_handle(&self, client_pid: u32) -> Result<QueueHandle, MuxError> {
        let bucket = self
            .buckets
            .get(client_pid as u64)
            .ok_or(MuxError::NoQueues(client_pid))?;
        for queue in bucket.queues.load().iter() {
            if queue.take_handle() {
                return Ok(QueueHandle {
                    queue: Arc::clone(queue),
                });
            }
        }
        Err(MuxError::HandlesExhausted(client_pid))
    }

    /// Writes `report` into one of the client's queues (rotating when
    /// `round_robin`) or into all of them otherwise. Returns false on any
    /// delivery failure; the undelivered report is not retried or persisted.
    pub fn enqueue(&self, client_pid: u32, report: &AccessReport, round_robin: bool) -> bool {
        let Some(bucket) = self.buckets.get(client_pid as u64) else {
            error!(client_pid, "no report queues for client");
            return false;
        };
        let queues = bucket.queues.load();
        if queues.is_empty() {
            error!(client_pid, "client bucket holds no queues");
            return false;
        }

        if round_robin {
            let next = bucket.cursor.fetch_add(1, Ordering::Relaxed) % queues.len();
            queues[next].try_push(report)
        } else {
            let mut delivered = true;
            for queue in queues.iter() {
                delivered &= queue.try_push(report);
            }
            delivered
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReportOperation;
    use warden_manifest::{FileAccessStatus, PipId, RequestedAccess};

    const ENTRY: u32 = AccessReport::SIZE as u32;

    fn report(pid: u32) -> AccessReport {
        AccessReport::new(
            ReportOperation::FileWrite,
            FileAccessStatus::Allowed,
            100,
            pid,
            100,
            RequestedAccess::WRITE,
            PipId(7),
            "/out/a.o",
        )
    }

    #[test]
    fn test_allocate_and_enqueue() {
        let mux = ReportMultiplexer::new();
        mux.allocate_queue(100, 8, ENTRY).unwrap();
        assert!(mux.enqueue(100, &report(1), true));
        let handle = mux.memory_handle(100).unwrap();
        assert_eq!(handle.pop().unwrap().pid, 1);
    }

    #[test]
    fn test_wrong_entry_size_rejected() {
        let mux = ReportMultiplexer::new();
        let err = mux.allocate_queue(100, 8, 128).unwrap_err();
        assert!(matches!(err, MuxError::InvalidGeometry { .. }));
    }

    #[test]
    fn test_enqueue_without_queues_fails() {
        let mux = ReportMultiplexer::new();
        assert!(!mux.enqueue(100, &report(1), true));
    }

    #[test]
    fn test_free_queues_then_enqueue_fails() {
        let mux = ReportMultiplexer::new();
        mux.allocate_queue(100, 8, ENTRY).unwrap();
        assert!(mux.enqueue(100, &report(1), true));
        mux.free_queues(100).unwrap();
        assert!(!mux.enqueue(100, &report(2), true));
        assert_eq!(mux.free_queues(100).unwrap_err(), MuxError::NoQueues(100));
    }

    #[test]
    fn test_round_robin_distributes_in_rotation() {
        let mux = ReportMultiplexer::new();
        for _ in 0..3 {
            mux.allocate_queue(100, 8, ENTRY).unwrap();
        }
        for i in 0..9 {
            assert!(mux.enqueue(100, &report(i), true));
        }
        // Each queue got every third report, in rotation order.
        for q in 0..3u32 {
            let handle = mux.memory_handle(100).unwrap();
            let mut pids = Vec::new();
            while let Some(r) = handle.pop() {
                pids.push(r.pid);
            }
            assert_eq!(pids, vec![q, q + 3, q + 6]);
        }
    }

    #[test]
    fn test_broadcast_hits_every_queue() {
        let mux = ReportMultiplexer::new();
        mux.allocate_queue(100, 8, ENTRY).unwrap();
        mux.allocate_queue(100, 8, ENTRY).unwrap();
        assert!(mux.enqueue(100, &report(5), false));
        for _ in 0..2 {
            let handle = mux.memory_handle(100).unwrap();
            assert_eq!(handle.pop().unwrap().pid, 5);
        }
    }

    #[test]
    fn test_full_queue_reports_delivery_failure() {
        let mux = ReportMultiplexer::new();
        mux.allocate_queue(100, 2, ENTRY).unwrap();
        assert!(mux.enqueue(100, &report(1), true));
        assert!(mux.enqueue(100, &report(2), true));
        assert!(!mux.enqueue(100, &report(3), true));
    }

    #[test]
    fn test_notification_port_attaches_to_next_portless_queue() {
        let mux = ReportMultiplexer::new();
        mux.allocate_queue(100, 8, ENTRY).unwrap();
        mux.allocate_queue(100, 8, ENTRY).unwrap();
        let (tx1, _rx1) = crossbeam_channel::bounded(4);
        let (tx2, _rx2) = crossbeam_channel::bounded(4);
        let (tx3, _rx3) = crossbeam_channel::bounded(4);
        mux.set_notification_port(100, NotificationPort::new(tx1))
            .unwrap();
        mux.set_notification_port(100, NotificationPort::new(tx2))
            .unwrap();
        assert_eq!(
            mux.set_notification_port(100, NotificationPort::new(tx3)),
            Err(MuxError::PortsExhausted(100))
        );
    }

    #[test]
    fn test_memory_handles_exhaust() {
        let mux = ReportMultiplexer::new();
        mux.allocate_queue(100, 8, ENTRY).unwrap();
        assert!(mux.memory_handle(100).is_ok());
        assert_eq!(
            mux.memory_handle(100).unwrap_err(),
            MuxError::HandlesExhausted(100)
        );
    }

    #[test]
    fn test_clients_are_isolated() {
        let mux = ReportMultiplexer::new();
        mux.allocate_queue(100, 8, ENTRY).unwrap();
        mux.allocate_queue(200, 8, ENTRY).unwrap();
        assert_eq!(mux.client_count(), 2);
        assert!(mux.enqueue(100, &report(1), true));
        mux.free_queues(100).unwrap();
        assert!(mux.enqueue(200, &report(2), true));
        assert_eq!(mux.client_count(), 1);
    }
}
