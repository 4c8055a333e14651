//! # warden-core
//!
//! The sandbox observation core. External hooks notify a [`Sandbox`] of
//! process-lifetime and file-system events for the trees of processes
//! spawned by build tasks; the core decides whether each access has already
//! been classified and forwards access reports to the owning client exactly
//! once per relevant event while a tree is alive.
//!
//! A `Sandbox` is constructed once at startup and passed explicitly into
//! every hook entry point; there is no global mutable state. All hooks run
//! synchronously on the accessing thread and never block it for an
//! unbounded time: queue writes are fire-and-forget with an explicit
//! failure signal.

use std::cell::RefCell;
use std::sync::Arc;

use tracing::{debug, warn};

use warden_config::Config;
use warden_manifest::{FileAccessManifest, FileAccessStatus, PipId, RequestedAccess};
use warden_report::{
    AccessReport, MuxError, NotificationPort, QueueHandle, ReportMultiplexer, ReportOperation,
};
use warden_tracker::{PipSnapshot, ProcessTracker, SandboxedPip, UntrackOutcome};

/// Kinds of file operations delivered by the file-system hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperation {
    Lookup,
    Probe,
    Read,
    Write,
    Enumerate,
    CreateDirectory,
}

impl FileOperation {
    pub fn requested_access(self) -> RequestedAccess {
        match self {
            FileOperation::Lookup => RequestedAccess::LOOKUP,
            FileOperation::Probe => RequestedAccess::PROBE,
            FileOperation::Read => RequestedAccess::READ,
            FileOperation::Write => RequestedAccess::WRITE,
            FileOperation::Enumerate => RequestedAccess::ENUMERATE,
            FileOperation::CreateDirectory => RequestedAccess::CREATE_DIRECTORY,
        }
    }

    fn report_operation(self) -> ReportOperation {
        match self {
            FileOperation::Lookup => ReportOperation::FileLookup,
            FileOperation::Probe => ReportOperation::FileProbe,
            FileOperation::Read => ReportOperation::FileRead,
            FileOperation::Write => ReportOperation::FileWrite,
            FileOperation::Enumerate => ReportOperation::FileEnumerate,
            FileOperation::CreateDirectory => ReportOperation::FileCreateDirectory,
        }
    }
}

/// Outcome of one file-operation hook invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessVerdict {
    /// Whether the accessing process belongs to a tracked tree at all.
    pub tracked: bool,
    pub status: FileAccessStatus,
    /// The access was already classified for this path and tree.
    pub cache_hit: bool,
    /// A report was due for this event.
    pub report_due: bool,
    /// The due report reached a queue. False when no report was due or the
    /// client's queue was full or gone.
    pub delivered: bool,
}

impl AccessVerdict {
    fn untracked() -> Self {
        AccessVerdict {
            tracked: false,
            status: FileAccessStatus::Allowed,
            cache_hit: false,
            report_due: false,
            delivered: false,
        }
    }
}

/// The last path looked up on this OS thread, used to correlate a
/// lookup-style hook invocation with an immediately following hook that has
/// no cheap path of its own (exec). Thread-scoped, not process-scoped: the
/// two hook calls always execute back-to-back on one thread regardless of
/// which pip is logically involved.
struct LastLookup {
    pip_id: PipId,
    path: String,
}

thread_local! {
    static LAST_LOOKUP: RefCell<Option<LastLookup>> = const { RefCell::new(None) };
}

fn remember_lookup(pip_id: PipId, path: &str) {
    LAST_LOOKUP.with(|slot| {
        *slot.borrow_mut() = Some(LastLookup {
            pip_id,
            path: path.to_string(),
        });
    });
}

fn last_lookup_for(pip_id: PipId) -> Option<String> {
    LAST_LOOKUP.with(|slot| {
        slot.borrow()
            .as_ref()
            .filter(|last| last.pip_id == pip_id)
            .map(|last| last.path.clone())
    })
}

/// Read-only view of the whole sandbox, for diagnostics tooling.
#[derive(Debug, Clone)]
pub struct SandboxSnapshot {
    pub pips: Vec<PipSnapshot>,
    pub tracked_processes: usize,
    pub connected_clients: usize,
}

/// The observation core: one process tracker plus one report multiplexer,
/// threaded through every hook call.
pub struct Sandbox {
    tracker: ProcessTracker,
    queues: ReportMultiplexer,
    config: Config,
}

impl Sandbox {
    pub fn new(config: Config) -> Self {
        Sandbox {
            tracker: ProcessTracker::new(),
            queues: ReportMultiplexer::new(),
            config,
        }
    }

    pub fn tracker(&self) -> &ProcessTracker {
        &self.tracker
    }

    // ------------------------------------------------------------------
    // Client lifecycle
    // ------------------------------------------------------------------

    /// Allocates the configured number of report queues for a connecting
    /// client.
    pub fn on_client_connected(&self, client_pid: u32) -> Result<(), MuxError> {
        let entry_count = self.config.queue.entry_count(AccessReport::SIZE);
        for _ in 0..self.config.queue.queues_per_client.max(1) {
            self.queues
                .allocate_queue(client_pid, entry_count, AccessReport::SIZE as u32)?;
        }
        debug!(client_pid, entry_count, "client connected");
        Ok(())
    }

    /// Releases the client's queues and force-untracks every entity it
    /// owns. A vanished client can no longer consume reports for its
    /// processes, so its trees must not outlive it.
    pub fn on_client_disconnected(&self, client_pid: u32) -> Result<(), MuxError> {
        let freed = self.queues.free_queues(client_pid);
        let orphaned = self.tracker.untrack_all(client_pid);
        if !orphaned.is_empty() {
            warn!(
                client_pid,
                orphaned = orphaned.len(),
                "released tracked processes for disconnected client"
            );
        }
        freed
    }

    /// Attaches a wakeup port to the client's next port-less queue.
    pub fn set_notification_port(
        &self,
        client_pid: u32,
        port: NotificationPort,
    ) -> Result<(), MuxError> {
        self.queues.set_notification_port(client_pid, port)
    }

    /// Hands out the memory of the client's next queue.
    pub fn memory_handle(&self, client_pid: u32) -> Result<QueueHandle, MuxError> {
        self.queues.memory_handle(client_pid)
    }

    // ------------------------------------------------------------------
    // Process lifecycle hooks
    // ------------------------------------------------------------------

    /// A client started a pip: begin tracking its root process.
    pub fn on_pip_started(&self, root_pid: u32, manifest: Arc<FileAccessManifest>) -> bool {
        let pip = Arc::new(SandboxedPip::new(root_pid, manifest));
        let outcome = self.tracker.track_root(Arc::clone(&pip));
        if let Some(evicted) = outcome.evicted {
            self.report_completion_if_due(&evicted);
        }
        outcome.inserted
    }

    /// An already tracked process forked: link the child into the same tree.
    pub fn on_process_forked(&self, parent_pid: u32, child_pid: u32) -> bool {
        let Some(pip) = self.tracker.find(parent_pid) else {
            return false;
        };
        if !self.tracker.track_child(child_pid, &pip) {
            return false;
        }
        if self.config.tracker.report_process_lifetime {
            self.send_report(
                &pip,
                child_pid,
                ReportOperation::ProcessCreated,
                FileAccessStatus::Allowed,
                RequestedAccess::NONE,
                &pip.manifest().process_path,
            );
        }
        true
    }

    /// A process replaced its image.
    ///
    /// With `new_manifest_if_root` given, the exec is the start of a new
    /// pip under this pid (a client launching its root through exec) and is
    /// handled as [`Sandbox::on_pip_started`]. Otherwise the exec is
    /// reported for the tracked pid; the reported path comes from the last
    /// lookup observed on this thread (the exec hook itself has no cheap
    /// path), falling back to the pip's root image path.
    pub fn on_process_execed(
        &self,
        pid: u32,
        new_manifest_if_root: Option<Arc<FileAccessManifest>>,
    ) -> bool {
        if let Some(manifest) = new_manifest_if_root {
            return self.on_pip_started(pid, manifest);
        }
        let Some(pip) = self.tracker.find(pid) else {
            return false;
        };
        if self.config.tracker.report_process_lifetime {
            let path = last_lookup_for(pip.pip_id())
                .unwrap_or_else(|| pip.manifest().process_path.clone());
            self.send_report(
                &pip,
                pid,
                ReportOperation::ProcessExec,
                FileAccessStatus::Allowed,
                RequestedAccess::NONE,
                &path,
            );
        }
        true
    }

    /// A tracked process exited. Fires tree completion when this exit was
    /// the last live member of its tree.
    pub fn on_process_exited(&self, pid: u32) -> bool {
        let Some(outcome) = self.tracker.untrack(pid, None) else {
            return false;
        };
        if self.config.tracker.report_process_lifetime {
            self.send_report(
                &outcome.pip,
                pid,
                ReportOperation::ProcessExit,
                FileAccessStatus::Allowed,
                RequestedAccess::NONE,
                &outcome.pip.manifest().process_path,
            );
        }
        self.report_completion_if_due(&outcome);
        true
    }

    // ------------------------------------------------------------------
    // File operation hook
    // ------------------------------------------------------------------

    /// Decides one file operation: consult the owning pip's manifest, dedup
    /// against its path cache, and enqueue a report when one is due.
    pub fn on_file_operation(&self, pid: u32, path: &str, op: FileOperation) -> AccessVerdict {
        let Some(pip) = self.tracker.find(pid) else {
            return AccessVerdict::untracked();
        };

        if op == FileOperation::Lookup {
            remember_lookup(pip.pip_id(), path);
        }

        let check = pip.manifest().check(path, op.requested_access());

        // Paths with unrepresentable bytes bypass the cache: the operation
        // still gets a verdict, it just cannot be deduplicated.
        let cache_hit = match pip.cache_lookup(path) {
            Some(record) => record.check_and_update(check.requested_access),
            None => false,
        };

        let report_due = check.should_report && !cache_hit;
        let delivered = report_due
            && self.send_report(
                &pip,
                pid,
                op.report_operation(),
                check.status,
                check.requested_access,
                path,
            );

        AccessVerdict {
            tracked: true,
            status: check.status,
            cache_hit,
            report_due,
            delivered,
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Read-only snapshot of tracker and queue state; never mutates and is
    /// safe to call concurrently with all hooks.
    pub fn introspect(&self) -> SandboxSnapshot {
        SandboxSnapshot {
            pips: self.tracker.snapshot(),
            tracked_processes: self.tracker.tracked_count(),
            connected_clients: self.queues.client_count(),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn report_completion_if_due(&self, outcome: &UntrackOutcome) {
        if !outcome.tree_completed {
            return;
        }
        self.send_report(
            &outcome.pip,
            outcome.pip.process_id(),
            ReportOperation::ProcessTreeCompleted,
            FileAccessStatus::Allowed,
            RequestedAccess::NONE,
            &outcome.pip.manifest().process_path,
        );
    }

    fn send_report(
        &self,
        pip: &Arc<SandboxedPip>,
        pid: u32,
        operation: ReportOperation,
        status: FileAccessStatus,
        requested: RequestedAccess,
        path: &str,
    ) -> bool {
        let report = AccessReport::new(
            operation,
            status,
            pip.client_pid(),
            pid,
            pip.process_id(),
            requested,
            pip.pip_id(),
            path,
        );
        let delivered = self.queues.enqueue(pip.client_pid(), &report, true);
        if delivered {
            debug!(
                client_pid = pip.client_pid(),
                pid,
                operation = operation.name(),
                path,
                "report enqueued"
            );
        } else {
            warn!(
                client_pid = pip.client_pid(),
                pid,
                operation = operation.name(),
                path,
                "report delivery failed"
            );
        }
        delivered
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("tracked", &self.tracker.tracked_count())
            .field("clients", &self.queues.client_count())
            .finish()
    }
}
