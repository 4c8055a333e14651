//! # warden-tracker
//!
//! Process-tree lifecycle tracking. A [`SandboxedPip`] represents one build
//! task's process tree: the root process plus everything it transitively
//! spawns shares a single entity. The [`ProcessTracker`] maps every live
//! pid in any tree to its entity and detects, without races, the exact
//! moment an entire tree has terminated.
//!
//! Lookups are lock-free and run on every intercepted file access, so they
//! must stay fast even when nothing is tracked. Structural mutations
//! (insert/remove of pid mappings, stale-root eviction) are serialized under
//! a single reentrant lock held only for O(1) dictionary edits, never
//! across a trie traversal or a queue write.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use tracing::{debug, error, warn};

use warden_manifest::{CacheRecord, FileAccessManifest, PipId};
use warden_trie::{Trie, TrieResult, VisitKey};

/// One tracked process tree.
///
/// Created when a root process is first observed; children are linked to the
/// same entity, never given a private one. The entity outlives its
/// dictionary entries for as long as any caller still holds a reference.
pub struct SandboxedPip {
    /// Pid of the root process of this pip.
    process_id: u32,
    /// Pid of the client that owns this pip.
    client_pid: u32,
    /// Read-only after creation; shared by the whole tree.
    manifest: Arc<FileAccessManifest>,
    /// Number of live processes in this pip's tree.
    tree_count: AtomicI32,
    /// Latch guaranteeing tree completion fires at most once.
    completed: AtomicBool,
    /// Maps every accessed path to the record of already-reported accesses.
    path_cache: Trie<CacheRecord>,
}

impl SandboxedPip {
    pub fn new(process_id: u32, manifest: Arc<FileAccessManifest>) -> Self {
        SandboxedPip {
            process_id,
            client_pid: manifest.client_pid,
            manifest,
            tree_count: AtomicI32::new(0),
            completed: AtomicBool::new(false),
            path_cache: Trie::path_keyed(),
        }
    }

    pub fn pip_id(&self) -> PipId {
        self.manifest.pip_id
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn client_pid(&self) -> u32 {
        self.client_pid
    }

    pub fn manifest(&self) -> &Arc<FileAccessManifest> {
        &self.manifest
    }

    /// Number of currently live processes in this pip's tree.
    pub fn tree_size(&self) -> i32 {
        self.tree_count.load(Ordering::Acquire)
    }

    /// Number of distinct paths this pip has cached decisions for.
    pub fn cache_entries(&self) -> usize {
        self.path_cache.count()
    }

    /// Looks up the cache record for `path`, creating one on first touch.
    /// `None` means the path cannot be cached (unrepresentable bytes); the
    /// caller proceeds without dedup.
    pub fn cache_lookup(&self, path: &str) -> Option<Arc<CacheRecord>> {
        self.path_cache.get_or_add(path, CacheRecord::new)
    }

    fn link(&self) -> i32 {
        self.tree_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops one tree member. True exactly when this call emptied the tree,
    /// at most once per entity.
    fn unlink(&self) -> bool {
        let previous = self.tree_count.fetch_sub(1, Ordering::AcqRel);
        previous == 1 && !self.completed.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for SandboxedPip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxedPip")
            .field("pip_id", &self.pip_id())
            .field("process_id", &self.process_id)
            .field("client_pid", &self.client_pid)
            .field("tree_size", &self.tree_size())
            .finish()
    }
}

/// Result of [`ProcessTracker::track_root`].
#[derive(Debug)]
pub struct TrackRootOutcome {
    pub inserted: bool,
    /// A stale entity evicted because a prior client's root reused the same
    /// pid, together with whether the eviction completed its tree.
    pub evicted: Option<UntrackOutcome>,
}

/// Result of a successful untrack.
#[derive(Debug)]
pub struct UntrackOutcome {
    pub pip: Arc<SandboxedPip>,
    /// True exactly when this untrack emptied the tree.
    pub tree_completed: bool,
}

/// Read-only view of one tracked pip, for diagnostics tooling.
#[derive(Debug, Clone)]
pub struct PipSnapshot {
    pub pid: u32,
    pub client_pid: u32,
    pub pip_id: PipId,
    pub tree_size: i32,
    pub cache_entries: usize,
    pub process_path: String,
}

/// Maps process ids to [`SandboxedPip`] entities across the whole system.
pub struct ProcessTracker {
    /// Pid -> entity. A child pid maps to its root's entity.
    processes: Trie<SandboxedPip>,
    /// Serializes structural mutations only; reentrant because eviction
    /// paths nest (track_root untracks a stale entry under the same lock).
    lock: ReentrantMutex<()>,
}

impl Default for ProcessTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTracker {
    pub fn new() -> Self {
        ProcessTracker {
            processes: Trie::uint_keyed(),
            lock: ReentrantMutex::new(()),
        }
    }

    /// Returns the entity tracking `pid`, if any.
    ///
    /// Lock-free: this runs on every single file access any observed
    /// process makes, and must stay O(pid digits) even while the tracker is
    /// empty.
    pub fn find(&self, pid: u32) -> Option<Arc<SandboxedPip>> {
        self.processes.get(pid as u64)
    }

    /// Number of tracked pid mappings (tree members, not trees).
    pub fn tracked_count(&self) -> usize {
        self.processes.count()
    }

    /// Starts tracking a pip's root process.
    ///
    /// A pre-existing mapping for the same pid means a prior client's root
    /// reused an OS-assigned id (observable when a sandboxed build launches
    /// a sandboxed build); the stale entry is untracked first.
    pub fn track_root(&self, pip: Arc<SandboxedPip>) -> TrackRootOutcome {
        let _guard = self.lock.lock();
        let pid = pip.process_id();

        let evicted = self.processes.get(pid as u64).and_then(|stale| {
            warn!(
                pid,
                stale_pip = %stale.pip_id(),
                new_pip = %pip.pip_id(),
                "untracking stale entity before reusing pid"
            );
            self.untrack_entry(pid, stale)
        });

        let inserted = self.processes.insert(pid as u64, Arc::clone(&pip)) == TrieResult::Inserted;
        if inserted {
            pip.link();
            debug!(pid, pip_id = %pip.pip_id(), "tracking root process");
        } else {
            error!(pid, "failed to insert root process mapping");
        }
        TrackRootOutcome { inserted, evicted }
    }

    /// Maps a child pid to its root's entity and grows the live count.
    ///
    /// A child pid that is already tracked makes this a no-op returning
    /// false; if the existing entity disagrees with the intended root's
    /// identity the mismatch is logged as a data-consistency error and the
    /// existing entry wins; trees are never silently merged.
    pub fn track_child(&self, child_pid: u32, root: &Arc<SandboxedPip>) -> bool {
        let _guard = self.lock.lock();

        if let Some(existing) = self.processes.get(child_pid as u64) {
            debug!(
                child_pid,
                existing_root = existing.process_id(),
                intended_root = root.process_id(),
                "child process already tracked"
            );
            if existing.pip_id() != root.pip_id() && existing.client_pid() != root.client_pid() {
                error!(
                    child_pid,
                    existing_pip = %existing.pip_id(),
                    existing_client = existing.client_pid(),
                    intended_pip = %root.pip_id(),
                    intended_client = root.client_pid(),
                    "tracked child does not match its intended root"
                );
            }
            return false;
        }

        if self.processes.insert(child_pid as u64, Arc::clone(root)) != TrieResult::Inserted {
            return false;
        }
        let size = root.link();
        debug!(
            child_pid,
            root_pid = root.process_id(),
            tree_size = size,
            "tracking child process"
        );
        true
    }

    /// Stops tracking `pid`. With `expected_pip` given, the mapping is only
    /// removed when the found entity belongs to that pip.
    pub fn untrack(&self, pid: u32, expected_pip: Option<PipId>) -> Option<UntrackOutcome> {
        let _guard = self.lock.lock();
        let pip = self.find(pid)?;
        if let Some(expected) = expected_pip {
            if pip.pip_id() != expected {
                return None;
            }
        }
        self.untrack_entry(pid, pip)
    }

    /// Force-untracks every entity owned by `client_pid`. Invoked when a
    /// client disconnects (including ungracefully) so no entity outlives its
    /// client. Returns each removed mapping; completed trees are flagged.
    pub fn untrack_all(&self, client_pid: u32) -> Vec<UntrackOutcome> {
        let _guard = self.lock.lock();
        let mut pids = Vec::new();
        self.processes.for_each(|key, pip| {
            if pip.client_pid() == client_pid {
                if let VisitKey::Uint(pid) = key {
                    pids.push(pid as u32);
                }
            }
        });

        let mut outcomes = Vec::with_capacity(pids.len());
        for pid in pids {
            if let Some(pip) = self.find(pid) {
                debug!(pid, client_pid, "force-untracking process for vanished client");
                if let Some(outcome) = self.untrack_entry(pid, pip) {
                    outcomes.push(outcome);
                }
            }
        }
        outcomes
    }

    /// Removes the mapping for `pid` and drops one tree member. Caller
    /// holds the structural lock.
    fn untrack_entry(&self, pid: u32, pip: Arc<SandboxedPip>) -> Option<UntrackOutcome> {
        if self.processes.remove(pid as u64) != TrieResult::Removed {
            error!(pid, "process not found in tracked processes");
            return None;
        }
        let tree_completed = pip.unlink();
        debug!(
            pid,
            pip_id = %pip.pip_id(),
            tree_size = pip.tree_size(),
            tree_completed,
            "untracked process"
        );
        Some(UntrackOutcome {
            pip,
            tree_completed,
        })
    }

    /// Read-only snapshot of every tracked tree, safe to call concurrently
    /// with all other operations. One entry per root; child mappings are
    /// folded into their root's tree size.
    pub fn snapshot(&self) -> Vec<PipSnapshot> {
        let mut pips = Vec::new();
        self.processes.for_each(|key, pip| {
            if let VisitKey::Uint(pid) = key {
                if pid as u32 == pip.process_id() {
                    pips.push(PipSnapshot {
                        pid: pip.process_id(),
                        client_pid: pip.client_pid(),
                        pip_id: pip.pip_id(),
                        tree_size: pip.tree_size(),
                        cache_entries: pip.cache_entries(),
                        process_path: pip.manifest().process_path.clone(),
                    });
                }
            }
        });
        pips
    }
}

impl std::fmt::Debug for ProcessTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessTracker")
            .field("tracked", &self.tracked_count())
            .finish()
    }
}
