//! # warden-trie
//!
//! A thread-safe, lock-free dictionary over two key universes: unsigned
//! integers (process ids) and ascii paths.
//!
//! Values are reference-counted (`Arc<V>`) and shared between the trie and
//! whichever caller holds a returned handle; the trie drops its own reference
//! when an entry is replaced or removed.
//!
//! Paths are matched case-insensitively. Attempting to use a path containing
//! a byte outside the addressable ascii range (32..=122) fails gracefully
//! with [`TrieResult::Failure`] and never mutates the structure.
//!
//! Readers never block on writers. Writers resolve contention on a single
//! slot via compare-and-swap with an explicit [`TrieResult::Race`] outcome;
//! the caller decides whether to retry or accept the existing state.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use once_cell::sync::OnceCell;

/// Fanout for path-keyed nodes: every ascii byte between 32 (' ') and 122
/// ('z') gets a unique child slot after case folding, at index
/// `upper(ch) - 32`.
const PATH_NODE_CHILDREN: usize = 65;

/// Fanout for integer-keyed nodes, one slot per decimal digit.
const UINT_NODE_CHILDREN: usize = 10;

static NUM_UINT_NODES: AtomicUsize = AtomicUsize::new(0);
static NUM_PATH_NODES: AtomicUsize = AtomicUsize::new(0);

/// Which key universe a [`Trie`] accepts. Fixed at construction, never mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrieKind {
    Uint,
    Path,
}

/// Outcome of a trie mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrieResult {
    Inserted,
    Replaced,
    Removed,
    /// The requested state already holds; not an error.
    AlreadyEmpty,
    /// The requested state already holds; not an error.
    AlreadyExists,
    /// A concurrent mutation interleaved with this one; the caller decides
    /// whether to retry or accept the existing outcome.
    Race,
    /// Unrepresentable input (key outside the ascii range, kind mismatch).
    /// No partial mutation occurred.
    Failure,
}

/// A key for trie operations. `u64` and `&str` convert implicitly.
#[derive(Debug, Clone, Copy)]
pub enum Key<'a> {
    Uint(u64),
    Path(&'a str),
}

impl From<u64> for Key<'static> {
    fn from(key: u64) -> Self {
        Key::Uint(key)
    }
}

impl<'a> From<&'a str> for Key<'a> {
    fn from(key: &'a str) -> Self {
        Key::Path(key)
    }
}

/// Key handed back during [`Trie::for_each`] traversal. Path bytes are
/// case-folded (the form the trie stores).
#[derive(Debug, Clone, Copy)]
pub enum VisitKey<'a> {
    Uint(u64),
    Path(&'a [u8]),
}

/// Per-kind node allocation statistics.
#[derive(Debug, Clone, Copy)]
pub struct NodeStats {
    pub count: usize,
    pub approx_bytes: usize,
}

/// Returns how many nodes of the given kind are currently allocated across
/// all tries, and an estimate of the memory they pin.
pub fn node_stats(kind: TrieKind) -> NodeStats {
    let (count, fanout) = match kind {
        TrieKind::Uint => (NUM_UINT_NODES.load(Ordering::Relaxed), UINT_NODE_CHILDREN),
        TrieKind::Path => (NUM_PATH_NODES.load(Ordering::Relaxed), PATH_NODE_CHILDREN),
    };
    let per_node = std::mem::size_of::<Node<()>>() + fanout * std::mem::size_of::<usize>();
    NodeStats {
        count,
        approx_bytes: count * per_node,
    }
}

/// Maps a path byte to its child slot, or `None` if the byte is outside the
/// addressable range. Case folding happens here: 'a'..='z' share slots with
/// 'A'..='Z'.
#[inline]
fn path_slot(byte: u8) -> Option<usize> {
    if !(32..=122).contains(&byte) {
        return None;
    }
    Some((byte.to_ascii_uppercase() - 32) as usize)
}

/// Inverse of [`path_slot`], used to rebuild keys during traversal.
#[inline]
fn slot_byte(slot: usize) -> u8 {
    slot as u8 + 32
}

struct Node<V> {
    kind: TrieKind,
    children: Box<[AtomicPtr<Node<V>>]>,
    record: ArcSwapOption<V>,
}

impl<V> Node<V> {
    fn new(kind: TrieKind) -> Self {
        let fanout = match kind {
            TrieKind::Uint => {
                NUM_UINT_NODES.fetch_add(1, Ordering::Relaxed);
                UINT_NODE_CHILDREN
            }
            TrieKind::Path => {
                NUM_PATH_NODES.fetch_add(1, Ordering::Relaxed);
                PATH_NODE_CHILDREN
            }
        };
        let children = (0..fanout)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Node {
            kind,
            children,
            record: ArcSwapOption::empty(),
        }
    }

    /// Returns the child at `slot`, creating it if absent.
    ///
    /// Creation is a single-writer-wins compare-and-swap: the slot
    /// transitions from null to non-null exactly once, a losing creator
    /// frees its node and re-reads the winner's. No retry loop is needed.
    fn child_or_create(&self, slot: usize) -> &Node<V> {
        let ptr = self.children[slot].load(Ordering::Acquire);
        if !ptr.is_null() {
            return unsafe { &*ptr };
        }

        let fresh = Box::into_raw(Box::new(Node::new(self.kind)));
        match self.children[slot].compare_exchange(
            std::ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => unsafe { &*fresh },
            Err(winner) => {
                // Lost the race: another thread published this child first.
                unsafe { drop(Box::from_raw(fresh)) };
                unsafe { &*winner }
            }
        }
    }

    fn child(&self, slot: usize) -> Option<&Node<V>> {
        let ptr = self.children[slot].load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }
}

impl<V> Drop for Node<V> {
    fn drop(&mut self) {
        for slot in self.children.iter_mut() {
            let ptr = *slot.get_mut();
            if !ptr.is_null() {
                unsafe { drop(Box::from_raw(ptr)) };
            }
        }
        match self.kind {
            TrieKind::Uint => NUM_UINT_NODES.fetch_sub(1, Ordering::Relaxed),
            TrieKind::Path => NUM_PATH_NODES.fetch_sub(1, Ordering::Relaxed),
        };
    }
}

type OnChangeFn = Box<dyn Fn(usize, usize) + Send + Sync>;

/// A lock-free dictionary storing one `Arc<V>` per key.
///
/// Invariant: [`Trie::count`] equals the number of sentinel nodes (nodes
/// carrying a record) reachable from the root.
pub struct Trie<V> {
    root: Node<V>,
    kind: TrieKind,
    count: AtomicUsize,
    on_change: OnceCell<OnChangeFn>,
}

fn same_value<V>(a: &Option<Arc<V>>, b: &Option<Arc<V>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

impl<V> Trie<V> {
    pub fn uint_keyed() -> Self {
        Self::new(TrieKind::Uint)
    }

    pub fn path_keyed() -> Self {
        Self::new(TrieKind::Path)
    }

    fn new(kind: TrieKind) -> Self {
        Trie {
            root: Node::new(kind),
            kind,
            count: AtomicUsize::new(0),
            on_change: OnceCell::new(),
        }
    }

    pub fn kind(&self) -> TrieKind {
        self.kind
    }

    /// Number of values stored (not the number of nodes).
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Registers a callback invoked with `(old_count, new_count)` every time
    /// the entry count changes. May only be registered once; returns false
    /// if a callback is already installed.
    pub fn on_change(&self, callback: impl Fn(usize, usize) + Send + Sync + 'static) -> bool {
        self.on_change.set(Box::new(callback)).is_ok()
    }

    fn count_changed(&self, old: usize, new: usize) {
        if let Some(callback) = self.on_change.get() {
            callback(old, new);
        }
    }

    fn incr_count(&self) {
        let old = self.count.fetch_add(1, Ordering::AcqRel);
        self.count_changed(old, old + 1);
    }

    fn decr_count(&self) {
        let old = self.count.fetch_sub(1, Ordering::AcqRel);
        self.count_changed(old, old - 1);
    }

    /// Walks to the terminal node for `key`, creating interior nodes on
    /// demand. Returns `None` when the key is unrepresentable or its kind
    /// does not match this trie.
    fn find_node(&self, key: Key<'_>) -> Option<&Node<V>> {
        match (self.kind, key) {
            (TrieKind::Uint, Key::Uint(mut k)) => {
                let mut node = &self.root;
                loop {
                    node = node.child_or_create((k % 10) as usize);
                    k /= 10;
                    if k == 0 {
                        return Some(node);
                    }
                }
            }
            (TrieKind::Path, Key::Path(path)) => {
                let mut node = &self.root;
                for &byte in path.as_bytes() {
                    node = node.child_or_create(path_slot(byte)?);
                }
                Some(node)
            }
            _ => None,
        }
    }

    /// Returns the value associated with `key`, or `None`.
    pub fn get<'a>(&self, key: impl Into<Key<'a>>) -> Option<Arc<V>> {
        self.find_node(key.into())?.record.load_full()
    }

    /// Returns the value associated with `key`, creating one with `factory`
    /// if absent.
    ///
    /// `factory` may be invoked without its value being stored: under a
    /// race, the concurrently inserted value wins and the loser's freshly
    /// created value is dropped. Callers must not rely on side effects in
    /// the factory. Returns `None` only for unrepresentable keys.
    pub fn get_or_add<'a>(
        &self,
        key: impl Into<Key<'a>>,
        factory: impl FnOnce() -> V,
    ) -> Option<Arc<V>> {
        let node = self.find_node(key.into())?;
        if let Some(existing) = node.record.load_full() {
            return Some(existing);
        }

        let candidate = Arc::new(factory());
        let prev = node
            .record
            .compare_and_swap(&None::<Arc<V>>, Some(Arc::clone(&candidate)));
        match &*prev {
            None => {
                self.incr_count();
                Some(candidate)
            }
            // Lost the race: drop the candidate, everyone observes the winner.
            Some(winner) => Some(Arc::clone(winner)),
        }
    }

    /// Associates `value` with `key` only if no value is present.
    pub fn insert<'a>(&self, key: impl Into<Key<'a>>, value: Arc<V>) -> TrieResult {
        let Some(node) = self.find_node(key.into()) else {
            return TrieResult::Failure;
        };
        let prev = node.record.compare_and_swap(&None::<Arc<V>>, Some(value));
        if prev.is_none() {
            self.incr_count();
            TrieResult::Inserted
        } else {
            TrieResult::AlreadyExists
        }
    }

    /// Associates `value` with `key` even if a value is already present.
    ///
    /// A concurrent `remove`/`replace` interleaving between the read and the
    /// swap is reported as [`TrieResult::Race`], never silently overwritten.
    pub fn replace<'a>(&self, key: impl Into<Key<'a>>, value: Arc<V>) -> TrieResult {
        let Some(node) = self.find_node(key.into()) else {
            return TrieResult::Failure;
        };
        let observed = node.record.load();
        let had_value = observed.is_some();
        let prev = node.record.compare_and_swap(&*observed, Some(value));
        if !same_value(&observed, &prev) {
            return TrieResult::Race;
        }
        if had_value {
            TrieResult::Replaced
        } else {
            self.incr_count();
            TrieResult::Inserted
        }
    }

    /// Removes any value associated with `key`.
    pub fn remove<'a>(&self, key: impl Into<Key<'a>>) -> TrieResult {
        let Some(node) = self.find_node(key.into()) else {
            return TrieResult::Failure;
        };
        self.remove_at(node)
    }

    fn remove_at(&self, node: &Node<V>) -> TrieResult {
        let observed = node.record.load();
        if observed.is_none() {
            return TrieResult::AlreadyEmpty;
        }
        let prev = node.record.compare_and_swap(&*observed, None);
        if same_value(&observed, &prev) {
            self.decr_count();
            TrieResult::Removed
        } else {
            TrieResult::Race
        }
    }

    /// Invokes `visit` for every entry. Traversal is safe to run
    /// concurrently with mutations; entries inserted or removed mid-walk may
    /// or may not be observed.
    pub fn for_each(&self, mut visit: impl FnMut(VisitKey<'_>, &Arc<V>)) {
        match self.kind {
            TrieKind::Uint => self.walk_uint(&self.root, 0, 1, &mut visit),
            TrieKind::Path => {
                let mut key = Vec::new();
                self.walk_path(&self.root, &mut key, &mut visit);
            }
        }
    }

    fn walk_uint(
        &self,
        node: &Node<V>,
        acc: u64,
        place: u64,
        visit: &mut impl FnMut(VisitKey<'_>, &Arc<V>),
    ) {
        // Digits are stored least-significant first, so a child at depth d
        // contributes digit * 10^d.
        for slot in 0..node.children.len() {
            let Some(child) = node.child(slot) else {
                continue;
            };
            let key = acc + slot as u64 * place;
            if let Some(value) = child.record.load_full() {
                visit(VisitKey::Uint(key), &value);
            }
            // wrapping: the place value is unused past the 20th digit, where
            // no u64 key can have created children.
            self.walk_uint(child, key, place.wrapping_mul(10), visit);
        }
    }

    fn walk_path(
        &self,
        node: &Node<V>,
        key: &mut Vec<u8>,
        visit: &mut impl FnMut(VisitKey<'_>, &Arc<V>),
    ) {
        if let Some(value) = node.record.load_full() {
            visit(VisitKey::Path(key), &value);
        }
        for slot in 0..node.children.len() {
            let Some(child) = node.child(slot) else {
                continue;
            };
            key.push(slot_byte(slot));
            self.walk_path(child, key, visit);
            key.pop();
        }
    }

    /// Removes every entry matching `predicate`. Entries that race with a
    /// concurrent mutation are left for the caller's next sweep.
    pub fn remove_matching(&self, predicate: impl Fn(&V) -> bool) {
        self.sweep(&self.root, &predicate);
    }

    fn sweep(&self, node: &Node<V>, predicate: &impl Fn(&V) -> bool) {
        if let Some(value) = node.record.load_full() {
            if predicate(&value) {
                self.remove_at(node);
            }
        }
        for slot in 0..node.children.len() {
            if let Some(child) = node.child(slot) {
                self.sweep(child, predicate);
            }
        }
    }
}

impl<V> std::fmt::Debug for Trie<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trie")
            .field("kind", &self.kind)
            .field("count", &self.count())
            .finish()
    }
}
