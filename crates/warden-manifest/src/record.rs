//! Requested-access flags and the per-path report cache record.

use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// A bitwise disjunction of access kinds requested for a path.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct RequestedAccess(pub u32);

impl RequestedAccess {
    pub const NONE: RequestedAccess = RequestedAccess(0);
    pub const LOOKUP: RequestedAccess = RequestedAccess(1 << 0);
    pub const PROBE: RequestedAccess = RequestedAccess(1 << 1);
    pub const READ: RequestedAccess = RequestedAccess(1 << 2);
    pub const WRITE: RequestedAccess = RequestedAccess(1 << 3);
    pub const ENUMERATE: RequestedAccess = RequestedAccess(1 << 4);
    pub const CREATE_DIRECTORY: RequestedAccess = RequestedAccess(1 << 5);
    pub const ALL: RequestedAccess = RequestedAccess(0x3F);

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// True if every flag in `other` is present in `self`.
    #[inline]
    pub fn covers(self, other: RequestedAccess) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: RequestedAccess) -> bool {
        self.0 & other.0 != 0
    }

    /// The accesses transitively implied by `self`: Probe implies Lookup,
    /// Read implies Probe, Write implies Read.
    pub fn implies(self) -> RequestedAccess {
        let mut implied = RequestedAccess::NONE;
        if self.covers(Self::PROBE) {
            implied |= Self::LOOKUP;
        }
        if self.covers(Self::READ) {
            implied |= Self::PROBE | Self::LOOKUP;
        }
        if self.covers(Self::WRITE) {
            implied |= Self::READ | Self::PROBE | Self::LOOKUP;
        }
        implied
    }

    /// The accesses whose presence implies `self` (the inverse of
    /// [`RequestedAccess::implies`]).
    pub fn implied_by(self) -> RequestedAccess {
        match self {
            Self::LOOKUP => Self::PROBE | Self::READ | Self::WRITE,
            Self::PROBE => Self::READ | Self::WRITE,
            Self::READ => Self::WRITE,
            _ => Self::NONE,
        }
    }
}

impl BitOr for RequestedAccess {
    type Output = RequestedAccess;

    fn bitor(self, rhs: RequestedAccess) -> RequestedAccess {
        RequestedAccess(self.0 | rhs.0)
    }
}

impl BitOrAssign for RequestedAccess {
    fn bitor_assign(&mut self, rhs: RequestedAccess) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Display for RequestedAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: &[(RequestedAccess, &str)] = &[
            (RequestedAccess::LOOKUP, "lookup"),
            (RequestedAccess::PROBE, "probe"),
            (RequestedAccess::READ, "read"),
            (RequestedAccess::WRITE, "write"),
            (RequestedAccess::ENUMERATE, "enumerate"),
            (RequestedAccess::CREATE_DIRECTORY, "mkdir"),
        ];
        if self.is_none() {
            return write!(f, "none");
        }
        let mut first = true;
        for (flag, name) in NAMES {
            if self.covers(*flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Tracks which accesses have already been reported for a single path.
///
/// Check and update are a single atomic `fetch_or`, so concurrent callers
/// for the same path agree on exactly one of them seeing a miss per new
/// access kind. Stored behind a path-keyed trie, one record per path.
#[derive(Debug, Default)]
pub struct CacheRecord {
    reported: AtomicU32,
}

impl CacheRecord {
    pub fn new() -> Self {
        CacheRecord {
            reported: AtomicU32::new(RequestedAccess::NONE.0),
        }
    }

    /// The disjunction of all accesses reported so far.
    pub fn reported_accesses(&self) -> RequestedAccess {
        RequestedAccess(self.reported.load(Ordering::Acquire))
    }

    /// Atomically determines whether `access` was already covered by earlier
    /// reports (a cache hit) and, if not, folds it in together with its
    /// implication closure so the same access hits next time.
    pub fn check_and_update(&self, access: RequestedAccess) -> bool {
        let wanted = access | access.implies();
        let previous = self.reported.fetch_or(wanted.0, Ordering::AcqRel);
        RequestedAccess(previous).covers(access)
    }

    /// True if an already-reported access implies `access` without matching
    /// it exactly (e.g. a reported Write makes a later Read redundant).
    pub fn has_stronger_access(&self, access: RequestedAccess) -> bool {
        self.reported_accesses().intersects(access.implied_by())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_implication_closure() {
        assert_eq!(RequestedAccess::PROBE.implies(), RequestedAccess::LOOKUP);
        assert_eq!(
            RequestedAccess::READ.implies(),
            RequestedAccess::PROBE | RequestedAccess::LOOKUP
        );
        assert_eq!(
            RequestedAccess::WRITE.implies(),
            RequestedAccess::READ | RequestedAccess::PROBE | RequestedAccess::LOOKUP
        );
        assert_eq!(RequestedAccess::ENUMERATE.implies(), RequestedAccess::NONE);
    }

    #[test]
    fn test_implied_by_is_inverse() {
        for flag in [
            RequestedAccess::LOOKUP,
            RequestedAccess::PROBE,
            RequestedAccess::READ,
        ] {
            let stronger = flag.implied_by();
            for candidate in [
                RequestedAccess::PROBE,
                RequestedAccess::READ,
                RequestedAccess::WRITE,
            ] {
                assert_eq!(
                    stronger.covers(candidate),
                    candidate.implies().covers(flag),
                    "inverse mismatch for {} vs {}",
                    flag,
                    candidate
                );
            }
        }
    }

    #[test]
    fn test_first_access_misses_second_hits() {
        let record = CacheRecord::new();
        assert!(!record.check_and_update(RequestedAccess::READ));
        assert!(record.check_and_update(RequestedAccess::READ));
    }

    #[test]
    fn test_write_makes_read_a_hit() {
        let record = CacheRecord::new();
        assert!(!record.check_and_update(RequestedAccess::WRITE));
        assert!(record.check_and_update(RequestedAccess::READ));
        assert!(record.check_and_update(RequestedAccess::PROBE));
        assert!(record.check_and_update(RequestedAccess::LOOKUP));
    }

    #[test]
    fn test_read_does_not_cover_write() {
        let record = CacheRecord::new();
        assert!(!record.check_and_update(RequestedAccess::READ));
        assert!(!record.check_and_update(RequestedAccess::WRITE));
        assert!(record.check_and_update(RequestedAccess::WRITE));
    }

    #[test]
    fn test_has_stronger_access() {
        let record = CacheRecord::new();
        record.check_and_update(RequestedAccess::WRITE);
        assert!(record.has_stronger_access(RequestedAccess::READ));
        assert!(!record.has_stronger_access(RequestedAccess::ENUMERATE));
    }

    #[test]
    fn test_concurrent_exactly_one_miss() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;
        use std::thread;

        let record = Arc::new(CacheRecord::new());
        let misses = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..8 {
            let record = Arc::clone(&record);
            let misses = Arc::clone(&misses);
            handles.push(thread::spawn(move || {
                if !record.check_and_update(RequestedAccess::READ) {
                    misses.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(misses.load(Ordering::SeqCst), 1);
    }
}
