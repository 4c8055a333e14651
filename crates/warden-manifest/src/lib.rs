//! # warden-manifest
//!
//! The read-only policy view attached to every tracked pip, plus the
//! per-path [`CacheRecord`] used to decide whether an access was already
//! reported.
//!
//! The manifest wire encoding and the full access-policy decision algorithm
//! live with the client; this crate defines the interface the sandbox core
//! consumes and a deterministic longest-prefix policy table.

pub mod record;

pub use record::{CacheRecord, RequestedAccess};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier of a pip (a build task and its process tree).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct PipId(pub u64);

impl std::fmt::Display for PipId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("manifest has no pip id")]
    MissingPipId,
    #[error("policy scope has an empty path prefix")]
    EmptyScopePrefix,
}

/// Verdict of a policy check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileAccessStatus {
    Allowed,
    Denied,
}

/// Result of checking one file operation against a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessCheckResult {
    pub status: FileAccessStatus,
    /// Whether this access is policy-relevant and should be reported to the
    /// owning client (subject to per-path dedup).
    pub should_report: bool,
    pub requested_access: RequestedAccess,
}

/// One policy scope: the longest matching normalized prefix wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyScope {
    pub prefix: String,
    /// Accesses permitted under this scope.
    pub allowed: RequestedAccess,
    /// Whether accesses under this scope are reported.
    pub report: bool,
}

/// Fallback policy for paths no scope covers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DefaultPolicy {
    pub allowed: RequestedAccess,
    pub report: bool,
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        // Unscoped paths are permitted but reported, so the client sees
        // every access its policy did not anticipate.
        DefaultPolicy {
            allowed: RequestedAccess::ALL,
            report: true,
        }
    }
}

/// Read-only per-pip policy data. Built once when the pip starts, shared by
/// every process in the pip's tree, never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAccessManifest {
    pub pip_id: PipId,
    /// Process id of the client that owns this pip.
    pub client_pid: u32,
    /// Full path of the pip's root process image.
    pub process_path: String,
    scopes: Vec<PolicyScope>,
    #[serde(default)]
    default_policy: DefaultPolicy,
}

impl FileAccessManifest {
    pub fn new(
        pip_id: PipId,
        client_pid: u32,
        process_path: impl Into<String>,
        mut scopes: Vec<PolicyScope>,
        default_policy: DefaultPolicy,
    ) -> Result<Self, ManifestError> {
        if pip_id.0 == 0 {
            return Err(ManifestError::MissingPipId);
        }
        if scopes.iter().any(|s| s.prefix.is_empty()) {
            return Err(ManifestError::EmptyScopePrefix);
        }
        for scope in &mut scopes {
            scope.prefix = normalize_prefix(&scope.prefix);
        }
        Ok(FileAccessManifest {
            pip_id,
            client_pid,
            process_path: process_path.into(),
            scopes,
            default_policy,
        })
    }

    /// A permissive manifest that reports everything; used by diagnostics
    /// and tests.
    pub fn report_all(pip_id: PipId, client_pid: u32, process_path: impl Into<String>) -> Self {
        FileAccessManifest {
            pip_id,
            client_pid,
            process_path: process_path.into(),
            scopes: Vec::new(),
            default_policy: DefaultPolicy::default(),
        }
    }

    /// Checks one file operation against this manifest. The longest
    /// matching scope prefix decides.
    pub fn check(&self, path: &str, requested: RequestedAccess) -> AccessCheckResult {
        let normalized = normalize_prefix(path);
        // Prefixes are re-normalized here rather than trusted, since
        // manifests may arrive through deserialization.
        let (allowed, report) = match self
            .scopes
            .iter()
            .map(|scope| (normalize_prefix(&scope.prefix), scope))
            .filter(|(prefix, _)| prefix_matches(prefix, &normalized))
            .max_by_key(|(prefix, _)| prefix.len())
        {
            Some((_, scope)) => (scope.allowed, scope.report),
            None => (self.default_policy.allowed, self.default_policy.report),
        };

        let status = if allowed.covers(requested) {
            FileAccessStatus::Allowed
        } else {
            FileAccessStatus::Denied
        };
        AccessCheckResult {
            status,
            // Denials are always policy-relevant.
            should_report: report || status == FileAccessStatus::Denied,
            requested_access: requested,
        }
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }
}

fn normalize_prefix(path: &str) -> String {
    let mut normalized = path.replace("//", "/").to_ascii_lowercase();
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    if !normalized.starts_with('/') {
        normalized.insert(0, '/');
    }
    normalized
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    // "/usr/lib" must not capture "/usr/libexec".
    path.len() == prefix.len() || prefix == "/" || path.as_bytes()[prefix.len()] == b'/'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_with(scopes: Vec<PolicyScope>) -> FileAccessManifest {
        FileAccessManifest::new(PipId(0xC0DE), 100, "/usr/bin/make", scopes, DefaultPolicy {
            allowed: RequestedAccess::ALL,
            report: true,
        })
        .unwrap()
    }

    #[test]
    fn test_zero_pip_id_rejected() {
        let err = FileAccessManifest::new(PipId(0), 1, "/bin/sh", vec![], DefaultPolicy::default());
        assert!(matches!(err, Err(ManifestError::MissingPipId)));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let manifest = manifest_with(vec![
            PolicyScope {
                prefix: "/out".into(),
                allowed: RequestedAccess::ALL,
                report: true,
            },
            PolicyScope {
                prefix: "/out/obj".into(),
                allowed: RequestedAccess::READ,
                report: false,
            },
        ]);

        let result = manifest.check("/out/obj/main.o", RequestedAccess::READ);
        assert_eq!(result.status, FileAccessStatus::Allowed);
        assert!(!result.should_report);

        let result = manifest.check("/out/bin/app", RequestedAccess::WRITE);
        assert_eq!(result.status, FileAccessStatus::Allowed);
        assert!(result.should_report);
    }

    #[test]
    fn test_denial_is_always_reported() {
        let manifest = manifest_with(vec![PolicyScope {
            prefix: "/etc".into(),
            allowed: RequestedAccess::NONE,
            report: false,
        }]);
        let result = manifest.check("/etc/passwd", RequestedAccess::READ);
        assert_eq!(result.status, FileAccessStatus::Denied);
        assert!(result.should_report);
    }

    #[test]
    fn test_prefix_does_not_match_sibling() {
        let manifest = manifest_with(vec![PolicyScope {
            prefix: "/usr/lib".into(),
            allowed: RequestedAccess::NONE,
            report: false,
        }]);
        let result = manifest.check("/usr/libexec/tool", RequestedAccess::READ);
        assert_eq!(result.status, FileAccessStatus::Allowed);
    }

    #[test]
    fn test_check_is_case_insensitive() {
        let manifest = manifest_with(vec![PolicyScope {
            prefix: "/Out/Obj".into(),
            allowed: RequestedAccess::READ,
            report: false,
        }]);
        let result = manifest.check("/OUT/obj/a.o", RequestedAccess::READ);
        assert_eq!(result.status, FileAccessStatus::Allowed);
        assert!(!result.should_report);
    }

    #[test]
    fn test_manifest_json_roundtrip() {
        let manifest = manifest_with(vec![PolicyScope {
            prefix: "/src".into(),
            allowed: RequestedAccess::READ,
            report: true,
        }]);
        let json = serde_json::to_string(&manifest).unwrap();
        let parsed: FileAccessManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.pip_id, manifest.pip_id);
        assert_eq!(parsed.scope_count(), 1);
        let result = parsed.check("/src/lib.rs", RequestedAccess::READ);
        assert_eq!(result.status, FileAccessStatus::Allowed);
    }
}
