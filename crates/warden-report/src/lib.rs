//! # warden-report
//!
//! Outbound delivery of access reports: the fixed-layout [`AccessReport`]
//! record, bounded lock-free [`queue::ReportQueue`]s, and the
//! [`mux::ReportMultiplexer`] that fans reports from many tracked processes
//! into the owning client's queues.

pub mod mux;
pub mod queue;

pub use mux::{MuxError, QueueHandle, ReportMultiplexer};
pub use queue::{NotificationPort, QueueSignal, ReportQueue};

use warden_manifest::{FileAccessStatus, PipId, RequestedAccess};

/// Maximum path length carried in a report record.
pub const REPORT_PATH_MAX: usize = 1024;

/// Operation tags carried in [`AccessReport::operation`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOperation {
    FileLookup = 1,
    FileProbe = 2,
    FileRead = 3,
    FileWrite = 4,
    FileEnumerate = 5,
    FileCreateDirectory = 6,
    ProcessCreated = 16,
    ProcessExec = 17,
    ProcessExit = 18,
    ProcessTreeCompleted = 19,
}

impl ReportOperation {
    pub fn from_u32(tag: u32) -> Option<ReportOperation> {
        Some(match tag {
            1 => Self::FileLookup,
            2 => Self::FileProbe,
            3 => Self::FileRead,
            4 => Self::FileWrite,
            5 => Self::FileEnumerate,
            6 => Self::FileCreateDirectory,
            16 => Self::ProcessCreated,
            17 => Self::ProcessExec,
            18 => Self::ProcessExit,
            19 => Self::ProcessTreeCompleted,
            _ => return None,
        })
    }

    /// The access kind a file operation requests; process-lifetime
    /// operations request none.
    pub fn requested_access(self) -> RequestedAccess {
        match self {
            Self::FileLookup => RequestedAccess::LOOKUP,
            Self::FileProbe => RequestedAccess::PROBE,
            Self::FileRead => RequestedAccess::READ,
            Self::FileWrite => RequestedAccess::WRITE,
            Self::FileEnumerate => RequestedAccess::ENUMERATE,
            Self::FileCreateDirectory => RequestedAccess::CREATE_DIRECTORY,
            _ => RequestedAccess::NONE,
        }
    }

    pub fn is_process_lifetime(self) -> bool {
        (self as u32) >= Self::ProcessCreated as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::FileLookup => "Lookup",
            Self::FileProbe => "Probe",
            Self::FileRead => "Read",
            Self::FileWrite => "Write",
            Self::FileEnumerate => "Enumerate",
            Self::FileCreateDirectory => "CreateDirectory",
            Self::ProcessCreated => "ProcessCreated",
            Self::ProcessExec => "ProcessExec",
            Self::ProcessExit => "ProcessExit",
            Self::ProcessTreeCompleted => "ProcessTreeCompleted",
        }
    }
}

/// Status tags carried in [`AccessReport::status`].
pub const STATUS_ALLOWED: u32 = 1;
pub const STATUS_DENIED: u32 = 2;

/// One observed, policy-relevant file or process event, destined for the
/// owning client.
///
/// The layout is ABI: the record is written verbatim into queue memory and
/// parsed by the client with fixed offsets. Field order and sizes must not
/// change once agreed upon.
///
/// ```text
/// offset  field             size
/// ------  ---------------   ----
///  0      operation          4
///  4      status             4
///  8      client_pid         4
/// 12      pid                4
/// 16      root_pid           4
/// 20      requested_access   4
/// 24      error              4
/// 28      path_len           4
/// 32      pip_id             8
/// 40      path            1024
/// ```
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AccessReport {
    pub operation: u32,
    pub status: u32,
    pub client_pid: u32,
    pub pid: u32,
    pub root_pid: u32,
    pub requested_access: u32,
    pub error: i32,
    pub path_len: u32,
    pub pip_id: u64,
    pub path: [u8; REPORT_PATH_MAX],
}

// The record is written into shared queue memory byte for byte.
const _: () = assert!(std::mem::size_of::<AccessReport>() == 1064);
const _: () = assert!(std::mem::align_of::<AccessReport>() == 8);

impl AccessReport {
    pub const SIZE: usize = std::mem::size_of::<AccessReport>();

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        operation: ReportOperation,
        status: FileAccessStatus,
        client_pid: u32,
        pid: u32,
        root_pid: u32,
        requested_access: RequestedAccess,
        pip_id: PipId,
        path: &str,
    ) -> Self {
        let mut report = AccessReport {
            operation: operation as u32,
            status: match status {
                FileAccessStatus::Allowed => STATUS_ALLOWED,
                FileAccessStatus::Denied => STATUS_DENIED,
            },
            client_pid,
            pid,
            root_pid,
            requested_access: requested_access.0,
            error: 0,
            path_len: 0,
            pip_id: pip_id.0,
            path: [0u8; REPORT_PATH_MAX],
        };
        report.set_path(path);
        report
    }

    /// Stores `path` bytes, truncating to [`REPORT_PATH_MAX`].
    pub fn set_path(&mut self, path: &str) {
        let bytes = path.as_bytes();
        let len = bytes.len().min(REPORT_PATH_MAX);
        self.path[..len].copy_from_slice(&bytes[..len]);
        self.path[len..].fill(0);
        self.path_len = len as u32;
    }

    pub fn path_str(&self) -> &str {
        let len = (self.path_len as usize).min(REPORT_PATH_MAX);
        std::str::from_utf8(&self.path[..len]).unwrap_or("")
    }

    pub fn operation(&self) -> Option<ReportOperation> {
        ReportOperation::from_u32(self.operation)
    }

    /// The record viewed as raw queue-memory bytes.
    ///
    /// Sound because the layout has no padding: every byte of the struct is
    /// initialized.
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self as *const AccessReport as *const u8, Self::SIZE) }
    }

    /// Reads a record back from queue-memory bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<AccessReport> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const AccessReport) })
    }
}

impl std::fmt::Debug for AccessReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessReport")
            .field("operation", &self.operation().map(|op| op.name()))
            .field("status", &self.status)
            .field("client_pid", &self.client_pid)
            .field("pid", &self.pid)
            .field("root_pid", &self.root_pid)
            .field("pip_id", &format_args!("{:#x}", self.pip_id))
            .field("path", &self.path_str())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AccessReport {
        AccessReport::new(
            ReportOperation::FileRead,
            FileAccessStatus::Allowed,
            100,
            101,
            100,
            RequestedAccess::READ,
            PipId(0xBEEF),
            "/src/lib.rs",
        )
    }

    #[test]
    fn test_record_size_is_fixed() {
        assert_eq!(AccessReport::SIZE, 1064);
    }

    #[test]
    fn test_byte_roundtrip_is_bit_exact() {
        let report = sample();
        let bytes = report.as_bytes();
        assert_eq!(bytes.len(), AccessReport::SIZE);
        let parsed = AccessReport::from_bytes(bytes).unwrap();
        assert_eq!(parsed.operation, report.operation);
        assert_eq!(parsed.pip_id, report.pip_id);
        assert_eq!(parsed.path_str(), "/src/lib.rs");
        assert_eq!(parsed.as_bytes(), bytes);
    }

    #[test]
    fn test_from_bytes_rejects_short_input() {
        assert!(AccessReport::from_bytes(&[0u8; 16]).is_none());
    }

    #[test]
    fn test_path_truncated_to_max() {
        let long = "x".repeat(REPORT_PATH_MAX + 100);
        let mut report = sample();
        report.set_path(&long);
        assert_eq!(report.path_len as usize, REPORT_PATH_MAX);
        assert_eq!(report.path_str().len(), REPORT_PATH_MAX);
    }

    #[test]
    fn test_operation_tag_roundtrip() {
        for op in [
            ReportOperation::FileLookup,
            ReportOperation::FileWrite,
            ReportOperation::ProcessCreated,
            ReportOperation::ProcessTreeCompleted,
        ] {
            assert_eq!(ReportOperation::from_u32(op as u32), Some(op));
        }
        assert_eq!(ReportOperation::from_u32(0), None);
        assert_eq!(ReportOperation::from_u32(99), None);
    }

    #[test]
    fn test_process_lifetime_classification() {
        assert!(!ReportOperation::FileRead.is_process_lifetime());
        assert!(ReportOperation::ProcessExit.is_process_lifetime());
    }
}
