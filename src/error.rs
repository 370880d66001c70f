//! Error taxonomy (spec.md §7).
//!
//! Hand-rolled enum with manual `Display`, following the teacher's own
//! `PciError`/`NetError` style rather than pulling in `thiserror`.

use core::fmt;

/// An opaque cgroup-chosen error code, wrapping whatever numeric status
/// the charge hook returned. Mirrors `PciError(u32)`'s wrap-a-code idiom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CgroupErrCode(pub u32);

impl fmt::Display for CgroupErrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cgroup charge rejected (code {})", self.0)
    }
}

/// Which privileged instruction failed, and its numeric status, for the
/// warn-and-continue hardware-anomaly path (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwFailure {
    pub instr: &'static str,
    pub code: i32,
}

impl fmt::Display for HwFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed with status {}", self.instr, self.code)
    }
}

/// User-visible error surface. Allocators only ever return `NoMemory`,
/// `Busy`, `Restart`, or a cgroup-chosen error (spec.md §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpcError {
    /// No free page and nothing reclaimable anywhere relevant.
    NoMemory,
    /// Caller asked for a non-reclaiming allocation and none were free.
    Busy,
    /// A pending signal interrupted a synchronous reclaim loop.
    Restart,
    /// The cgroup charge hook rejected the allocation.
    CgroupChargeFail(CgroupErrCode),
}

impl fmt::Display for EpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EpcError::NoMemory => write!(f, "no EPC memory available"),
            EpcError::Busy => write!(f, "EPC allocation would require reclaim"),
            EpcError::Restart => write!(f, "interrupted by a pending signal"),
            EpcError::CgroupChargeFail(code) => write!(f, "{code}"),
        }
    }
}

impl std::error::Error for EpcError {}
