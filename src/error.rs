//! PioError: unified error type for all public pario APIs.
//!
//! Every internal failure surfaces as an error value; the error policy on
//! the owning IO system (see [`crate::ErrorPolicy`]) decides whether a
//! failure is returned, broadcast to the peer tasks, or aborts the process
//! group. Each variant carries a stable numeric code in the reserved range
//! starting at -500; backend errors keep the code the backend reported.

use thiserror::Error;

use crate::types::PioType;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PioError>;

/// Unified error type for pario operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PioError {
    /// No IO system registered under this id.
    #[error("no IO system with id {0}")]
    BadIosysId(i32),
    /// No decomposition registered under this id.
    #[error("no decomposition with id {0}")]
    BadIoId(i32),
    /// No open file registered under this id.
    #[error("no open file with id {0}")]
    BadNcid(i32),
    /// The file has no variable with this id.
    #[error("no variable with id {0}")]
    BadVarId(i32),
    /// The file has no dimension with this id.
    #[error("no dimension with id {0}")]
    BadDimId(i32),
    /// A required argument was missing or out of range.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    /// Async mode only accepts the rearranger the IO side was configured
    /// with; a per-decomposition override must match it.
    #[error("rearranger does not match the IO system default")]
    BadRearranger,
    /// The requested backend kind is not available in this build.
    #[error("IO type not available: {0}")]
    BadIoType(&'static str),
    /// Define-mode operation attempted in data mode.
    #[error("operation requires define mode")]
    NotInDefineMode,
    /// Data-mode operation attempted in define mode.
    #[error("operation not allowed in define mode")]
    InDefineMode,
    /// The decomposition map contains duplicate offsets and can only be
    /// used for reading.
    #[error("decomposition is read-only (map contains duplicate offsets)")]
    ReadOnlyDecomp,
    /// Write attempted on a file opened without write access.
    #[error("file is not writable")]
    ReadOnlyFile,
    /// A variable's dimensionality does not match the decomposition.
    #[error("dimension count mismatch: expected {expected}, got {got}")]
    VarDimMismatch { expected: usize, got: usize },
    /// The local array length does not match the decomposition map length.
    #[error("array length mismatch: decomposition expects {expected}, got {got}")]
    ArrayLenMismatch { expected: usize, got: usize },
    /// Element type of the data does not match the variable.
    #[error("type mismatch: variable is {var:?}, data is {data:?}")]
    TypeMismatch { var: PioType, data: PioType },
    /// start+count exceeds a dimension bound.
    #[error("start+count exceeds dimension bound")]
    Edge,
    /// A point-to-point or collective exchange failed.
    #[error("communication error: {0}")]
    Comm(String),
    /// Malformed or unknown message on the async control channel.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Error reported by the file backend; the code is passed through.
    #[error("backend error {code}: {msg}")]
    Backend { code: i32, msg: String },
    /// Filesystem-level failure in the classic backend.
    #[error("file I/O error: {0}")]
    FileIo(String),
}

impl PioError {
    /// Stable numeric code. Library-origin errors occupy the reserved
    /// range starting at -500; backend errors keep their own code.
    pub fn code(&self) -> i32 {
        use PioError::*;
        match self {
            BadIoType(_) => -500,
            VarDimMismatch { .. } => -501,
            BadRearranger => -502,
            BadIosysId(_) | BadIoId(_) | BadNcid(_) | BadVarId(_) | BadDimId(_) => -503,
            InvalidArg(_) => -504,
            ReadOnlyDecomp => -505,
            ReadOnlyFile => -506,
            NotInDefineMode => -507,
            InDefineMode => -508,
            Edge => -509,
            ArrayLenMismatch { .. } => -510,
            TypeMismatch { .. } => -511,
            Comm(_) => -512,
            Protocol(_) => -513,
            FileIo(_) => -514,
            Backend { code, .. } => *code,
        }
    }

    pub(crate) fn from_io(e: std::io::Error) -> Self {
        PioError::FileIo(e.to_string())
    }
}

/// How errors raised inside collective operations are handled.
///
/// Selectable per IO system and overridable per file; the process-wide
/// default applies to IO systems that never set one.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorPolicy {
    /// Print the error and abort the process group.
    InternalAbort,
    /// The root task broadcasts the error code; every task returns it.
    Broadcast,
    /// The failing task returns the error; peers return success.
    Return,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_in_reserved_range() {
        let errs = [
            PioError::BadIosysId(3),
            PioError::InvalidArg("x"),
            PioError::ReadOnlyDecomp,
            PioError::Protocol("bad".into()),
        ];
        for e in errs {
            assert!(e.code() <= -500, "{e:?} has code {}", e.code());
        }
    }

    #[test]
    fn backend_code_passes_through() {
        let e = PioError::Backend { code: -33, msg: "bad id".into() };
        assert_eq!(e.code(), -33);
    }
}
