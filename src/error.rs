use std::path::PathBuf;

use crate::dumper::TraceOp;

/// Everything that can abort a core dump run.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Process {0} not found")]
    ProcessNotFound(i32),

    #[error("Process {0} not found")]
    NamedProcessNotFound(String),

    /// Reading a procfs record failed.
    #[error("Failed to read {path}: {source}")]
    ProcRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt smaps at line {line}: {reason}")]
    Smaps { line: usize, reason: String },

    #[error("Bad stat field {field}: {token:?}")]
    StatField { field: &'static str, token: String },

    /// A ptrace request issued on the trace worker failed.
    #[error("{op} failed for thread {tid}: {source}")]
    Trace {
        op: TraceOp,
        tid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("Trace worker is gone")]
    TracerGone,

    /// The memory handle delivered fewer bytes than a LOAD segment declares.
    #[error("Segment at {vaddr:#x} ended after {written} of {expected} bytes")]
    ShortSegment {
        vaddr: u64,
        written: u64,
        expected: u64,
    },

    /// `e_phnum` is 16 bits wide and 0xffff is reserved for PN_XNUM.
    #[error("Core image needs {0} program headers, at most 65534 fit")]
    TooManySegments(usize),

    #[error("No NSpid entry for process {0}")]
    NamespacePid(i32),

    #[error("Failed to enter {ns} namespace of process {pid}: {source}")]
    Namespace {
        ns: &'static str,
        pid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// Attaches the procfs path to an I/O failure.
pub(crate) trait ProcContext<T> {
    fn proc_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> ProcContext<T> for std::io::Result<T> {
    fn proc_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| CoreError::ProcRead {
            path: path.into(),
            source,
        })
    }
}
