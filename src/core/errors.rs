/*!
 * Trace Errors
 * Error taxonomy for the tracking and leak-checking subsystem
 */

use thiserror::Error;

/// Trace operation result
pub type TraceResult<T> = Result<T, TraceError>;

/// Errors surfaced by the tracing subsystem
///
/// Only degraded-capability conditions travel as `Err`: expected misses
/// are `Option::None` at the call site, and internal consistency
/// violations go through [`fatal`] because continuing would risk a
/// silently wrong leak report.
#[derive(Error, Debug, Clone)]
pub enum TraceError {
    #[error("memory map unreadable: {0}")]
    MemoryMapUnreadable(String),

    #[error("thread enumeration failed: {0}")]
    ThreadEnumeration(String),

    #[error("symbolizer unavailable: {0}")]
    SymbolizerUnavailable(String),

    #[error("symbolizer protocol error: wrote {written} addresses, read {read} symbols")]
    SymbolizerProtocol { written: usize, read: usize },

    #[error("check already in progress")]
    CheckInProgress,

    #[error("a whole-program checker already exists for this process")]
    WholeProgramCheckerExists,

    #[error("checker in state {state} cannot {operation}")]
    InvalidCheckState {
        state: &'static str,
        operation: &'static str,
    },
}

/// Abort the process over an internal consistency violation
///
/// Corrupted block headers, double frees, overlapping regions and the
/// like mean the tracking data can no longer be trusted; a wrong leak
/// report is worse than a crash.
#[cold]
pub fn fatal(component: &str, detail: std::fmt::Arguments<'_>) -> ! {
    // Write straight to stderr as well: the abort may fire before any
    // logger is installed, or inside an allocation hook where the
    // logging framework itself cannot run.
    eprintln!("heaptrace fatal [{component}]: {detail}");
    log::error!("fatal consistency violation [{component}]: {detail}");
    std::process::abort();
}

/// Fatal consistency-violation diagnostic
#[macro_export]
macro_rules! fatal {
    ($component:expr, $($arg:tt)*) => {
        $crate::core::errors::fatal($component, std::format_args!($($arg)*))
    };
}
