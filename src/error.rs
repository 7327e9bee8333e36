use core::fmt;

/// Represents all possible errors that can occur while building or driving
/// the kernel primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum R0akError {
    /// The command line did not have exactly one command and two operands.
    InvalidArgumentCount,

    /// A requested allocation size or value exceeds the supported range.
    OutOfRange,

    /// A local (user-mode) reservation failed.
    OutOfMemory,

    /// A symbolic target was not `module!symbol` shaped.
    MalformedSymbol,

    /// No installed Windows SDK/WDK provides a usable `dbghelp.dll`.
    SdkNotFound,

    /// One of the required `Sym*` entry points is missing from `dbghelp.dll`.
    SymbolEngineIncomplete,

    /// The module could not be loaded locally for symbol resolution.
    ModuleNotFound,

    /// The running kernel does not have the requested module loaded.
    DriverNotFound,

    /// The symbol is absent from the module's debug information.
    SymbolNotFound,

    /// Impersonating a SYSTEM token failed.
    ElevationFailed,

    /// The cross-session globals section could not be opened or mapped.
    SectionMapFailed,

    /// Creating the pipe pair backing a kernel placement failed.
    PipeCreationFailed,

    /// Writing the placement buffer through the pipe failed.
    PipeWriteFailed,

    /// The big-pool allocation snapshot could not be taken.
    PoolSnapshotFailed,

    /// No big-pool entry matched the placement's tag and size.
    PoolNotFound,

    /// The real-time trace session could not be created or configured.
    TraceSessionFailed,

    /// A consumer handle to the trace session could not be opened.
    TraceConsumerFailed,

    /// A hijack is already armed; the previous flow has not run yet.
    HijackAlreadyArmed,

    /// `run` was called with no armed hijack target.
    HijackNotArmed,

    /// The benign cover operation failed before the corruption window opened.
    CoverOperationFailed,

    /// The redirected diagnostic query reported an error.
    QueryFailed,
}

impl fmt::Display for R0akError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for R0akError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_debug() {
        assert_eq!(R0akError::PoolNotFound.to_string(), "PoolNotFound");
        assert_eq!(R0akError::OutOfRange.to_string(), "OutOfRange");
    }
}
