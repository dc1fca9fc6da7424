//! # Errors Module
//!
//! Defines the [`DebuggerError`] type that every fallible operation of the debugger returns.
//!
//! The variants follow how far an error reaches:
//!
//! - index build failures ([`DebuggerError::MissingSection`], [`DebuggerError::DwarfParse`])
//!   abort the whole run at startup
//! - lookup misses, breakpoint conflicts and unwind failures are reported to the operator and
//!   the session goes on
//! - [`DebuggerError::ProcessGone`] ends the tracee session until a restart

use thiserror::Error;

use crate::addr::Addr;

/// Shorthand for results of debugger operations
pub type Result<T> = std::result::Result<T, DebuggerError>;

#[derive(Error, Debug)]
pub enum DebuggerError {
    #[error("Os error: {0}")]
    Os(nix::Error),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not parse the executable: {0}")]
    Object(#[from] object::read::Error),
    #[error("Error while reading DWARF: {0}")]
    Gimli(#[from] gimli::Error),
    #[error("Could not convert to CString: {0}")]
    CStringConv(#[from] std::ffi::NulError),

    #[error("Executable does not exist: {0}")]
    ExecutableDoesNotExist(String),
    #[error("Executable is not a file: {0}")]
    ExecutableIsNotAFile(String),
    #[error("Could not build the target: {0}")]
    Build(String),

    #[error("Can't find {0} or its compressed form")]
    MissingSection(String),
    #[error("Malformed debug information: {0}")]
    DwarfParse(String),

    #[error("No function contains the address {0}")]
    NoSuchFunction(Addr),
    #[error("No function is called {0}")]
    UnknownFunction(String),
    #[error("can't find this source line {0}:{1}")]
    NoSuchSourceLine(String, u64),
    #[error("No line information for the address {0}")]
    NoLineInfo(Addr),
    #[error("existed breakpoint {0}")]
    DuplicateBreakpoint(String),
    #[error("No breakpoint with the index {0}")]
    NoSuchBreakpoint(usize),
    #[error("No breakpoint is armed at {0}")]
    BreakpointNotArmed(Addr),

    #[error("No frame description entry covers {0}")]
    NoCoveringFrame(Addr),
    #[error("More than one frame description entry covers {0}")]
    AmbiguousFrame(Addr),
    #[error("Can't resolve the frame: {0}")]
    UnresolvableFrame(String),
    #[error("Unsupported call frame instruction {0:#04x}")]
    UnsupportedOpcode(u8),
    #[error("Unexpected end of data while decoding {0}")]
    UnexpectedEof(&'static str),
    #[error("LEB128 value does not fit into 64 bits")]
    Leb128Overflow,

    #[error("Unsupported location expression opcode {0:#04x}")]
    UnsupportedLocation(u8),
    #[error("No variable named {0} is visible here")]
    UnknownVariable(String),
    #[error("{0} has no single location here")]
    NoLocation(String),

    #[error("Could not decode the instruction at {0}")]
    Decode(Addr),

    #[error("there is no process running")]
    ProcessGone,
    #[error("The tracee was launched from another thread")]
    WrongTracerThread,
    #[error("The tracee stopped unexpectedly: {0}")]
    UnexpectedStop(String),
}

impl DebuggerError {
    /// Whether the tracee session cannot go on after this error
    #[must_use]
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(self, Self::ProcessGone)
    }
}

impl From<nix::Error> for DebuggerError {
    fn from(value: nix::Error) -> Self {
        match value {
            nix::Error::ESRCH => Self::ProcessGone,
            other => Self::Os(other),
        }
    }
}
