//! # Feedback Module
//!
//! What the [`Debugger`](crate::debugger::Debugger) hands back to the
//! [`DebuggerUI`](crate::ui::DebuggerUI) after each command. The [`Display`] implementation is
//! the text the operator sees.

use std::fmt::Display;

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::addr::Addr;
use crate::breakpoint::{Breakpoint, BreakpointKind};
use crate::dbginfo::SourceLocation;
use crate::disassemble::Disassembly;
use crate::errors::DebuggerError;
use crate::registers::Registers;
use crate::source::Listing;
use crate::stack::Backtrace;
use crate::variable::VariableValue;

#[derive(Debug)]
pub enum Feedback {
    Ok,
    Text(String),
    Error(DebuggerError),
    /// The input was not a command
    Unsupported(String),
    BreakpointSet {
        number: usize,
        addr: Addr,
        file: String,
        line: u64,
    },
    /// The address a source line resolved to
    Found(Addr),
    /// Breakpoints with their operator numbers, internal ones have none
    Breakpoints(Vec<(Option<usize>, Breakpoint)>),
    BreakpointsCleared(Vec<Breakpoint>),
    /// The debuggee stopped, with the source around the stop if it is known
    Stopped {
        pc: Addr,
        location: Option<SourceLocation>,
        listing: Option<Listing>,
    },
    /// The debuggee stopped because of a signal, which will be delivered on the next resume
    Signalled { pc: Addr, signal: Signal },
    Exited { pid: Pid, code: i32 },
    Killed { pid: Pid, signal: Signal },
    Restarted { pid: Pid, breakpoints: usize },
    Listing(Listing),
    Backtrace(Backtrace),
    Disassembly { pc: Addr, disassembly: Disassembly },
    Variable(VariableValue),
    Registers(Registers),
}

impl Display for Feedback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Feedback::Ok => Ok(()),
            Feedback::Text(t) => writeln!(f, "{t}"),
            Feedback::Error(e) => match e {
                DebuggerError::DuplicateBreakpoint(_)
                | DebuggerError::NoSuchSourceLine(..)
                | DebuggerError::ProcessGone => writeln!(f, "{e}"),
                other => writeln!(f, "Error: {other}"),
            },
            Feedback::Unsupported(input) => writeln!(f, "unsupport cmd `{input}`"),
            Feedback::BreakpointSet { file, line, .. } => {
                writeln!(f, "tdb add {file}:{line} breakpoint successfully")
            }
            Feedback::Found(addr) => writeln!(f, "Find Result as Addr: {addr:#x}"),
            Feedback::Breakpoints(bps) => {
                if bps.is_empty() {
                    return writeln!(f, "No breakpoints");
                }
                for (number, bp) in bps {
                    match number {
                        Some(n) => write!(f, "{n:>3}. ")?,
                        None => write!(f, "  -. ")?,
                    }
                    writeln!(f, "{bp}")?;
                }
                Ok(())
            }
            Feedback::BreakpointsCleared(bps) => {
                for bp in bps {
                    writeln!(f, "Deleted breakpoint at {}:{}", bp.file, bp.line)?;
                }
                Ok(())
            }
            Feedback::Stopped {
                pc,
                location,
                listing,
            } => match (listing, location) {
                (Some(listing), _) => write!(f, "{listing}"),
                (None, Some(loc)) => writeln!(f, "stopped at {pc} {loc}"),
                (None, None) => writeln!(f, "stopped at {pc}"),
            },
            Feedback::Signalled { pc, signal } => {
                writeln!(f, "Program received signal {signal} at {pc}")
            }
            Feedback::Exited { pid, code } => {
                writeln!(f, "Process {pid} has exited with status {code}")
            }
            Feedback::Killed { pid, signal } => {
                writeln!(f, "Process {pid} was killed by {signal}")
            }
            Feedback::Restarted { pid, breakpoints } => {
                writeln!(
                    f,
                    "Restarted as process {pid}, {breakpoints} breakpoint(s) armed again"
                )
            }
            Feedback::Listing(listing) => write!(f, "{listing}"),
            Feedback::Backtrace(bt) => write!(f, "{bt}"),
            Feedback::Disassembly { pc, disassembly } => {
                writeln!(f, "current process pc = {pc}")?;
                write!(f, "{disassembly}")
            }
            Feedback::Variable(v) => writeln!(f, "{v}"),
            Feedback::Registers(regs) => write!(f, "{regs}"),
        }
    }
}

impl From<Result<Feedback, DebuggerError>> for Feedback {
    fn from(value: Result<Feedback, DebuggerError>) -> Self {
        match value {
            Ok(f) => f,
            Err(e) => Feedback::Error(e),
        }
    }
}

impl Feedback {
    /// Numbers operator breakpoints from 1 in the order they were set
    #[must_use]
    pub fn breakpoint_list<'a>(
        breakpoints: impl IntoIterator<Item = &'a Breakpoint>,
        include_internal: bool,
    ) -> Self {
        let mut number = 0;
        let mut listed = Vec::new();
        for bp in breakpoints {
            match bp.kind {
                BreakpointKind::User => {
                    number += 1;
                    listed.push((Some(number), bp.clone()));
                }
                BreakpointKind::Internal if include_internal => listed.push((None, bp.clone())),
                BreakpointKind::Internal => (),
            }
        }
        Feedback::Breakpoints(listed)
    }
}
