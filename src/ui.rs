//! # UI Module
//!
//! The boundary between the [`Debugger`](crate::debugger::Debugger) and whoever drives it.
//!
//! A [`DebuggerUI`] is handed the [`Feedback`] of the last command and answers with the next
//! [`Status`], the parsed command. The debugger never reads input or prints results itself.

use crate::errors::Result;
use crate::feedback::Feedback;

#[cfg(feature = "cli")]
pub mod cli;

/// Which breakpoints `bc` clears
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearTarget {
    /// The operator breakpoint with this 1 based number
    Index(usize),
    All,
}

/// A command for the debugger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    SetBreakpoint {
        file: String,
        line: u64,
    },
    SetFunctionBreakpoint(String),
    /// Resolve a source line to its first address
    Find {
        file: String,
        line: u64,
    },
    ClearBreakpoint(ClearTarget),
    ListBreakpoints {
        all: bool,
    },
    Backtrace,
    Continue,
    Step,
    Next,
    StepInstruction,
    /// List source around a location, around the current line if there is none
    List {
        location: Option<(String, u64)>,
        range: Option<u64>,
    },
    Restart,
    Disassemble,
    Print(String),
    DumpRegisters,
    Help,
    /// Input that is not a command, it is answered with [`Feedback::Unsupported`]
    Unsupported(String),
    DebuggerQuit,
}

pub trait DebuggerUI {
    fn process(&mut self, feedback: Feedback) -> Result<Status>;
}

/// What every command does, shown for `help`
pub const HELP: &str = "\
b, break <file:line>      set a breakpoint on a source line
b, break <function>       set a breakpoint on the first line of a function
f, find <file:line>       show the first address of a source line
bc, bclear <index|all>    clear the breakpoint with that index, or all of them
bl [all]                  list breakpoints, `all` includes the ones set by the stepper
bt                        show the call stack
c, continue               run until a breakpoint is hit or the process ends
s, step                   run to the next source line, entering calls
n, next                   run to the next source line, stepping over calls
si, stepi                 execute one machine instruction
l, list [file:line [n]]   show n lines of source around a line, or around the current one
r, restart                start the process again, keeping the breakpoints
disass                    disassemble the current function
p, print <var>            show the value of a variable
regs                      show the registers
q, quit                   leave the debugger
h, help                   show this text";
