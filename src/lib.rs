//! # tdb
//!
//! A source level debugger for x86-64 Linux programs built with DWARF debug information.
//!
//! The library is split along the work a debugger does:
//!
//! - [`dbginfo`] and [`dwarf_parse`] index compile units, functions and the line tables
//! - [`frame`] and [`cfa`] parse `.debug_frame` and compute canonical frame addresses
//! - [`breakpoint`] patches `int3`s into the debuggee and [`debugger`] steps around them
//! - [`disassemble`], [`stack`], [`source`] and [`variable`] show what the debuggee is doing
//!
//! The debuggee is reached through the [`tracee::Tracee`] trait, implemented with ptrace by
//! [`tracee::PtraceTracee`].

pub mod addr;
pub mod breakpoint;
pub mod cfa;
pub mod consts;
pub mod dbginfo;
pub mod debugger;
pub mod disassemble;
pub mod dwarf_parse;
pub mod errors;
pub mod expr;
pub mod feedback;
pub mod frame;
pub mod leb128;
pub mod prepare;
pub mod registers;
pub mod section;
pub mod source;
pub mod stack;
pub mod tracee;
pub mod ui;
pub mod variable;

#[cfg(test)]
pub(crate) mod testing;
