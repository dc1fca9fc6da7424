//! # Breakpoint Module
//!
//! Software breakpoints: the first byte of the instruction is replaced by `int3` and saved, so
//! it can be put back when the breakpoint is cleared or has to be stepped over.
//!
//! Breakpoints are either set by the operator ([`BreakpointKind::User`]) or placed by the step
//! engine for a moment ([`BreakpointKind::Internal`]). There is at most one breakpoint per
//! address.

use std::fmt::Display;

use tracing::{debug, trace};

use crate::addr::Addr;
use crate::consts::INT3_BYTE;
use crate::dbginfo::DebugInfoIndex;
use crate::errors::{DebuggerError, Result};
use crate::tracee::Tracee;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointKind {
    User,
    Internal,
}

/// An armed breakpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub addr: Addr,
    /// The byte the `int3` replaced
    pub original: u8,
    pub file: String,
    pub line: u64,
    pub kind: BreakpointKind,
}

impl Display for Breakpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}:{}", self.addr, self.file, self.line)?;
        if self.kind == BreakpointKind::Internal {
            write!(f, " (internal)")?;
        }
        Ok(())
    }
}

/// The table of armed breakpoints, in the order they were set
#[derive(Debug, Clone, Default)]
pub struct BreakpointManager {
    breakpoints: Vec<Breakpoint>,
}

impl BreakpointManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn all(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    pub fn user(&self) -> impl Iterator<Item = &Breakpoint> {
        self.breakpoints
            .iter()
            .filter(|b| b.kind == BreakpointKind::User)
    }

    #[must_use]
    pub fn at(&self, addr: Addr) -> Option<&Breakpoint> {
        self.breakpoints.iter().find(|b| b.addr == addr)
    }

    #[must_use]
    pub fn is_armed(&self, addr: Addr) -> bool {
        self.at(addr).is_some()
    }

    /// Saves the byte at `addr` and writes `int3` over it
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::DuplicateBreakpoint`] if a breakpoint is already armed at
    /// `addr`, or if the memory of the tracee can not be accessed.
    pub fn arm<T: Tracee>(
        &mut self,
        tracee: &mut T,
        addr: Addr,
        file: &str,
        line: u64,
        kind: BreakpointKind,
    ) -> Result<&Breakpoint> {
        if self.is_armed(addr) {
            return Err(DebuggerError::DuplicateBreakpoint(addr.to_string()));
        }
        let mut original = [0u8; 1];
        tracee.read_exact(addr, &mut original)?;
        tracee.write_memory(addr, &[INT3_BYTE])?;
        trace!("armed {addr}: saved {:#04x}", original[0]);

        self.breakpoints.push(Breakpoint {
            addr,
            original: original[0],
            file: file.to_string(),
            line,
            kind,
        });
        Ok(&self.breakpoints[self.breakpoints.len() - 1])
    }

    /// Sets an operator breakpoint on a source line
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::NoSuchSourceLine`] if the line has no code and with
    /// [`DebuggerError::DuplicateBreakpoint`] if its address already has a breakpoint.
    pub fn set_user<T: Tracee>(
        &mut self,
        tracee: &mut T,
        index: &DebugInfoIndex,
        file: &str,
        line: u64,
    ) -> Result<&Breakpoint> {
        let addr = index.lookup_breakpoint_address(file, line)?;
        let stored = index.resolve_file(file).unwrap_or(file).to_string();
        debug!("user breakpoint {stored}:{line} -> {addr}");
        self.arm(tracee, addr, &stored, line, BreakpointKind::User)
            .map_err(|e| match e {
                DebuggerError::DuplicateBreakpoint(_) => {
                    DebuggerError::DuplicateBreakpoint(format!("{file}:{line}"))
                }
                other => other,
            })
    }

    /// Sets a breakpoint for the step engine
    ///
    /// # Errors
    ///
    /// Fails if a breakpoint is already armed at `addr`, or the memory can not be accessed.
    pub fn set_internal<T: Tracee>(
        &mut self,
        tracee: &mut T,
        index: &DebugInfoIndex,
        addr: Addr,
    ) -> Result<()> {
        let (file, line) = match index.resolve_address(addr) {
            Ok(loc) => (loc.file, loc.line),
            Err(_) => (String::new(), 0),
        };
        self.arm(tracee, addr, &file, line, BreakpointKind::Internal)?;
        Ok(())
    }

    /// Restores the original byte at `addr` and forgets the breakpoint
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::BreakpointNotArmed`] if there is no breakpoint at `addr`.
    pub fn clear_at<T: Tracee>(&mut self, tracee: &mut T, addr: Addr) -> Result<Breakpoint> {
        let pos = self
            .breakpoints
            .iter()
            .position(|b| b.addr == addr)
            .ok_or(DebuggerError::BreakpointNotArmed(addr))?;
        tracee.write_memory(addr, &[self.breakpoints[pos].original])?;
        trace!("cleared {addr}");
        Ok(self.breakpoints.remove(pos))
    }

    /// Clears the operator breakpoint with the 1 based `number`, counting only operator
    /// breakpoints in the order they were set
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::NoSuchBreakpoint`] if there is no such breakpoint.
    pub fn clear_user<T: Tracee>(&mut self, tracee: &mut T, number: usize) -> Result<Breakpoint> {
        let addr = number
            .checked_sub(1)
            .and_then(|n| self.user().nth(n))
            .map(|b| b.addr)
            .ok_or(DebuggerError::NoSuchBreakpoint(number))?;
        self.clear_at(tracee, addr)
    }

    /// Clears every operator breakpoint, returning how many there were
    ///
    /// # Errors
    ///
    /// Fails if the memory of the tracee can not be written.
    pub fn clear_all_user<T: Tracee>(&mut self, tracee: &mut T) -> Result<usize> {
        self.clear_kind(tracee, BreakpointKind::User)
    }

    /// Clears the breakpoints the step engine left behind
    ///
    /// # Errors
    ///
    /// Fails if the memory of the tracee can not be written.
    pub fn clear_internal<T: Tracee>(&mut self, tracee: &mut T) -> Result<usize> {
        self.clear_kind(tracee, BreakpointKind::Internal)
    }

    fn clear_kind<T: Tracee>(&mut self, tracee: &mut T, kind: BreakpointKind) -> Result<usize> {
        let addrs: Vec<Addr> = self
            .breakpoints
            .iter()
            .filter(|b| b.kind == kind)
            .map(|b| b.addr)
            .collect();
        for addr in &addrs {
            self.clear_at(tracee, *addr)?;
        }
        Ok(addrs.len())
    }

    /// Drops every record without touching memory, for a tracee whose memory was replaced
    ///
    /// Returns the operator breakpoints that were set.
    pub fn forget(&mut self) -> Vec<Breakpoint> {
        std::mem::take(&mut self.breakpoints)
            .into_iter()
            .filter(|b| b.kind == BreakpointKind::User)
            .collect()
    }

    /// Drops the records of internal breakpoints without touching memory, for when the
    /// tracee is gone
    pub fn discard_internal(&mut self) {
        self.breakpoints.retain(|b| b.kind == BreakpointKind::User);
    }

    /// Runs `f` with the breakpoint at `addr` disarmed
    ///
    /// The `int3` is written back afterwards even if `f` fails, unless the tracee is gone by
    /// then.
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::BreakpointNotArmed`] if there is no breakpoint at `addr`,
    /// with the error of `f`, or if the breakpoint can not be armed again.
    pub fn with_disarmed<T, R, F>(&self, tracee: &mut T, addr: Addr, f: F) -> Result<R>
    where
        T: Tracee,
        F: FnOnce(&mut T) -> Result<R>,
    {
        let bp = self.at(addr).ok_or(DebuggerError::BreakpointNotArmed(addr))?;
        tracee.write_memory(addr, &[bp.original])?;
        trace!("disarmed {addr}");

        let result = f(tracee);

        if tracee.is_alive() {
            let rearmed = tracee.write_memory(addr, &[INT3_BYTE]);
            trace!("rearmed {addr}");
            if let Err(e) = rearmed {
                return result.and(Err(e));
            }
        }
        result
    }

    /// Replaces the `int3` bytes in `data`, which was read from `base`, with the original bytes
    pub fn unpatch(&self, base: Addr, data: &mut [u8]) {
        for bp in &self.breakpoints {
            if let Some(i) = bp.addr.distance_from(base) {
                if let Some(byte) = data.get_mut(i) {
                    *byte = bp.original;
                }
            }
        }
    }
}
