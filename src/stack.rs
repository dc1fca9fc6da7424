//! # Stack Module
//!
//! Frame pointer based backtraces.
//!
//! Every frame that keeps a frame pointer stores the frame pointer of its caller at `[rbp]`
//! and the return address at `[rbp + 8]`. Following that chain from the current `rbp` gives
//! the call stack, until the frame pointer becomes zero or can not be read.

use std::fmt::Display;

use tracing::{debug, trace};

use crate::addr::Addr;
use crate::consts::WORD_BYTES;
use crate::dbginfo::{DebugInfoIndex, SourceLocation};
use crate::errors::Result;
use crate::tracee::Tracee;

const MAX_FRAMES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacktraceFrame {
    pub addr: Addr,
    pub function: Option<String>,
    pub location: Option<SourceLocation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backtrace {
    frames: Vec<BacktraceFrame>,
}

impl Backtrace {
    /// Walks the frame pointer chain of the stopped tracee
    ///
    /// The first frame is the current pc. Return addresses are attributed to the instruction
    /// before them, which is the call.
    ///
    /// # Errors
    ///
    /// Fails only if the registers can not be read, a failing read of the stack ends the walk.
    pub fn walk<T: Tracee>(tracee: &T, index: &DebugInfoIndex) -> Result<Self> {
        let regs = tracee.registers()?;
        let mut bt = Backtrace::default();
        bt.push(index, regs.pc(), regs.pc());

        let mut fp = regs.frame_pointer();
        while !fp.is_null() && bt.frames.len() < MAX_FRAMES {
            let mut raw = [0u8; 2 * WORD_BYTES];
            if let Err(e) = tracee.read_exact(fp, &mut raw) {
                debug!("stack walk ends at {fp}: {e}");
                break;
            }
            let mut word = [0u8; WORD_BYTES];
            word.copy_from_slice(&raw[..WORD_BYTES]);
            let saved_fp = Addr::from(u64::from_le_bytes(word));
            word.copy_from_slice(&raw[WORD_BYTES..]);
            let ret = Addr::from(u64::from_le_bytes(word));
            trace!("frame at {fp}: saved fp {saved_fp}, return to {ret}");

            if ret.is_null() {
                break;
            }
            bt.push(index, ret, ret.checked_sub(1).unwrap_or(ret));

            // the stack grows down, callers live above
            if !saved_fp.is_null() && saved_fp <= fp {
                debug!("frame pointer chain goes backwards at {fp}");
                break;
            }
            fp = saved_fp;
        }
        Ok(bt)
    }

    fn push(&mut self, index: &DebugInfoIndex, addr: Addr, lookup: Addr) {
        self.frames.push(BacktraceFrame {
            addr,
            function: index
                .function_containing(lookup)
                .ok()
                .map(|f| f.display_name()),
            location: index.resolve_address(lookup).ok(),
        });
    }

    #[must_use]
    pub fn frames(&self) -> &[BacktraceFrame] {
        &self.frames
    }
}

impl Display for Backtrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (n, frame) in self.frames.iter().enumerate() {
            write!(
                f,
                "#{n} {} in {}",
                frame.addr,
                frame.function.as_deref().unwrap_or("??")
            )?;
            match &frame.location {
                Some(loc) => writeln!(f, " at {}", loc)?,
                None => writeln!(f)?,
            }
        }
        Ok(())
    }
}
