//! # Debugger Module
//!
//! The debugging session: one [`Tracee`], the indexes built from its executable, the
//! breakpoint table and the step engine on top of them.
//!
//! Every command goes through [`Debugger::handle`]. [`Debugger::run_debugger`] drives a
//! [`DebuggerUI`] with it until the operator quits. Per command errors are turned into
//! [`Feedback::Error`] and the session goes on.
//!
//! When the tracee stops on one of our `int3`s, the pc is rewound onto the breakpoint address
//! right away. Every later resume or step checks for an armed breakpoint at the pc and executes
//! the real instruction with the breakpoint disarmed first.

use nix::sys::signal::Signal;
use tracing::{debug, error, info, trace, warn};

use crate::addr::Addr;
use crate::breakpoint::BreakpointManager;
use crate::dbginfo::{DebugInfoIndex, SourceLocation};
use crate::disassemble::{Disassembly, InstructionInfo, MAX_INSTRUCTION_LEN};
use crate::errors::{DebuggerError, Result};
use crate::feedback::Feedback;
use crate::frame::FrameIndex;
use crate::source::{Listing, DEFAULT_LIST_RANGE};
use crate::stack::Backtrace;
use crate::tracee::{Stop, Tracee, TrapKind};
use crate::ui::{ClearTarget, DebuggerUI, Status, HELP};
use crate::variable::read_variable;

pub struct Debugger<T: Tracee> {
    tracee: T,
    index: DebugInfoIndex,
    frames: Option<FrameIndex>,
    breakpoints: BreakpointManager,
    /// Signal that stopped the debuggee, delivered on the next resume
    pending_signal: Option<Signal>,
    bias: Addr,
    list_range: u64,
}

impl<T: Tracee> Debugger<T> {
    /// Starts a session for a tracee that is stopped before its first instruction
    ///
    /// `frames` may be missing if the executable has no `.debug_frame`, only `print` needs it.
    /// `bias` is the load bias the indexes were built with.
    pub fn build(tracee: T, index: DebugInfoIndex, frames: Option<FrameIndex>, bias: Addr) -> Self {
        Debugger {
            tracee,
            index,
            frames,
            breakpoints: BreakpointManager::new(),
            pending_signal: None,
            bias,
            list_range: DEFAULT_LIST_RANGE,
        }
    }

    /// Sets how many lines `list` shows around a line when no range is given
    #[must_use]
    pub fn with_list_range(mut self, range: u64) -> Self {
        self.list_range = range;
        self
    }

    #[must_use]
    pub fn tracee(&self) -> &T {
        &self.tracee
    }

    #[must_use]
    pub fn index(&self) -> &DebugInfoIndex {
        &self.index
    }

    #[must_use]
    pub fn breakpoints(&self) -> &BreakpointManager {
        &self.breakpoints
    }

    /// Runs commands from `ui` until it asks to quit, then kills the debuggee
    ///
    /// # Errors
    ///
    /// Fails only if the UI fails, errors of commands are handed to the UI as feedback.
    pub fn run_debugger<UI: DebuggerUI>(&mut self, ui: &mut UI) -> Result<()> {
        let mut feedback: Feedback = Feedback::Ok;
        loop {
            let status = match ui.process(feedback) {
                Err(e) => {
                    error!("{e}");
                    return Err(e);
                }
                Ok(Status::DebuggerQuit) => break,
                Ok(s) => s,
            };
            let result = self.handle(status);
            if let Err(e) = &result {
                if e.is_fatal_for_session() {
                    info!("the debuggee is gone until the next restart");
                }
            }
            feedback = result.into();
        }

        self.cleanup()
    }

    /// Executes one command
    ///
    /// # Errors
    ///
    /// Returns the error of the command. [`Status::DebuggerQuit`] is not a command here and
    /// is answered with [`Feedback::Ok`].
    pub fn handle(&mut self, status: Status) -> Result<Feedback> {
        debug!("command: {status:?}");
        match status {
            Status::SetBreakpoint { file, line } => self.set_breakpoint(&file, line),
            Status::SetFunctionBreakpoint(name) => self.set_function_breakpoint(&name),
            Status::Find { file, line } => {
                Ok(Feedback::Found(self.index.lookup_line_address(&file, line)?))
            }
            Status::ClearBreakpoint(target) => self.clear_breakpoint(target),
            Status::ListBreakpoints { all } => Ok(Feedback::breakpoint_list(
                self.breakpoints.all(),
                all,
            )),
            Status::Backtrace => self.backtrace(),
            Status::Continue => self.continue_execution(),
            Status::Step => self.step_line(),
            Status::Next => self.next_line(),
            Status::StepInstruction => self.step_instruction(),
            Status::List { location, range } => self.list(location, range),
            Status::Restart => self.restart(),
            Status::Disassemble => self.disassemble(),
            Status::Print(name) => self.print(&name),
            Status::DumpRegisters => Ok(Feedback::Registers(self.tracee.registers()?)),
            Status::Help => Ok(Feedback::Text(HELP.to_string())),
            Status::Unsupported(input) => Ok(Feedback::Unsupported(input)),
            Status::DebuggerQuit => Ok(Feedback::Ok),
        }
    }

    /// Kills the debuggee if it is still there
    ///
    /// # Errors
    ///
    /// Fails if the debuggee can not be killed.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.tracee.is_alive() {
            info!("killing debuggee {}", self.tracee.pid());
            self.tracee.kill()?;
        }
        Ok(())
    }

    pub fn set_breakpoint(&mut self, file: &str, line: u64) -> Result<Feedback> {
        let bp = self
            .breakpoints
            .set_user(&mut self.tracee, &self.index, file, line)?;
        let (addr, file, line) = (bp.addr, bp.file.clone(), bp.line);
        Ok(Feedback::BreakpointSet {
            number: self.breakpoints.user().count(),
            addr,
            file,
            line,
        })
    }

    /// Sets a breakpoint on the first line after the prologue of the function `name`
    pub fn set_function_breakpoint(&mut self, name: &str) -> Result<Feedback> {
        let function = *self
            .index
            .functions_named(name)
            .first()
            .ok_or_else(|| DebuggerError::UnknownFunction(name.to_string()))?;
        let SourceLocation { file, line } = self.index.function_entry(function)?;
        self.set_breakpoint(&file, line)
    }

    pub fn clear_breakpoint(&mut self, target: ClearTarget) -> Result<Feedback> {
        let cleared = match target {
            ClearTarget::Index(n) => vec![self.breakpoints.clear_user(&mut self.tracee, n)?],
            ClearTarget::All => {
                let user = self.breakpoints.user().cloned().collect();
                self.breakpoints.clear_all_user(&mut self.tracee)?;
                user
            }
        };
        Ok(Feedback::BreakpointsCleared(cleared))
    }

    /// Runs until a breakpoint is hit, a signal arrives or the debuggee ends
    pub fn continue_execution(&mut self) -> Result<Feedback> {
        self.ensure_alive()?;
        self.breakpoints.clear_internal(&mut self.tracee)?;

        let pc = self.tracee.pc()?;
        if self.breakpoints.is_armed(pc) {
            let stop = self.step_over_breakpoint(pc)?;
            if stop != Stop::Trap(TrapKind::SingleStep) {
                return self.stopped(stop);
            }
        }
        let stop = self.tracee.resume(self.pending_signal.take())?;
        self.stopped(stop)
    }

    /// Executes exactly one machine instruction
    pub fn step_instruction(&mut self) -> Result<Feedback> {
        self.ensure_alive()?;
        self.breakpoints.clear_internal(&mut self.tracee)?;
        let stop = self.step_once()?;
        self.stopped(stop)
    }

    /// Steps until the source line changes, entering called functions that have line info
    ///
    /// A call into code without line info is run until it returns.
    pub fn step_line(&mut self) -> Result<Feedback> {
        self.ensure_alive()?;
        self.breakpoints.clear_internal(&mut self.tracee)?;
        let start_pc = self.tracee.pc()?;
        let start = self.index.resolve_address(start_pc)?;

        loop {
            let regs = self.tracee.registers()?;
            let info = self.instruction_at(regs.pc())?;
            let stop = self.step_once()?;
            if stop != Stop::Trap(TrapKind::SingleStep) {
                return self.stopped(stop);
            }

            let pc = self.tracee.pc()?;
            match self.index.resolve_address(pc) {
                Ok(loc) if loc != start => return Ok(self.stop_feedback(pc)),
                Ok(_) => (),
                Err(_) if info.is_call => {
                    let ret = regs.pc() + info.len;
                    debug!("stepped into {pc} without line info, running to {ret}");
                    if let Some(feedback) = self.run_to_return(ret, regs.stack_pointer())? {
                        return Ok(feedback);
                    }
                    let pc = self.tracee.pc()?;
                    if self.index.resolve_address(pc).is_ok_and(|loc| loc != start) {
                        return Ok(self.stop_feedback(pc));
                    }
                }
                Err(_) => return Ok(self.stop_feedback(pc)),
            }
        }
    }

    /// Steps until the source line changes, running called functions to their return
    ///
    /// Stops early at an operator breakpoint, also inside a called function.
    pub fn next_line(&mut self) -> Result<Feedback> {
        self.ensure_alive()?;
        self.breakpoints.clear_internal(&mut self.tracee)?;
        let start_pc = self.tracee.pc()?;
        let start = self.index.resolve_address(start_pc)?;

        loop {
            let regs = self.tracee.registers()?;
            let info = self.instruction_at(regs.pc())?;
            let stop = self.step_once()?;
            if stop != Stop::Trap(TrapKind::SingleStep) {
                return self.stopped(stop);
            }

            let ret = regs.pc() + info.len;
            if info.is_call && self.tracee.pc()? != ret {
                if let Some(feedback) = self.run_to_return(ret, regs.stack_pointer())? {
                    return Ok(feedback);
                }
            }

            let pc = self.tracee.pc()?;
            if self.breakpoints.user().any(|b| b.addr == pc) {
                return Ok(self.stop_feedback(pc));
            }
            match self.index.resolve_address(pc) {
                Ok(loc) if loc == start => (),
                _ => return Ok(self.stop_feedback(pc)),
            }
        }
    }

    /// Launches the debuggee again and sets the operator breakpoints in the new process
    ///
    /// Breakpoints whose line can not be resolved any more are dropped with a warning.
    pub fn restart(&mut self) -> Result<Feedback> {
        self.tracee.restart()?;
        self.pending_signal = None;
        let previous = self.breakpoints.forget();

        let mut armed = 0;
        for bp in previous {
            match self
                .breakpoints
                .set_user(&mut self.tracee, &self.index, &bp.file, bp.line)
            {
                Ok(_) => armed += 1,
                Err(e) => warn!("could not set the breakpoint at {}:{} again: {e}", bp.file, bp.line),
            }
        }
        info!("restarted as {} with {armed} breakpoints", self.tracee.pid());
        Ok(Feedback::Restarted {
            pid: self.tracee.pid(),
            breakpoints: armed,
        })
    }

    pub fn backtrace(&self) -> Result<Feedback> {
        Ok(Feedback::Backtrace(Backtrace::walk(&self.tracee, &self.index)?))
    }

    /// Disassembles the function containing the pc
    pub fn disassemble(&self) -> Result<Feedback> {
        let pc = self.tracee.pc()?;
        let function = self.index.function_containing(pc)?;
        let len = function
            .high_pc
            .distance_from(function.low_pc)
            .unwrap_or_default();

        let mut data = vec![0u8; len];
        self.tracee.read_exact(function.low_pc, &mut data)?;
        self.breakpoints.unpatch(function.low_pc, &mut data);
        let bp_addrs: Vec<Addr> = self.breakpoints.all().iter().map(|b| b.addr).collect();

        let mut disassembly = Disassembly::disassemble(&data, function.low_pc, &bp_addrs)?;
        disassembly.annotate(&self.index);
        disassembly.mark_current(pc);
        Ok(Feedback::Disassembly { pc, disassembly })
    }

    /// Lists the source around `location`, or around the current line
    pub fn list(&self, location: Option<(String, u64)>, range: Option<u64>) -> Result<Feedback> {
        let range = range.unwrap_or(self.list_range);
        let (file, line) = match location {
            Some((file, line)) => {
                let file = self.index.resolve_file(&file).unwrap_or(file.as_str()).to_string();
                (file, line)
            }
            None => {
                let loc = self.index.resolve_address(self.tracee.pc()?)?;
                (loc.file, loc.line)
            }
        };
        Ok(Feedback::Listing(Listing::read(file, line, range)?))
    }

    pub fn print(&self, name: &str) -> Result<Feedback> {
        let value = read_variable(
            &self.tracee,
            &self.index,
            self.frames.as_ref(),
            self.bias,
            name,
        )?;
        Ok(Feedback::Variable(value))
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.tracee.is_alive() {
            Ok(())
        } else {
            Err(DebuggerError::ProcessGone)
        }
    }

    /// Decodes the instruction at `pc` as the program has it, without our `int3`s
    fn instruction_at(&self, pc: Addr) -> Result<InstructionInfo> {
        let mut data = [0u8; MAX_INSTRUCTION_LEN];
        let len = self.tracee.read_memory(pc, &mut data)?;
        self.breakpoints.unpatch(pc, &mut data[..len]);
        InstructionInfo::decode(&data[..len], pc)
    }

    /// Single steps the real instruction under the breakpoint at `pc`
    fn step_over_breakpoint(&mut self, pc: Addr) -> Result<Stop> {
        trace!("stepping over the breakpoint at {pc}");
        self.breakpoints
            .with_disarmed(&mut self.tracee, pc, |t| t.single_step())
    }

    fn step_once(&mut self) -> Result<Stop> {
        let pc = self.tracee.pc()?;
        if self.breakpoints.is_armed(pc) {
            self.step_over_breakpoint(pc)
        } else {
            self.tracee.single_step()
        }
    }

    /// Runs the called function until it returns to `ret`
    ///
    /// `caller_sp` is the stack pointer before the call, a trap at `ret` with a lower stack
    /// pointer comes from a deeper recursion and is stepped over. Returns `None` once the
    /// debuggee is back at `ret`, or the feedback for anything else that stopped it.
    fn run_to_return(&mut self, ret: Addr, caller_sp: Addr) -> Result<Option<Feedback>> {
        let own = !self.breakpoints.is_armed(ret);
        if own {
            self.breakpoints
                .set_internal(&mut self.tracee, &self.index, ret)?;
        }

        let outcome = loop {
            let stop = self.tracee.resume(self.pending_signal.take())?;
            if stop != Stop::Trap(TrapKind::Breakpoint) {
                break Some(stop);
            }
            let pc = self.rewind_after_trap()?;
            if pc != ret {
                break Some(stop);
            }
            if self.tracee.registers()?.stack_pointer() >= caller_sp {
                break None;
            }
            trace!("recursive return to {ret}, going on");
            let stop = self.step_over_breakpoint(ret)?;
            if stop != Stop::Trap(TrapKind::SingleStep) {
                break Some(stop);
            }
        };

        if own {
            if self.tracee.is_alive() {
                self.breakpoints.clear_internal(&mut self.tracee)?;
            } else {
                self.breakpoints.discard_internal();
            }
        }
        match outcome {
            None => Ok(None),
            Some(Stop::Trap(TrapKind::Breakpoint)) => {
                Ok(Some(self.stop_feedback(self.tracee.pc()?)))
            }
            Some(stop) => self.stopped(stop).map(Some),
        }
    }

    /// Moves the pc back onto the breakpoint the debuggee just trapped on
    fn rewind_after_trap(&mut self) -> Result<Addr> {
        let pc = self.tracee.pc()?;
        match pc.checked_sub(1) {
            Some(at) if self.breakpoints.is_armed(at) => {
                self.tracee.set_pc(at)?;
                trace!("hit breakpoint at {at}");
                Ok(at)
            }
            _ => {
                warn!("trap at {pc} without a breakpoint of ours");
                Ok(pc)
            }
        }
    }

    /// Turns a stop of the debuggee into feedback
    fn stopped(&mut self, stop: Stop) -> Result<Feedback> {
        debug!("debuggee stopped: {stop:?}");
        match stop {
            Stop::Trap(TrapKind::Breakpoint) => {
                let pc = self.rewind_after_trap()?;
                Ok(self.stop_feedback(pc))
            }
            Stop::Trap(_) => Ok(self.stop_feedback(self.tracee.pc()?)),
            Stop::Signal(signal) => {
                self.pending_signal = Some(signal);
                Ok(Feedback::Signalled {
                    pc: self.tracee.pc()?,
                    signal,
                })
            }
            Stop::Exited(code) => {
                self.breakpoints.discard_internal();
                Ok(Feedback::Exited {
                    pid: self.tracee.pid(),
                    code,
                })
            }
            Stop::Killed(signal) => {
                self.breakpoints.discard_internal();
                Ok(Feedback::Killed {
                    pid: self.tracee.pid(),
                    signal,
                })
            }
        }
    }

    fn stop_feedback(&self, pc: Addr) -> Feedback {
        let location = self.index.resolve_address(pc).ok();
        let listing = location.as_ref().and_then(|loc| {
            Listing::read(&loc.file, loc.line, self.list_range)
                .inspect_err(|e| debug!("no listing for {loc}: {e}"))
                .ok()
        });
        Feedback::Stopped {
            pc,
            location,
            listing,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dbginfo::test::sample_index;
    use crate::testing::{sample_frames, FakeTracee, STACK_TOP};

    fn session() -> Debugger<FakeTracee> {
        Debugger::build(
            FakeTracee::sample(),
            sample_index(),
            Some(sample_frames()),
            Addr::NULL,
        )
    }

    fn stopped_line(feedback: &Feedback) -> Option<u64> {
        match feedback {
            Feedback::Stopped { location, .. } => location.as_ref().map(|l| l.line),
            _ => None,
        }
    }

    fn pc(dbg: &Debugger<FakeTracee>) -> Addr {
        dbg.tracee().pc().unwrap()
    }

    #[test]
    fn test_breakpoint_continue_exit() {
        let mut dbg = session();
        let fb = dbg.set_breakpoint("main.go", 4).unwrap();
        assert_eq!(
            fb.to_string(),
            "tdb add /src/main.go:4 breakpoint successfully\n"
        );

        let fb = dbg.continue_execution().unwrap();
        assert_eq!(stopped_line(&fb), Some(4));
        assert_eq!(pc(&dbg), Addr::from(0x1011u64));

        let fb = dbg.continue_execution().unwrap();
        assert_eq!(fb.to_string(), "Process 4242 has exited with status 0\n");

        let err = dbg.continue_execution().unwrap_err();
        assert_eq!(
            Feedback::Error(err).to_string(),
            "there is no process running\n"
        );
    }

    #[test]
    fn test_cleared_breakpoint_does_not_trap() {
        let mut dbg = session();
        let original = dbg.tracee().read_word(Addr::from(0x1010u64)).unwrap();
        dbg.set_breakpoint("main.go", 4).unwrap();
        dbg.set_breakpoint("main.go", 12).unwrap();

        let fb = dbg.clear_breakpoint(ClearTarget::Index(1)).unwrap();
        assert_eq!(fb.to_string(), "Deleted breakpoint at /src/main.go:4\n");

        let Feedback::Breakpoints(listed) = dbg.handle(Status::ListBreakpoints { all: false }).unwrap()
        else {
            panic!("not a breakpoint list");
        };
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].0, Some(1));
        assert_eq!(listed[0].1.line, 12);

        let fb = dbg.continue_execution().unwrap();
        assert_eq!(stopped_line(&fb), Some(12));
        assert_eq!(pc(&dbg), Addr::from(0x1006u64));
        assert_eq!(
            dbg.tracee().read_word(Addr::from(0x1010u64)).unwrap() & 0xff_ffff,
            original & 0xff_ffff
        );
    }

    #[test]
    fn test_duplicate_and_missing_lines() {
        let mut dbg = session();
        dbg.set_breakpoint("main.go", 4).unwrap();
        let err = dbg.set_breakpoint("main.go", 4).unwrap_err();
        assert_eq!(
            Feedback::Error(err).to_string(),
            "existed breakpoint main.go:4\n"
        );
        let err = dbg.set_breakpoint("main.go", 7).unwrap_err();
        assert_eq!(
            Feedback::Error(err).to_string(),
            "can't find this source line main.go:7\n"
        );
        assert!(matches!(
            dbg.clear_breakpoint(ClearTarget::Index(2)),
            Err(DebuggerError::NoSuchBreakpoint(2))
        ));
    }

    #[test]
    fn test_find_source_line() {
        let mut dbg = session();
        let fb = dbg
            .handle(Status::Find {
                file: "main.go".to_string(),
                line: 11,
            })
            .unwrap();
        assert!(matches!(fb, Feedback::Found(a) if a == Addr::from(0x1001u64)));
        assert_eq!(fb.to_string(), "Find Result as Addr: 0x1001\n");
        // finding does not touch the breakpoints
        assert!(dbg.breakpoints().all().is_empty());

        assert!(matches!(
            dbg.handle(Status::Find {
                file: "main.go".to_string(),
                line: 7,
            }),
            Err(DebuggerError::NoSuchSourceLine(..))
        ));
    }

    #[test]
    fn test_next_steps_over_call() {
        let mut dbg = session();
        let fb = dbg.next_line().unwrap();
        assert_eq!(stopped_line(&fb), Some(11));

        let fb = dbg.next_line().unwrap();
        assert_eq!(stopped_line(&fb), Some(12));
        assert_eq!(pc(&dbg), Addr::from(0x1006u64));
        assert_eq!(dbg.tracee().registers().unwrap().rsp, STACK_TOP);
        // the return breakpoint is gone again
        assert!(dbg.breakpoints().all().is_empty());
        assert_eq!(dbg.tracee().read_word(Addr::from(0x1006u64)).unwrap() & 0xff, 0x90);
    }

    #[test]
    fn test_next_stops_at_breakpoint_in_callee() {
        let mut dbg = session();
        dbg.next_line().unwrap();
        dbg.set_breakpoint("main.go", 4).unwrap();

        let fb = dbg.next_line().unwrap();
        assert_eq!(stopped_line(&fb), Some(4));
        assert_eq!(pc(&dbg), Addr::from(0x1011u64));
        assert_eq!(dbg.breakpoints().all().len(), 1);

        let fb = dbg.continue_execution().unwrap();
        assert!(matches!(fb, Feedback::Exited { code: 0, .. }));
    }

    #[test]
    fn test_step_enters_function() {
        let mut dbg = session();
        dbg.step_line().unwrap();
        let fb = dbg.step_line().unwrap();
        assert_eq!(stopped_line(&fb), Some(3));
        assert_eq!(pc(&dbg), Addr::from(0x1010u64));

        let fb = dbg.step_line().unwrap();
        assert_eq!(stopped_line(&fb), Some(4));
        dbg.step_line().unwrap();
        // returning lands in main again
        let fb = dbg.step_line().unwrap();
        assert_eq!(stopped_line(&fb), Some(12));
    }

    #[test]
    fn test_step_runs_through_code_without_line_info() {
        // the same program, but p has no line info
        let mut index = DebugInfoIndex::empty();
        let file = "/src/main.go";
        index.add_line_record(file, 10, Addr::from(0x1000u64), false);
        index.add_line_record(file, 11, Addr::from(0x1001u64), false);
        index.add_line_record(file, 12, Addr::from(0x1006u64), false);
        index.add_line_record(file, 13, Addr::from(0x1007u64), false);
        index.add_sequence(Addr::from(0x1000u64), Addr::from(0x1008u64));
        let mut dbg = Debugger::build(FakeTracee::sample(), index, None, Addr::NULL);

        dbg.step_line().unwrap();
        let fb = dbg.step_line().unwrap();
        assert_eq!(stopped_line(&fb), Some(12));
        assert_eq!(pc(&dbg), Addr::from(0x1006u64));
        assert!(dbg.breakpoints().all().is_empty());
    }

    #[test]
    fn test_step_instruction_over_breakpoint() {
        let mut dbg = session();
        dbg.set_breakpoint("main.go", 11).unwrap();
        dbg.continue_execution().unwrap();
        assert_eq!(pc(&dbg), Addr::from(0x1001u64));

        dbg.step_instruction().unwrap();
        assert_eq!(pc(&dbg), Addr::from(0x1010u64));
        // still armed after stepping over it
        assert_eq!(
            dbg.tracee().read_word(Addr::from(0x1001u64)).unwrap() & 0xff,
            0xcc
        );
    }

    #[test]
    fn test_restart_rearms_breakpoints() {
        let mut dbg = session();
        dbg.set_breakpoint("main.go", 4).unwrap();
        dbg.continue_execution().unwrap();
        dbg.continue_execution().unwrap();
        assert!(!dbg.tracee().is_alive());

        let fb = dbg.restart().unwrap();
        assert_eq!(
            fb.to_string(),
            "Restarted as process 4242, 1 breakpoint(s) armed again\n"
        );
        assert_eq!(dbg.tracee().restarts, 1);
        assert_eq!(pc(&dbg), Addr::from(0x1000u64));

        let fb = dbg.continue_execution().unwrap();
        assert_eq!(stopped_line(&fb), Some(4));
    }

    #[test]
    fn test_function_breakpoint_and_variable() {
        let mut dbg = session();
        let fb = dbg.set_function_breakpoint("p").unwrap();
        assert!(matches!(fb, Feedback::BreakpointSet { line: 4, .. }));
        assert!(matches!(
            dbg.set_function_breakpoint("nope"),
            Err(DebuggerError::UnknownFunction(_))
        ));

        dbg.continue_execution().unwrap();
        dbg.tracee
            .write_memory(Addr::from(STACK_TOP - 24), &20u64.to_le_bytes())
            .unwrap();
        let Feedback::Variable(v) = dbg.print("i").unwrap() else {
            panic!("not a variable");
        };
        assert_eq!(v.as_signed(), Some(20));
    }

    #[test]
    fn test_disassemble_current_function() {
        let mut dbg = session();
        dbg.set_breakpoint("main.go", 4).unwrap();
        dbg.continue_execution().unwrap();

        let Feedback::Disassembly { pc, disassembly } = dbg.disassemble().unwrap() else {
            panic!("not a disassembly");
        };
        assert_eq!(pc, Addr::from(0x1011u64));
        let instructions = disassembly.inner();
        assert_eq!(instructions.len(), 3);
        // the original byte is shown, not the int3
        assert_eq!(instructions[1].raw, vec![0x90]);
        assert!(instructions[1].has_bp);
        assert!(disassembly.to_string().contains("===>"));
    }

    #[test]
    fn test_backtrace_and_unsupported() {
        let mut dbg = session();
        let Feedback::Backtrace(bt) = dbg.backtrace().unwrap() else {
            panic!("not a backtrace");
        };
        assert_eq!(bt.frames()[0].function.as_deref(), Some("main"));

        let fb = dbg.handle(Status::Unsupported("x".to_string())).unwrap();
        assert_eq!(fb.to_string(), "unsupport cmd `x`\n");
    }

    struct ScriptedUi {
        commands: Vec<Status>,
        seen: Vec<String>,
    }

    impl DebuggerUI for ScriptedUi {
        fn process(&mut self, feedback: Feedback) -> Result<Status> {
            self.seen.push(feedback.to_string());
            Ok(if self.commands.is_empty() {
                Status::DebuggerQuit
            } else {
                self.commands.remove(0)
            })
        }
    }

    #[test]
    fn test_run_debugger_survives_errors() {
        let mut dbg = session();
        let mut ui = ScriptedUi {
            commands: vec![
                Status::SetBreakpoint {
                    file: "main.go".to_string(),
                    line: 7,
                },
                Status::SetBreakpoint {
                    file: "main.go".to_string(),
                    line: 4,
                },
                Status::Continue,
                Status::Continue,
                Status::Continue,
            ],
            seen: Vec::new(),
        };
        dbg.run_debugger(&mut ui).unwrap();

        assert_eq!(ui.seen.len(), 6);
        assert_eq!(ui.seen[1], "can't find this source line main.go:7\n");
        assert_eq!(ui.seen[4], "Process 4242 has exited with status 0\n");
        assert_eq!(ui.seen[5], "there is no process running\n");
    }
}
