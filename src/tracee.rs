//! # Tracee Module
//!
//! The process control surface the debugger core consumes: memory peeks and pokes, the
//! register set, single steps, continues and the stop events that follow them.
//!
//! [`Tracee`] is the seam between the core and the operating system. [`PtraceTracee`] implements
//! it with the [ptrace](nix::sys::ptrace) API for a child process it forks and execs itself.
//!
//! The tracer/tracee relationship is bound to the thread that forked the child. Every call
//! into a [`PtraceTracee`] from another thread fails with [`DebuggerError::WrongTracerThread`].

use std::convert::Infallible;
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::thread::ThreadId;

use nix::sys::personality::{self, Persona};
use nix::sys::ptrace;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execv, fork, setpgid, ForkResult, Pid};
use tracing::{debug, error, info, trace, warn};

use crate::addr::Addr;
use crate::consts::{SI_KERNEL, TRAP_BRKPT, TRAP_TRACE, WORD_BYTES};
use crate::errors::{DebuggerError, Result};
use crate::registers::Registers;

/// Why a `SIGTRAP` stop happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    /// An `int3` was executed
    Breakpoint,
    /// A single step completed
    SingleStep,
    /// Some other trap, for example the one after `execve`
    Other,
}

/// A state change of the debuggee, observed after it was resumed or stepped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    Trap(TrapKind),
    Signal(Signal),
    Exited(i32),
    Killed(Signal),
}

impl Stop {
    /// Whether the debuggee no longer exists after this stop
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Killed(_))
    }
}

/// Raw access to a stopped debuggee
pub trait Tracee {
    fn pid(&self) -> Pid;

    fn is_alive(&self) -> bool;

    /// Reads as many bytes as possible into `buf`, returning how many were read
    fn read_memory(&self, addr: Addr, buf: &mut [u8]) -> Result<usize>;

    fn write_memory(&mut self, addr: Addr, data: &[u8]) -> Result<()>;

    fn registers(&self) -> Result<Registers>;

    fn set_registers(&mut self, regs: &Registers) -> Result<()>;

    /// Executes exactly one machine instruction and waits for the following stop
    fn single_step(&mut self) -> Result<Stop>;

    /// Lets the debuggee run until it stops or exits, optionally delivering a signal
    fn resume(&mut self, sig: Option<Signal>) -> Result<Stop>;

    /// Terminates the current process (best effort) and launches a fresh one that is stopped
    /// before its first instruction
    fn restart(&mut self) -> Result<()>;

    fn kill(&mut self) -> Result<()>;

    fn pc(&self) -> Result<Addr> {
        Ok(self.registers()?.pc())
    }

    fn set_pc(&mut self, pc: Addr) -> Result<()> {
        let mut regs = self.registers()?;
        regs.set_pc(pc);
        self.set_registers(&regs)
    }

    /// Reads exactly `buf.len()` bytes, a short read is an error
    fn read_exact(&self, addr: Addr, buf: &mut [u8]) -> Result<()> {
        let len = self.read_memory(addr, buf)?;
        if len != buf.len() {
            return Err(DebuggerError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read {len} of {} bytes at {addr}", buf.len()),
            )));
        }
        Ok(())
    }

    fn read_word(&self, addr: Addr) -> Result<u64> {
        let mut buf = [0u8; WORD_BYTES];
        self.read_exact(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

/// A child process traced with `ptrace`
#[derive(Debug)]
pub struct PtraceTracee {
    executable: PathBuf,
    args: Vec<CString>,
    pid: Pid,
    alive: bool,
    tracer: ThreadId,
}

impl PtraceTracee {
    /// Forks and execs `executable` with `args` under `PTRACE_TRACEME`
    ///
    /// The child runs in its own process group with address space randomization disabled, so
    /// addresses stay stable across restarts. When this returns, the child is stopped at the
    /// trap that follows `execve`.
    ///
    /// # Errors
    ///
    /// Fails if the executable does not exist, is not a file, or if forking or waiting fails.
    pub fn launch(executable: impl AsRef<Path>, args: &[String]) -> Result<Self> {
        let path: &Path = executable.as_ref();
        if !path.exists() {
            let err = DebuggerError::ExecutableDoesNotExist(path.to_string_lossy().to_string());
            error!("{err}");
            return Err(err);
        }
        if !path.is_file() {
            let err = DebuggerError::ExecutableIsNotAFile(path.to_string_lossy().to_string());
            error!("{err}");
            return Err(err);
        }

        let mut cargs = vec![CString::new(path.to_string_lossy().as_bytes())?];
        for a in args {
            cargs.push(CString::new(a.as_str())?);
        }

        let pid = Self::spawn(&cargs)?;
        Ok(Self {
            executable: path.to_owned(),
            args: cargs,
            pid,
            alive: true,
            tracer: std::thread::current().id(),
        })
    }

    #[must_use]
    pub fn executable(&self) -> &Path {
        &self.executable
    }

    fn spawn(args: &[CString]) -> Result<Pid> {
        // SAFETY: the debugger is single threaded, the child only execs
        let fork_res = unsafe { fork() };
        match fork_res {
            Err(e) => {
                error!("could not start executable: {e}");
                Err(e.into())
            }
            Ok(ForkResult::Parent { child }) => {
                match waitpid(child, None)? {
                    WaitStatus::Stopped(_, Signal::SIGTRAP) => (),
                    other => {
                        return Err(DebuggerError::UnexpectedStop(format!(
                            "debuggee did not stop after exec: {other:?}"
                        )))
                    }
                }
                info!("launched debuggee with pid {child}");
                Ok(child)
            }
            Ok(ForkResult::Child) => {
                if let Err(e) = Self::exec_child(args) {
                    eprintln!("could not exec the debuggee: {e}");
                }
                std::process::exit(127)
            }
        }
    }

    fn exec_child(args: &[CString]) -> Result<Infallible> {
        setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
        personality::set(Persona::ADDR_NO_RANDOMIZE)?;
        ptrace::traceme()?;
        Ok(execv(&args[0], args)?)
    }

    fn check_access(&self) -> Result<()> {
        if std::thread::current().id() != self.tracer {
            return Err(DebuggerError::WrongTracerThread);
        }
        if !self.alive {
            return Err(DebuggerError::ProcessGone);
        }
        Ok(())
    }

    fn wait_stop(&mut self) -> Result<Stop> {
        let status = waitpid(self.pid, None)?;
        trace!("wait status: {status:?}");
        let stop = match status {
            WaitStatus::Exited(_, code) => Stop::Exited(code),
            WaitStatus::Signaled(_, sig, _) => Stop::Killed(sig),
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                let info = ptrace::getsiginfo(self.pid)?;
                Stop::Trap(match info.si_code {
                    SI_KERNEL | TRAP_BRKPT => TrapKind::Breakpoint,
                    TRAP_TRACE => TrapKind::SingleStep,
                    _ => TrapKind::Other,
                })
            }
            WaitStatus::Stopped(_, sig) => Stop::Signal(sig),
            other => return Err(DebuggerError::UnexpectedStop(format!("{other:?}"))),
        };
        if stop.is_terminal() {
            info!("debuggee {} is gone: {stop:?}", self.pid);
            self.alive = false;
        }
        Ok(stop)
    }

    /// The address the executable was mapped at, for position independent executables
    ///
    /// # Errors
    ///
    /// Fails if the memory map of the debuggee can not be read.
    pub fn load_bias(&self) -> Result<Addr> {
        self.check_access()?;
        let exe = std::fs::canonicalize(&self.executable)?;
        let maps = proc_maps::get_process_maps(self.pid.as_raw())?;
        let bias = maps
            .iter()
            .find(|m| m.offset == 0 && m.filename().is_some_and(|f| f == exe))
            .map(|m| Addr::from(m.start()))
            .unwrap_or(Addr::NULL);
        debug!("load bias of {}: {bias}", exe.display());
        Ok(bias)
    }
}

impl Tracee for PtraceTracee {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    fn read_memory(&self, addr: Addr, buf: &mut [u8]) -> Result<usize> {
        self.check_access()?;
        let mut file = File::options()
            .read(true)
            .write(false)
            .open(format!("/proc/{}/mem", self.pid))?;
        file.seek(SeekFrom::Start(addr.u64()))?;
        let mut done = 0;
        while done < buf.len() {
            match file.read(&mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if done > 0 => {
                    trace!("short read at {}: {e}", addr + done);
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(done)
    }

    fn write_memory(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        self.check_access()?;
        let mut done = 0;
        while done < data.len() {
            let at = addr + done;
            let word_addr = Addr::from(at.u64() & !(WORD_BYTES as u64 - 1));
            let shift = (at.u64() - word_addr.u64()) as usize;
            let len = (WORD_BYTES - shift).min(data.len() - done);

            let mut word = ptrace::read(self.pid, word_addr.raw_pointer())?.to_le_bytes();
            word[shift..shift + len].copy_from_slice(&data[done..done + len]);
            ptrace::write(self.pid, word_addr.raw_pointer(), i64::from_le_bytes(word))?;
            done += len;
        }
        Ok(())
    }

    fn registers(&self) -> Result<Registers> {
        self.check_access()?;
        Ok(ptrace::getregs(self.pid)?.into())
    }

    fn set_registers(&mut self, regs: &Registers) -> Result<()> {
        self.check_access()?;
        ptrace::setregs(self.pid, (*regs).into())?;
        Ok(())
    }

    fn single_step(&mut self) -> Result<Stop> {
        self.check_access()?;
        ptrace::step(self.pid, None)?;
        self.wait_stop()
    }

    fn resume(&mut self, sig: Option<Signal>) -> Result<Stop> {
        self.check_access()?;
        ptrace::cont(self.pid, sig)?;
        self.wait_stop()
    }

    fn restart(&mut self) -> Result<()> {
        if std::thread::current().id() != self.tracer {
            return Err(DebuggerError::WrongTracerThread);
        }
        if self.alive {
            // the old process may already be gone, nothing to do then
            if let Err(e) = killpg(self.pid, Signal::SIGKILL) {
                debug!("could not signal the old process group: {e}");
            }
            if let Err(e) = waitpid(self.pid, None) {
                debug!("could not reap the old debuggee: {e}");
            }
        }
        self.alive = false;
        self.pid = Self::spawn(&self.args)?;
        self.alive = true;
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.check_access()?;
        ptrace::kill(self.pid)?;
        if let Err(e) = waitpid(self.pid, None) {
            warn!("could not reap the killed debuggee {}: {e}", self.pid);
        }
        self.alive = false;
        Ok(())
    }
}

impl Drop for PtraceTracee {
    fn drop(&mut self) {
        if self.alive {
            if let Err(e) = self.kill() {
                warn!("could not kill the debuggee while dropping: {e}");
            }
        }
    }
}
