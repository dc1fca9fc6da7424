//! A [`Tracee`] that runs a tiny x86-64 image in memory, for tests that need a process.
//!
//! Instructions are decoded with [`iced_x86`]. `call`, `ret`, `push rbp`, `pop rbp`,
//! `mov rbp, rsp`, `int3` and `hlt` change state the way the CPU would (`hlt` ends the
//! process with status 0), every other instruction only advances `rip`.

use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Register};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::addr::Addr;
use crate::consts::INT3_BYTE;
use crate::errors::{DebuggerError, Result};
use crate::frame::FrameIndex;
use crate::registers::Registers;
use crate::tracee::{Stop, Tracee, TrapKind};

const STEP_LIMIT: usize = 100_000;
pub(crate) const STACK_TOP: u64 = 0x7fff_0000;

/// ```text
/// main:
/// 0x1000 90              nop             line 10
/// 0x1001 e8 0a 00 00 00  call 0x1010     line 11
/// 0x1006 90              nop             line 12
/// 0x1007 f4              hlt             line 13
/// p:
/// 0x1010 90              nop             line 3
/// 0x1011 90              nop             line 4
/// 0x1012 c3              ret             line 5
/// ```
pub(crate) fn sample_code() -> Vec<u8> {
    let mut code = vec![0x90; 0x20];
    code[..8].copy_from_slice(&[0x90, 0xe8, 0x0a, 0x00, 0x00, 0x00, 0x90, 0xf4]);
    code[0x10..0x13].copy_from_slice(&[0x90, 0x90, 0xc3]);
    code
}

/// Call frame information matching [`sample_code`]: the CFA is `rsp + 8` everywhere, the
/// return address is right below it
pub(crate) fn sample_frames() -> FrameIndex {
    use crate::frame::test::{cie_bytes, fde_bytes};
    let mut data = cie_bytes(1, 1, -8, 16, &[0x0c, 0x07, 0x08, 0x90, 0x01]);
    data.extend(fde_bytes(0x1000, 0x8, &[]));
    data.extend(fde_bytes(0x1010, 0x3, &[]));
    FrameIndex::parse(&data, Addr::NULL).unwrap()
}

#[derive(Debug, Clone)]
struct Region {
    start: Addr,
    data: Vec<u8>,
}

impl Region {
    fn offset_of(&self, addr: Addr) -> Option<usize> {
        addr.distance_from(self.start)
            .filter(|off| *off < self.data.len())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FakeTracee {
    regions: Vec<Region>,
    regs: Registers,
    alive: bool,
    initial_regions: Vec<Region>,
    initial_regs: Registers,
    pub(crate) restarts: usize,
    pub(crate) signals: Vec<Signal>,
}

impl FakeTracee {
    pub(crate) fn new(code_base: Addr, code: Vec<u8>, entry: Addr) -> Self {
        let regions = vec![
            Region {
                start: code_base,
                data: code,
            },
            Region {
                start: Addr::from(STACK_TOP - 0x1000),
                data: vec![0; 0x2000],
            },
        ];
        let regs = Registers {
            rip: entry.u64(),
            rsp: STACK_TOP,
            ..Default::default()
        };
        Self {
            initial_regions: regions.clone(),
            initial_regs: regs,
            regions,
            regs,
            alive: true,
            restarts: 0,
            signals: Vec::new(),
        }
    }

    pub(crate) fn sample() -> Self {
        Self::new(Addr::from(0x1000u64), sample_code(), Addr::from(0x1000u64))
    }

    fn check_alive(&self) -> Result<()> {
        if self.alive {
            Ok(())
        } else {
            Err(DebuggerError::ProcessGone)
        }
    }

    fn push(&mut self, value: u64) -> Result<()> {
        self.regs.rsp -= 8;
        self.write_memory(Addr::from(self.regs.rsp), &value.to_le_bytes())
    }

    fn pop(&mut self) -> Result<u64> {
        let value = self.read_word(Addr::from(self.regs.rsp))?;
        self.regs.rsp += 8;
        Ok(value)
    }

    fn execute_one(&mut self) -> Result<Stop> {
        let pc = self.regs.pc();
        let mut bytes = [0u8; 15];
        let len = self.read_memory(pc, &mut bytes)?;
        if len == 0 {
            return Ok(Stop::Signal(Signal::SIGSEGV));
        }
        if bytes[0] == INT3_BYTE {
            self.regs.rip += 1;
            return Ok(Stop::Trap(TrapKind::Breakpoint));
        }

        let mut decoder = Decoder::with_ip(64, &bytes[..len], pc.u64(), DecoderOptions::NONE);
        let mut instr = Instruction::default();
        decoder.decode_out(&mut instr);
        if instr.is_invalid() {
            return Ok(Stop::Signal(Signal::SIGILL));
        }
        let next = instr.next_ip();

        match instr.code() {
            Code::Hlt => {
                self.alive = false;
                return Ok(Stop::Exited(0));
            }
            Code::Call_rel32_64 => {
                self.push(next)?;
                self.regs.rip = instr.near_branch_target();
            }
            Code::Retnq => {
                self.regs.rip = self.pop()?;
            }
            Code::Push_r64 if instr.op0_register() == Register::RBP => {
                self.push(self.regs.rbp)?;
                self.regs.rip = next;
            }
            Code::Pop_r64 if instr.op0_register() == Register::RBP => {
                self.regs.rbp = self.pop()?;
                self.regs.rip = next;
            }
            Code::Mov_rm64_r64 | Code::Mov_r64_rm64
                if instr.op0_register() == Register::RBP
                    && instr.op1_register() == Register::RSP =>
            {
                self.regs.rbp = self.regs.rsp;
                self.regs.rip = next;
            }
            _ => self.regs.rip = next,
        }
        Ok(Stop::Trap(TrapKind::SingleStep))
    }
}

impl Tracee for FakeTracee {
    fn pid(&self) -> Pid {
        Pid::from_raw(4242)
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    fn read_memory(&self, addr: Addr, buf: &mut [u8]) -> Result<usize> {
        self.check_alive()?;
        for region in &self.regions {
            if let Some(off) = region.offset_of(addr) {
                let len = buf.len().min(region.data.len() - off);
                buf[..len].copy_from_slice(&region.data[off..off + len]);
                return Ok(len);
            }
        }
        Err(DebuggerError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{addr} is not mapped"),
        )))
    }

    fn write_memory(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        self.check_alive()?;
        for region in &mut self.regions {
            if let Some(off) = region.offset_of(addr) {
                if off + data.len() > region.data.len() {
                    break;
                }
                region.data[off..off + data.len()].copy_from_slice(data);
                return Ok(());
            }
        }
        Err(DebuggerError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{addr} is not mapped"),
        )))
    }

    fn registers(&self) -> Result<Registers> {
        self.check_alive()?;
        Ok(self.regs)
    }

    fn set_registers(&mut self, regs: &Registers) -> Result<()> {
        self.check_alive()?;
        self.regs = *regs;
        Ok(())
    }

    fn single_step(&mut self) -> Result<Stop> {
        self.check_alive()?;
        self.execute_one()
    }

    fn resume(&mut self, sig: Option<Signal>) -> Result<Stop> {
        self.check_alive()?;
        if let Some(sig) = sig {
            self.signals.push(sig);
        }
        for _ in 0..STEP_LIMIT {
            match self.execute_one()? {
                Stop::Trap(TrapKind::SingleStep) => continue,
                other => return Ok(other),
            }
        }
        Err(DebuggerError::UnexpectedStop(
            "the fake tracee ran too long".to_string(),
        ))
    }

    fn restart(&mut self) -> Result<()> {
        self.regions = self.initial_regions.clone();
        self.regs = self.initial_regs;
        self.alive = true;
        self.restarts += 1;
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.check_alive()?;
        self.alive = false;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_call_and_return() {
        let mut t = FakeTracee::sample();
        assert_eq!(t.single_step().unwrap(), Stop::Trap(TrapKind::SingleStep));
        t.single_step().unwrap();
        assert_eq!(t.pc().unwrap(), Addr::from(0x1010u64));
        assert_eq!(t.registers().unwrap().rsp, STACK_TOP - 8);
        assert_eq!(t.read_word(Addr::from(STACK_TOP - 8)).unwrap(), 0x1006);

        t.single_step().unwrap();
        t.single_step().unwrap();
        t.single_step().unwrap();
        assert_eq!(t.pc().unwrap(), Addr::from(0x1006u64));
        assert_eq!(t.resume(None).unwrap(), Stop::Exited(0));
        assert!(matches!(t.pc(), Err(DebuggerError::ProcessGone)));

        t.restart().unwrap();
        assert_eq!(t.pc().unwrap(), Addr::from(0x1000u64));
    }

    #[test]
    fn test_int3_traps_after_the_byte() {
        let mut t = FakeTracee::sample();
        t.write_memory(Addr::from(0x1011u64), &[INT3_BYTE]).unwrap();
        assert_eq!(t.resume(None).unwrap(), Stop::Trap(TrapKind::Breakpoint));
        assert_eq!(t.pc().unwrap(), Addr::from(0x1012u64));
    }
}
