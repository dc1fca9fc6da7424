//! # Registers Module
//!
//! The general purpose register set of an x86-64 debuggee and the mapping between DWARF
//! register numbers and hardware registers.

use std::fmt::Display;

use nix::libc::user_regs_struct;

use crate::addr::Addr;

/// Number of DWARF registers the unwinder tracks (`rax` through `rip`)
pub const DWARF_REGISTER_COUNT: usize = 17;

/// DWARF register number of the frame pointer
pub const DWARF_RBP: u16 = 6;
/// DWARF register number of the stack pointer
pub const DWARF_RSP: u16 = 7;
/// DWARF register number of the return address column
pub const DWARF_RIP: u16 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum Register {
    rax,
    rdx,
    rcx,
    rbx,
    rsi,
    rdi,
    rbp,
    rsp,
    r8,
    r9,
    r10,
    r11,
    r12,
    r13,
    r14,
    r15,
    rip,
    eflags,
    orig_rax,
    cs,
    ss,
    ds,
    es,
    fs,
    gs,
    fs_base,
    gs_base,
}

impl Register {
    /// Maps a DWARF register number of the System V x86-64 ABI to the hardware register
    #[must_use]
    pub fn from_dwarf(number: u16) -> Option<Self> {
        Some(match number {
            0 => Self::rax,
            1 => Self::rdx,
            2 => Self::rcx,
            3 => Self::rbx,
            4 => Self::rsi,
            5 => Self::rdi,
            6 => Self::rbp,
            7 => Self::rsp,
            8 => Self::r8,
            9 => Self::r9,
            10 => Self::r10,
            11 => Self::r11,
            12 => Self::r12,
            13 => Self::r13,
            14 => Self::r14,
            15 => Self::r15,
            16 => Self::rip,
            49 => Self::eflags,
            50 => Self::es,
            51 => Self::cs,
            52 => Self::ss,
            53 => Self::ds,
            54 => Self::fs,
            55 => Self::gs,
            58 => Self::fs_base,
            59 => Self::gs_base,
            _ => return None,
        })
    }
}

/// A snapshot of the general purpose registers of the debuggee
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub eflags: u64,
    pub orig_rax: u64,
    pub cs: u64,
    pub ss: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
    pub fs_base: u64,
    pub gs_base: u64,
}

impl Registers {
    #[inline]
    #[must_use]
    pub fn pc(&self) -> Addr {
        Addr::from(self.rip)
    }

    #[inline]
    pub fn set_pc(&mut self, pc: Addr) {
        self.rip = pc.u64();
    }

    #[inline]
    #[must_use]
    pub fn frame_pointer(&self) -> Addr {
        Addr::from(self.rbp)
    }

    #[inline]
    #[must_use]
    pub fn stack_pointer(&self) -> Addr {
        Addr::from(self.rsp)
    }

    #[must_use]
    pub fn get(&self, reg: Register) -> u64 {
        match reg {
            Register::rax => self.rax,
            Register::rdx => self.rdx,
            Register::rcx => self.rcx,
            Register::rbx => self.rbx,
            Register::rsi => self.rsi,
            Register::rdi => self.rdi,
            Register::rbp => self.rbp,
            Register::rsp => self.rsp,
            Register::r8 => self.r8,
            Register::r9 => self.r9,
            Register::r10 => self.r10,
            Register::r11 => self.r11,
            Register::r12 => self.r12,
            Register::r13 => self.r13,
            Register::r14 => self.r14,
            Register::r15 => self.r15,
            Register::rip => self.rip,
            Register::eflags => self.eflags,
            Register::orig_rax => self.orig_rax,
            Register::cs => self.cs,
            Register::ss => self.ss,
            Register::ds => self.ds,
            Register::es => self.es,
            Register::fs => self.fs,
            Register::gs => self.gs,
            Register::fs_base => self.fs_base,
            Register::gs_base => self.gs_base,
        }
    }

    /// Value of a register given by its DWARF number
    #[must_use]
    pub fn get_dwarf(&self, number: u16) -> Option<u64> {
        Register::from_dwarf(number).map(|r| self.get(r))
    }

    /// The registers the CFA interpreter can use as a base, indexed by DWARF number
    #[must_use]
    pub fn dwarf_table(&self) -> [u64; DWARF_REGISTER_COUNT] {
        let mut table = [0; DWARF_REGISTER_COUNT];
        for (number, slot) in table.iter_mut().enumerate() {
            *slot = self.get_dwarf(number as u16).unwrap_or_default();
        }
        table
    }
}

impl From<user_regs_struct> for Registers {
    fn from(r: user_regs_struct) -> Self {
        Self {
            rax: r.rax,
            rbx: r.rbx,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            rbp: r.rbp,
            rsp: r.rsp,
            r8: r.r8,
            r9: r.r9,
            r10: r.r10,
            r11: r.r11,
            r12: r.r12,
            r13: r.r13,
            r14: r.r14,
            r15: r.r15,
            rip: r.rip,
            eflags: r.eflags,
            orig_rax: r.orig_rax,
            cs: r.cs,
            ss: r.ss,
            ds: r.ds,
            es: r.es,
            fs: r.fs,
            gs: r.gs,
            fs_base: r.fs_base,
            gs_base: r.gs_base,
        }
    }
}

impl From<Registers> for user_regs_struct {
    fn from(r: Registers) -> Self {
        user_regs_struct {
            r15: r.r15,
            r14: r.r14,
            r13: r.r13,
            r12: r.r12,
            rbp: r.rbp,
            rbx: r.rbx,
            r11: r.r11,
            r10: r.r10,
            r9: r.r9,
            r8: r.r8,
            rax: r.rax,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            orig_rax: r.orig_rax,
            rip: r.rip,
            cs: r.cs,
            eflags: r.eflags,
            rsp: r.rsp,
            ss: r.ss,
            fs_base: r.fs_base,
            gs_base: r.gs_base,
            ds: r.ds,
            es: r.es,
            fs: r.fs,
            gs: r.gs,
        }
    }
}

impl Display for Registers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rows = [
            ("rax", self.rax),
            ("rbx", self.rbx),
            ("rcx", self.rcx),
            ("rdx", self.rdx),
            ("rsi", self.rsi),
            ("rdi", self.rdi),
            ("rbp", self.rbp),
            ("rsp", self.rsp),
            ("r8", self.r8),
            ("r9", self.r9),
            ("r10", self.r10),
            ("r11", self.r11),
            ("r12", self.r12),
            ("r13", self.r13),
            ("r14", self.r14),
            ("r15", self.r15),
            ("rip", self.rip),
            ("eflags", self.eflags),
        ];
        for (name, value) in rows {
            writeln!(f, "{name:<8}{value:#018x}")?;
        }
        Ok(())
    }
}
