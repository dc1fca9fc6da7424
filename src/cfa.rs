//! # CFA Module
//!
//! A small interpreter for DWARF call frame instructions.
//!
//! To unwind at some `pc`, the FDE covering it is looked up, the initial instructions of its CIE
//! are replayed to set up the default rules, and then the instructions of the FDE are replayed
//! until the location counter passes `pc`. The result is a [`Frame`]: the rule for the
//! canonical frame address, the rules for the saved registers, and the computed CFA itself.

use std::collections::HashMap;

use tracing::trace;

use crate::addr::Addr;
use crate::errors::{DebuggerError, Result};
use crate::frame::{Cie, Fde, FrameIndex};
use crate::leb128::ByteReader;
use crate::registers::{Registers, DWARF_REGISTER_COUNT};

/// How the value of a register in the calling frame is found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    Undefined,
    SameValue,
    /// Saved at `CFA + n`
    Offset(i64),
    /// The value is `CFA + n`
    ValOffset(i64),
    /// Saved in another register
    Register(u16),
    Expression(Vec<u8>),
    ValExpression(Vec<u8>),
}

/// How the canonical frame address is computed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfaRule {
    Undefined,
    /// `register + offset`
    Cfa { reg: u16, offset: i64 },
    Expression(Vec<u8>),
}

#[derive(Debug, Clone)]
struct RuleState {
    cfa: CfaRule,
    rules: HashMap<u16, Rule>,
}

/// The unwinding state of one frame at one address
#[derive(Debug, Clone)]
pub struct Frame {
    /// How far the instruction replay got
    pub loc: Addr,
    /// The address the frame was unwound for
    pub address: Addr,
    pub cfa: CfaRule,
    pub rules: HashMap<u16, Rule>,
    /// The register values, by DWARF number
    pub regs: [u64; DWARF_REGISTER_COUNT],
    /// The canonical frame address
    pub framebase: Addr,
    pub return_address_register: u16,

    code_alignment: u64,
    data_alignment: i64,
    bias: Addr,
    initial: HashMap<u16, Rule>,
    remembered: Vec<RuleState>,
}

impl Frame {
    fn new(pc: Addr, fde: &Fde, cie: &Cie, regs: &Registers, bias: Addr) -> Self {
        Self {
            loc: fde.begin,
            address: pc,
            cfa: CfaRule::Undefined,
            rules: HashMap::new(),
            regs: regs.dwarf_table(),
            framebase: Addr::NULL,
            return_address_register: cie.return_address_register,
            code_alignment: cie.code_alignment,
            data_alignment: cie.data_alignment,
            bias,
            initial: HashMap::new(),
            remembered: Vec::new(),
        }
    }

    /// The rule for a register, registers without one are undefined
    #[must_use]
    pub fn rule(&self, reg: u16) -> &Rule {
        self.rules.get(&reg).unwrap_or(&Rule::Undefined)
    }

    /// Where the caller's value of `reg` was saved, if it was saved on the stack
    #[must_use]
    pub fn saved_register(&self, reg: u16) -> Option<Addr> {
        match self.rule(reg) {
            Rule::Offset(n) => Some(self.framebase.offset(*n)),
            _ => None,
        }
    }

    /// Where the return address of this frame is stored
    #[must_use]
    pub fn return_address_slot(&self) -> Option<Addr> {
        self.saved_register(self.return_address_register)
    }

    /// Replays `instructions`
    ///
    /// With a `limit`, replay stops as soon as the location counter is past it.
    fn execute(&mut self, instructions: &[u8], limit: Option<Addr>) -> Result<()> {
        let mut rd = ByteReader::new(instructions);
        while !rd.is_empty() {
            if limit.is_some_and(|pc| self.loc > pc) {
                break;
            }
            let op = rd.u8()?;
            let low = op & 0x3f;
            match op & 0xc0 {
                DW_CFA_ADVANCE_LOC => {
                    self.advance(u64::from(low))?;
                    continue;
                }
                DW_CFA_OFFSET => {
                    let offset = self.factored(rd.uleb128()?)?;
                    self.set(u16::from(low), Rule::Offset(offset));
                    continue;
                }
                DW_CFA_RESTORE => {
                    self.restore(u16::from(low));
                    continue;
                }
                _ => (),
            }

            match op {
                DW_CFA_NOP => (),
                DW_CFA_SET_LOC => {
                    let loc = rd.u64()?;
                    self.loc = self.bias.checked_add(loc).ok_or_else(|| {
                        DebuggerError::UnresolvableFrame(format!("set_loc {loc:#x} overflows"))
                    })?;
                }
                DW_CFA_ADVANCE_LOC1 => self.advance(u64::from(rd.u8()?))?,
                DW_CFA_ADVANCE_LOC2 => self.advance(u64::from(rd.u16()?))?,
                DW_CFA_ADVANCE_LOC4 => self.advance(u64::from(rd.u32()?))?,
                DW_CFA_OFFSET_EXTENDED => {
                    let reg = register(rd.uleb128()?)?;
                    let offset = self.factored(rd.uleb128()?)?;
                    self.set(reg, Rule::Offset(offset));
                }
                DW_CFA_RESTORE_EXTENDED => self.restore(register(rd.uleb128()?)?),
                DW_CFA_UNDEFINED => self.set(register(rd.uleb128()?)?, Rule::Undefined),
                DW_CFA_SAME_VALUE => self.set(register(rd.uleb128()?)?, Rule::SameValue),
                DW_CFA_REGISTER => {
                    let reg = register(rd.uleb128()?)?;
                    let other = register(rd.uleb128()?)?;
                    self.set(reg, Rule::Register(other));
                }
                DW_CFA_REMEMBER_STATE => self.remembered.push(RuleState {
                    cfa: self.cfa.clone(),
                    rules: self.rules.clone(),
                }),
                DW_CFA_RESTORE_STATE => {
                    let state = self.remembered.pop().ok_or_else(|| {
                        DebuggerError::UnresolvableFrame(
                            "restore_state without remember_state".to_string(),
                        )
                    })?;
                    self.cfa = state.cfa;
                    self.rules = state.rules;
                }
                DW_CFA_DEF_CFA => {
                    let reg = register(rd.uleb128()?)?;
                    let offset = to_i64(rd.uleb128()?)?;
                    self.cfa = CfaRule::Cfa { reg, offset };
                }
                DW_CFA_DEF_CFA_REGISTER => {
                    let reg = register(rd.uleb128()?)?;
                    let offset = match self.cfa {
                        CfaRule::Cfa { offset, .. } => offset,
                        _ => 0,
                    };
                    self.cfa = CfaRule::Cfa { reg, offset };
                }
                DW_CFA_DEF_CFA_OFFSET => {
                    let offset = to_i64(rd.uleb128()?)?;
                    self.set_cfa_offset(offset)?;
                }
                DW_CFA_DEF_CFA_EXPRESSION => {
                    let len = rd.uleb128()? as usize;
                    self.cfa = CfaRule::Expression(rd.bytes(len)?.to_vec());
                }
                DW_CFA_EXPRESSION => {
                    let reg = register(rd.uleb128()?)?;
                    let len = rd.uleb128()? as usize;
                    self.set(reg, Rule::Expression(rd.bytes(len)?.to_vec()));
                }
                DW_CFA_OFFSET_EXTENDED_SF => {
                    let reg = register(rd.uleb128()?)?;
                    let offset = self.factored_sf(rd.sleb128()?);
                    self.set(reg, Rule::Offset(offset));
                }
                DW_CFA_DEF_CFA_SF => {
                    let reg = register(rd.uleb128()?)?;
                    let offset = self.factored_sf(rd.sleb128()?);
                    self.cfa = CfaRule::Cfa { reg, offset };
                }
                DW_CFA_DEF_CFA_OFFSET_SF => {
                    let offset = self.factored_sf(rd.sleb128()?);
                    self.set_cfa_offset(offset)?;
                }
                DW_CFA_VAL_OFFSET => {
                    let reg = register(rd.uleb128()?)?;
                    let offset = self.factored(rd.uleb128()?)?;
                    self.set(reg, Rule::ValOffset(offset));
                }
                DW_CFA_VAL_OFFSET_SF => {
                    let reg = register(rd.uleb128()?)?;
                    let offset = self.factored_sf(rd.sleb128()?);
                    self.set(reg, Rule::ValOffset(offset));
                }
                DW_CFA_VAL_EXPRESSION => {
                    let reg = register(rd.uleb128()?)?;
                    let len = rd.uleb128()? as usize;
                    self.set(reg, Rule::ValExpression(rd.bytes(len)?.to_vec()));
                }
                other => return Err(DebuggerError::UnsupportedOpcode(other)),
            }
        }
        Ok(())
    }

    fn advance(&mut self, delta: u64) -> Result<()> {
        self.loc = delta
            .checked_mul(self.code_alignment)
            .and_then(|d| self.loc.checked_add(d))
            .ok_or_else(|| {
                DebuggerError::UnresolvableFrame(format!(
                    "advancing {} by {delta} * {} overflows",
                    self.loc, self.code_alignment
                ))
            })?;
        trace!("advance to {}", self.loc);
        Ok(())
    }

    fn set(&mut self, reg: u16, rule: Rule) {
        trace!("r{reg}: {rule:?}");
        self.rules.insert(reg, rule);
    }

    fn restore(&mut self, reg: u16) {
        match self.initial.get(&reg) {
            Some(rule) => {
                self.rules.insert(reg, rule.clone());
            }
            None => {
                self.rules.remove(&reg);
            }
        }
    }

    fn set_cfa_offset(&mut self, new_offset: i64) -> Result<()> {
        match &mut self.cfa {
            CfaRule::Cfa { offset, .. } => {
                *offset = new_offset;
                Ok(())
            }
            _ => Err(DebuggerError::UnresolvableFrame(
                "CFA offset changed without a CFA register".to_string(),
            )),
        }
    }

    fn factored(&self, n: u64) -> Result<i64> {
        Ok(to_i64(n)?.wrapping_mul(self.data_alignment))
    }

    fn factored_sf(&self, n: i64) -> i64 {
        n.wrapping_mul(self.data_alignment)
    }

    fn resolve(&mut self) -> Result<()> {
        let CfaRule::Cfa { reg, offset } = self.cfa else {
            return Err(DebuggerError::UnresolvableFrame(format!(
                "CFA rule at {} is {:?}",
                self.address, self.cfa
            )));
        };
        let base = *self.regs.get(reg as usize).ok_or_else(|| {
            DebuggerError::UnresolvableFrame(format!("CFA register {reg} is not tracked"))
        })?;
        if base == 0 {
            return Err(DebuggerError::UnresolvableFrame(format!(
                "CFA register {reg} is zero"
            )));
        }
        self.framebase = Addr::from(base).offset(offset);
        Ok(())
    }
}

impl FrameIndex {
    /// Computes the [`Frame`] at `pc` for the register snapshot `regs`
    ///
    /// # Errors
    ///
    /// Fails if `pc` is not covered by exactly one FDE, if the instructions can not be
    /// interpreted, or if the resulting CFA rule is not a register plus an offset with a non
    /// zero register value.
    pub fn unwind(&self, pc: Addr, regs: &Registers) -> Result<Frame> {
        let (fde, cie) = self.covering(pc)?;
        let mut frame = Frame::new(pc, fde, cie, regs, self.bias());

        frame.execute(&cie.initial_instructions, None)?;
        frame.initial = frame.rules.clone();
        frame.execute(&fde.instructions, Some(pc))?;
        frame.resolve()?;

        trace!("frame at {pc}: cfa {:?} = {}", frame.cfa, frame.framebase);
        Ok(frame)
    }
}

fn register(n: u64) -> Result<u16> {
    u16::try_from(n).map_err(|_| DebuggerError::UnresolvableFrame(format!("register {n}")))
}

fn to_i64(n: u64) -> Result<i64> {
    i64::try_from(n).map_err(|_| DebuggerError::Leb128Overflow)
}

const DW_CFA_ADVANCE_LOC: u8 = 0x40;
const DW_CFA_OFFSET: u8 = 0x80;
const DW_CFA_RESTORE: u8 = 0xc0;
const DW_CFA_NOP: u8 = 0x00;
const DW_CFA_SET_LOC: u8 = 0x01;
const DW_CFA_ADVANCE_LOC1: u8 = 0x02;
const DW_CFA_ADVANCE_LOC2: u8 = 0x03;
const DW_CFA_ADVANCE_LOC4: u8 = 0x04;
const DW_CFA_OFFSET_EXTENDED: u8 = 0x05;
const DW_CFA_RESTORE_EXTENDED: u8 = 0x06;
const DW_CFA_UNDEFINED: u8 = 0x07;
const DW_CFA_SAME_VALUE: u8 = 0x08;
const DW_CFA_REGISTER: u8 = 0x09;
const DW_CFA_REMEMBER_STATE: u8 = 0x0a;
const DW_CFA_RESTORE_STATE: u8 = 0x0b;
const DW_CFA_DEF_CFA: u8 = 0x0c;
const DW_CFA_DEF_CFA_REGISTER: u8 = 0x0d;
const DW_CFA_DEF_CFA_OFFSET: u8 = 0x0e;
const DW_CFA_DEF_CFA_EXPRESSION: u8 = 0x0f;
const DW_CFA_EXPRESSION: u8 = 0x10;
const DW_CFA_OFFSET_EXTENDED_SF: u8 = 0x11;
const DW_CFA_DEF_CFA_SF: u8 = 0x12;
const DW_CFA_DEF_CFA_OFFSET_SF: u8 = 0x13;
const DW_CFA_VAL_OFFSET: u8 = 0x14;
const DW_CFA_VAL_OFFSET_SF: u8 = 0x15;
const DW_CFA_VAL_EXPRESSION: u8 = 0x16;

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::test::{cie_bytes, fde_bytes};
    use crate::registers::{DWARF_RBP, DWARF_RIP, DWARF_RSP};

    /// The CFI gcc emits for a function with a frame pointer
    ///
    /// ```text
    /// 0x1000 push rbp
    /// 0x1001 mov rbp, rsp
    /// 0x1004 ...
    /// ```
    fn prologue_index() -> FrameIndex {
        // def_cfa(rsp, 8), offset(rip, cfa-8)
        let mut data = cie_bytes(1, 1, -8, 16, &[0x0c, 0x07, 0x08, 0x90, 0x01]);
        data.extend(fde_bytes(
            0x1000,
            0x20,
            &[
                0x41, // advance_loc(1)
                0x0e, 0x10, // def_cfa_offset(16)
                0x86, 0x02, // offset(rbp, cfa-16)
                0x43, // advance_loc(3)
                0x0d, 0x06, // def_cfa_register(rbp)
                0x00, 0x00,
            ],
        ));
        FrameIndex::parse(&data, Addr::NULL).unwrap()
    }

    fn regs() -> Registers {
        Registers {
            rip: 0x1000,
            rsp: 0x7fff_0000,
            rbp: 0x7fff_0100,
            ..Default::default()
        }
    }

    #[test]
    fn test_def_cfa_from_cie() {
        let mut data = cie_bytes(1, 1, -8, 16, &[0x0c, 0x06, 0x10]);
        data.extend(fde_bytes(0x1000, 0x10, &[]));
        let index = FrameIndex::parse(&data, Addr::NULL).unwrap();

        let frame = index.unwind(Addr::from(0x1008u64), &regs()).unwrap();
        assert_eq!(frame.cfa, CfaRule::Cfa { reg: 6, offset: 16 });
        assert_eq!(frame.framebase, Addr::from(0x7fff_0110u64));
    }

    #[test]
    fn test_replay_stops_at_pc() {
        let index = prologue_index();
        let at = |pc: u64| index.unwind(Addr::from(pc), &regs()).unwrap();

        let entry = at(0x1000);
        assert_eq!(entry.cfa, CfaRule::Cfa { reg: DWARF_RSP, offset: 8 });
        assert_eq!(entry.framebase, Addr::from(0x7fff_0008u64));
        assert_eq!(entry.rule(DWARF_RBP), &Rule::Undefined);
        assert_eq!(entry.return_address_slot(), Some(Addr::from(0x7fff_0000u64)));

        let pushed = at(0x1001);
        assert_eq!(pushed.cfa, CfaRule::Cfa { reg: DWARF_RSP, offset: 16 });
        assert_eq!(pushed.rule(DWARF_RBP), &Rule::Offset(-16));
        assert_eq!(
            pushed.saved_register(DWARF_RBP),
            Some(Addr::from(0x7fff_0000u64))
        );

        let body = at(0x1010);
        assert_eq!(body.cfa, CfaRule::Cfa { reg: DWARF_RBP, offset: 16 });
        assert_eq!(body.framebase, Addr::from(0x7fff_0110u64));
        assert_eq!(body.rule(DWARF_RIP), &Rule::Offset(-8));
    }

    #[test]
    fn test_unwind_is_idempotent() {
        let index = prologue_index();
        let a = index.unwind(Addr::from(0x1004u64), &regs()).unwrap();
        let b = index.unwind(Addr::from(0x1004u64), &regs()).unwrap();
        assert_eq!(a.framebase, b.framebase);
        assert_eq!(a.cfa, b.cfa);
    }

    #[test]
    fn test_restore_and_remember_state() {
        let mut data = cie_bytes(1, 1, -8, 16, &[0x0c, 0x07, 0x08, 0x90, 0x01]);
        data.extend(fde_bytes(
            0x1000,
            0x20,
            &[
                0x90, 0x03, // offset(rip, cfa-24)
                0x0a, // remember_state
                0x0e, 0x20, // def_cfa_offset(32)
                0x41, // advance_loc(1)
                0x0b, // restore_state
                0xd0, // restore(rip)
            ],
        ));
        let index = FrameIndex::parse(&data, Addr::NULL).unwrap();

        let before = index.unwind(Addr::from(0x1000u64), &regs()).unwrap();
        assert_eq!(before.cfa, CfaRule::Cfa { reg: DWARF_RSP, offset: 32 });
        assert_eq!(before.rule(DWARF_RIP), &Rule::Offset(-24));

        let after = index.unwind(Addr::from(0x1001u64), &regs()).unwrap();
        assert_eq!(after.cfa, CfaRule::Cfa { reg: DWARF_RSP, offset: 8 });
        assert_eq!(after.rule(DWARF_RIP), &Rule::Offset(-8));
    }

    /// The CFI the Go linker emits: a data alignment of -4 and no frame pointer
    #[test]
    fn test_go_style_frame() {
        // def_cfa(rsp, 8), offset_extended(rip, cfa-8)
        let mut data = cie_bytes(1, 1, -4, 16, &[0x0c, 0x07, 0x08, 0x05, 0x10, 0x02]);
        data.extend(fde_bytes(
            0x1000,
            0x200,
            &[
                0x02, 0x04, // advance_loc1(4)
                0x13, 0x7c, // def_cfa_offset_sf(-4)
                0x03, 0x00, 0x01, // advance_loc2(0x100)
                0x13, 0x78, // def_cfa_offset_sf(-8)
            ],
        ));
        let index = FrameIndex::parse(&data, Addr::NULL).unwrap();

        for (pc, offset) in [(0x1000u64, 8), (0x1004, 16), (0x1103, 16), (0x1104, 32)] {
            let frame = index.unwind(Addr::from(pc), &regs()).unwrap();
            assert_eq!(frame.cfa, CfaRule::Cfa { reg: DWARF_RSP, offset }, "at {pc:#x}");
            assert_eq!(frame.rule(DWARF_RIP), &Rule::Offset(-8), "at {pc:#x}");
        }
    }

    #[test]
    fn test_location_overflow_is_an_error() {
        let mut data = cie_bytes(1, u64::MAX / 2, -8, 16, &[0x0c, 0x07, 0x08]);
        data.extend(fde_bytes(0x1000, 0x10, &[0x44])); // advance_loc(4)
        let index = FrameIndex::parse(&data, Addr::NULL).unwrap();
        assert!(matches!(
            index.unwind(Addr::from(0x1000u64), &regs()),
            Err(DebuggerError::UnresolvableFrame(_))
        ));

        let mut set_loc = vec![0x01];
        set_loc.extend_from_slice(&(u64::MAX - 4).to_le_bytes());
        let mut data = cie_bytes(1, 1, -8, 16, &[0x0c, 0x07, 0x08]);
        data.extend(fde_bytes(0x1000, 0x10, &set_loc));
        let index = FrameIndex::parse(&data, Addr::from(0x10u64)).unwrap();
        assert!(matches!(
            index.unwind(Addr::from(0x1010u64), &regs()),
            Err(DebuggerError::UnresolvableFrame(_))
        ));
    }

    #[test]
    fn test_unsupported_opcode() {
        let mut data = cie_bytes(1, 1, -8, 16, &[0x0c, 0x07, 0x08]);
        // DW_CFA_GNU_args_size
        data.extend(fde_bytes(0x1000, 0x10, &[0x2e, 0x10]));
        let index = FrameIndex::parse(&data, Addr::NULL).unwrap();
        assert!(matches!(
            index.unwind(Addr::from(0x1000u64), &regs()),
            Err(DebuggerError::UnsupportedOpcode(0x2e))
        ));
    }

    #[test]
    fn test_unresolvable_frames() {
        let mut data = cie_bytes(1, 1, -8, 16, &[]);
        data.extend(fde_bytes(0x1000, 0x10, &[]));
        data.extend(cie_bytes(1, 1, -8, 16, &[0x0c, 0x03, 0x08]));
        data.extend(fde_bytes(0x2000, 0x10, &[]));
        let index = FrameIndex::parse(&data, Addr::NULL).unwrap();

        // no CFA rule at all
        assert!(matches!(
            index.unwind(Addr::from(0x1000u64), &regs()),
            Err(DebuggerError::UnresolvableFrame(_))
        ));
        // rbx is zero in the snapshot
        assert!(matches!(
            index.unwind(Addr::from(0x2000u64), &regs()),
            Err(DebuggerError::UnresolvableFrame(_))
        ));
        assert!(matches!(
            index.unwind(Addr::from(0x9000u64), &regs()),
            Err(DebuggerError::NoCoveringFrame(_))
        ));
    }
}
