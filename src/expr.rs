//! Decoding of the single operation DWARF location expressions that compilers emit for
//! unoptimized code: frame base relative, register relative, fixed addresses and plain
//! registers.
//!
//! Anything else is reported as [`DebuggerError::UnsupportedLocation`].

use crate::addr::Addr;
use crate::errors::{DebuggerError, Result};
use crate::leb128::ByteReader;
use crate::registers::Registers;

const DW_OP_ADDR: u8 = 0x03;
const DW_OP_REG0: u8 = 0x50;
const DW_OP_REG31: u8 = 0x6f;
const DW_OP_BREG0: u8 = 0x70;
const DW_OP_BREG31: u8 = 0x8f;
const DW_OP_REGX: u8 = 0x90;
const DW_OP_FBREG: u8 = 0x91;
const DW_OP_BREGX: u8 = 0x92;
const DW_OP_CALL_FRAME_CFA: u8 = 0x9c;

/// A decoded location expression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationOp {
    /// `DW_OP_addr`
    Address(u64),
    /// `DW_OP_reg<n>`, `DW_OP_regx`
    Register(u16),
    /// `DW_OP_breg<n>`, `DW_OP_bregx`
    RegisterOffset(u16, i64),
    /// `DW_OP_fbreg`
    FrameBaseOffset(i64),
    /// `DW_OP_call_frame_cfa`
    CallFrameCfa,
}

/// Where a value lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    Memory(Addr),
    Register(u16),
}

/// What evaluating a location needs to know about the current frame
#[derive(Debug, Clone, Copy)]
pub struct LocationContext<'a> {
    pub regs: &'a Registers,
    pub cfa: Option<Addr>,
    pub frame_base: Option<Addr>,
    pub bias: Addr,
}

impl LocationOp {
    /// Decodes `expr`, which must consist of exactly one supported operation
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::UnsupportedLocation`] for other operations and
    /// [`DebuggerError::UnexpectedEof`] for truncated ones.
    pub fn decode(expr: &[u8]) -> Result<Self> {
        let mut rd = ByteReader::new(expr);
        let op = rd.u8().map_err(|_| DebuggerError::UnexpectedEof("location expression"))?;
        let decoded = match op {
            DW_OP_ADDR => Self::Address(rd.u64()?),
            DW_OP_REG0..=DW_OP_REG31 => Self::Register(u16::from(op - DW_OP_REG0)),
            DW_OP_BREG0..=DW_OP_BREG31 => {
                Self::RegisterOffset(u16::from(op - DW_OP_BREG0), rd.sleb128()?)
            }
            DW_OP_REGX => Self::Register(register(rd.uleb128()?)?),
            DW_OP_FBREG => Self::FrameBaseOffset(rd.sleb128()?),
            DW_OP_BREGX => {
                let reg = register(rd.uleb128()?)?;
                Self::RegisterOffset(reg, rd.sleb128()?)
            }
            DW_OP_CALL_FRAME_CFA => Self::CallFrameCfa,
            other => return Err(DebuggerError::UnsupportedLocation(other)),
        };
        if let Some(next) = rd.rest().first() {
            return Err(DebuggerError::UnsupportedLocation(*next));
        }
        Ok(decoded)
    }

    /// Computes where the value described by this operation lives
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::UnresolvableFrame`] if the operation needs a frame base or
    /// CFA that the context does not have, or a register that is not tracked.
    pub fn place(&self, ctx: &LocationContext<'_>) -> Result<Place> {
        Ok(match *self {
            Self::Address(a) => Place::Memory(ctx.bias.checked_add(a).ok_or_else(|| {
                DebuggerError::UnresolvableFrame(format!("address {a:#x} overflows"))
            })?),
            Self::Register(r) => Place::Register(r),
            Self::RegisterOffset(r, offset) => {
                let base = ctx.regs.get_dwarf(r).ok_or_else(|| {
                    DebuggerError::UnresolvableFrame(format!("register {r} is not tracked"))
                })?;
                Place::Memory(Addr::from(base).offset(offset))
            }
            Self::FrameBaseOffset(offset) => {
                let base = ctx.frame_base.ok_or_else(|| {
                    DebuggerError::UnresolvableFrame("no frame base".to_string())
                })?;
                Place::Memory(base.offset(offset))
            }
            Self::CallFrameCfa => Place::Memory(ctx.cfa.ok_or_else(|| {
                DebuggerError::UnresolvableFrame("no canonical frame address".to_string())
            })?),
        })
    }
}

/// Evaluates the `DW_AT_frame_base` expression of a function to an address
///
/// A register location means the frame base is the value of that register.
///
/// # Errors
///
/// Fails if the expression is not supported or can not be evaluated in `ctx`.
pub fn frame_base(expr: &[u8], ctx: &LocationContext<'_>) -> Result<Addr> {
    match LocationOp::decode(expr)?.place(ctx)? {
        Place::Memory(addr) => Ok(addr),
        Place::Register(r) => ctx.regs.get_dwarf(r).map(Addr::from).ok_or_else(|| {
            DebuggerError::UnresolvableFrame(format!("register {r} is not tracked"))
        }),
    }
}

fn register(n: u64) -> Result<u16> {
    u16::try_from(n).map_err(|_| DebuggerError::UnsupportedLocation(DW_OP_REGX))
}
