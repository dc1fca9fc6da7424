//! # Variable Module
//!
//! Locating and reading the raw bytes of a variable for the `print` command.
//!
//! The variable is searched in the function containing the pc first, then in the globals.
//! Frame base relative locations are resolved with the `DW_AT_frame_base` of the function,
//! which compilers usually express through the canonical frame address, so the unwinder is
//! consulted for it.

use std::fmt::Display;

use crate::addr::Addr;
use crate::dbginfo::DebugInfoIndex;
use crate::errors::{DebuggerError, Result};
use crate::expr::{self, LocationContext, LocationOp, Place};
use crate::frame::FrameIndex;
use crate::registers::Register;
use crate::tracee::Tracee;

/// Bytes read for variables of unknown size
const DEFAULT_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableValue {
    pub name: String,
    pub type_name: Option<String>,
    pub place: Place,
    pub bytes: Vec<u8>,
}

impl VariableValue {
    /// The bytes as little endian unsigned integer, for values of up to 8 bytes
    #[must_use]
    pub fn as_unsigned(&self) -> Option<u64> {
        if self.bytes.is_empty() || self.bytes.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..self.bytes.len()].copy_from_slice(&self.bytes);
        Some(u64::from_le_bytes(buf))
    }

    /// The bytes as little endian two's complement integer, for values of up to 8 bytes
    #[must_use]
    pub fn as_signed(&self) -> Option<i64> {
        let u = self.as_unsigned()?;
        let unused = 64 - 8 * self.bytes.len() as u32;
        Some(((u << unused) as i64) >> unused)
    }
}

impl Display for VariableValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} = ", self.name)?;
        match (self.as_signed(), self.as_unsigned()) {
            (Some(s), Some(u)) => write!(f, "{s} (unsigned {u}, {u:#x})")?,
            _ => {
                for byte in &self.bytes {
                    write!(f, "{byte:02x} ")?;
                }
            }
        }
        write!(f, " [{}", self.type_name.as_deref().unwrap_or("?"))?;
        match self.place {
            Place::Memory(addr) => write!(f, " at {addr}]"),
            Place::Register(r) => match Register::from_dwarf(r) {
                Some(reg) => write!(f, " in {reg:?}]"),
                None => write!(f, " in register {r}]"),
            },
        }
    }
}

/// Finds the variable `name` visible at the current pc and reads its bytes
///
/// `bias` is the load bias, needed for variables at fixed addresses.
///
/// # Errors
///
/// Fails with [`DebuggerError::UnknownVariable`] if there is no such variable,
/// [`DebuggerError::NoLocation`] or [`DebuggerError::UnsupportedLocation`] if its location can
/// not be decoded, with an unwind error if the frame base can not be computed, or if the
/// memory can not be read.
pub fn read_variable<T: Tracee>(
    tracee: &T,
    index: &DebugInfoIndex,
    frames: Option<&FrameIndex>,
    bias: Addr,
    name: &str,
) -> Result<VariableValue> {
    let regs = tracee.registers()?;
    let pc = regs.pc();
    let (variable, function) = index.variable_in_scope(pc, name)?;
    if variable.location.is_empty() {
        return Err(DebuggerError::NoLocation(name.to_string()));
    }
    let op = LocationOp::decode(&variable.location)?;

    let frame_base_expr = match (op, function) {
        (LocationOp::FrameBaseOffset(_), Some(f)) => Some(f.frame_base.as_slice()),
        (LocationOp::FrameBaseOffset(_), None) => {
            return Err(DebuggerError::NoLocation(name.to_string()))
        }
        _ => None,
    };
    let needs_cfa = op == LocationOp::CallFrameCfa
        || frame_base_expr.is_some_and(|e| {
            LocationOp::decode(e).is_ok_and(|fb| fb == LocationOp::CallFrameCfa)
        });
    let cfa = if needs_cfa {
        let frames = frames.ok_or_else(|| DebuggerError::MissingSection(".debug_frame".to_string()))?;
        Some(frames.unwind(pc, &regs)?.framebase)
    } else {
        None
    };

    let mut ctx = LocationContext {
        regs: &regs,
        cfa,
        frame_base: None,
        bias,
    };
    if let Some(expr) = frame_base_expr {
        ctx.frame_base = Some(expr::frame_base(expr, &ctx)?);
    }
    let place = op.place(&ctx)?;

    let ty = variable.type_offset.and_then(|o| index.type_entry(o));
    let size = ty
        .and_then(|t| t.byte_size)
        .map_or(DEFAULT_SIZE, |s| s as usize);

    let bytes = match place {
        Place::Memory(addr) => {
            let mut buf = vec![0u8; size];
            tracee.read_exact(addr, &mut buf)?;
            buf
        }
        Place::Register(r) => {
            let value = regs.get_dwarf(r).ok_or_else(|| {
                DebuggerError::UnresolvableFrame(format!("register {r} is not tracked"))
            })?;
            value.to_le_bytes()[..size.min(8)].to_vec()
        }
    };

    Ok(VariableValue {
        name: name.to_string(),
        type_name: ty.and_then(|t| t.name.clone()),
        place,
        bytes,
    })
}
