//! # Frame Module
//!
//! Parses the `.debug_frame` section into its Common Information Entries ([`Cie`]) and Frame
//! Description Entries ([`Fde`]).
//!
//! Entry layout: a 4 byte length, then a 4 byte id. An id of `0xffffffff` starts a CIE, any
//! other id an FDE, which belongs to the CIE parsed most recently. FDE addresses are 8 bytes
//! wide.

use tracing::{debug, trace};

use crate::addr::Addr;
use crate::errors::{DebuggerError, Result};
use crate::leb128::ByteReader;
use crate::section::require_section;

const CIE_ID: u32 = 0xffff_ffff;
const DWARF64_ESCAPE: u32 = 0xffff_ffff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cie {
    pub version: u8,
    pub augmentation: String,
    pub code_alignment: u64,
    pub data_alignment: i64,
    pub return_address_register: u16,
    pub initial_instructions: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fde {
    pub begin: Addr,
    pub size: u64,
    pub instructions: Vec<u8>,
    /// Index into [`FrameIndex::cies`]
    pub cie: usize,
}

impl Fde {
    /// The last address covered, saturating at the top of the address space
    #[must_use]
    pub fn end(&self) -> Addr {
        self.begin
            .checked_add(self.size)
            .unwrap_or(Addr::new(u64::MAX))
    }

    /// Whether `pc` lies in `[begin, begin + size]`
    #[must_use]
    pub fn covers(&self, pc: Addr) -> bool {
        self.begin <= pc && pc <= self.end()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FrameIndex {
    cies: Vec<Cie>,
    fdes: Vec<Fde>,
    bias: Addr,
}

impl FrameIndex {
    /// Parses the `.debug_frame` section (or `.zdebug_frame`) of `obj`
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::MissingSection`] if the section is absent, or
    /// [`DebuggerError::DwarfParse`] if it is malformed.
    pub fn build(obj: &object::File<'_>, bias: Addr) -> Result<Self> {
        let data = require_section(obj, ".debug_frame")?;
        Self::parse(&data, bias)
    }

    /// Parses raw `.debug_frame` data, relocating FDE ranges by `bias`
    ///
    /// Parsing ends when less than a length field is left.
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::DwarfParse`] on truncated entries, 64 bit DWARF, or an FDE
    /// before any CIE.
    pub fn parse(data: &[u8], bias: Addr) -> Result<Self> {
        let mut index = FrameIndex {
            bias,
            ..Default::default()
        };
        let mut rd = ByteReader::new(data);

        while rd.remaining() >= 4 {
            let at = rd.position();
            let length = rd.u32()?;
            if length == DWARF64_ESCAPE {
                return Err(DebuggerError::DwarfParse(format!(
                    "64 bit call frame information at offset {at:#x} is not supported"
                )));
            }
            if length == 0 {
                trace!("zero terminator at {at:#x}");
                continue;
            }
            let body = rd.bytes(length as usize).map_err(|_| {
                DebuggerError::DwarfParse(format!("truncated frame entry at offset {at:#x}"))
            })?;
            index.parse_entry(body, at)?;
        }

        debug!(
            "parsed {} CIEs and {} FDEs from .debug_frame",
            index.cies.len(),
            index.fdes.len()
        );
        Ok(index)
    }

    fn parse_entry(&mut self, body: &[u8], at: usize) -> Result<()> {
        let malformed = |e: DebuggerError| {
            DebuggerError::DwarfParse(format!("bad frame entry at offset {at:#x}: {e}"))
        };
        let mut rd = ByteReader::new(body);
        let id = rd.u32().map_err(malformed)?;

        if id == CIE_ID {
            let cie = parse_cie(&mut rd).map_err(malformed)?;
            trace!("CIE at {at:#x}: {cie:?}");
            self.cies.push(cie);
            return Ok(());
        }

        if self.cies.is_empty() {
            return Err(DebuggerError::DwarfParse(format!(
                "FDE at offset {at:#x} comes before any CIE"
            )));
        }
        let begin = rd.u64().map_err(malformed)?;
        let size = rd.u64().map_err(malformed)?;
        let begin = self
            .bias
            .checked_add(begin)
            .filter(|b| b.checked_add(size).is_some())
            .ok_or_else(|| {
                DebuggerError::DwarfParse(format!(
                    "FDE at offset {at:#x} with range {begin:#x} + {size:#x} overflows"
                ))
            })?;
        let fde = Fde {
            begin,
            size,
            instructions: rd.rest().to_vec(),
            cie: self.cies.len() - 1,
        };
        trace!("FDE at {at:#x}: [{}, {}]", fde.begin, fde.end());
        self.fdes.push(fde);
        Ok(())
    }

    #[must_use]
    pub fn cies(&self) -> &[Cie] {
        &self.cies
    }

    #[must_use]
    pub fn fdes(&self) -> &[Fde] {
        &self.fdes
    }

    /// The load bias the FDE ranges were relocated by
    #[must_use]
    pub fn bias(&self) -> Addr {
        self.bias
    }

    /// The single FDE covering `pc`, and its CIE
    ///
    /// Ranges are closed, so the end of one FDE can touch the begin of the next. In that case
    /// the FDE that `pc` is strictly inside of wins.
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::NoCoveringFrame`] if no FDE covers `pc` and with
    /// [`DebuggerError::AmbiguousFrame`] if more than one does.
    pub fn covering(&self, pc: Addr) -> Result<(&Fde, &Cie)> {
        let mut candidates: Vec<&Fde> = self.fdes.iter().filter(|f| f.covers(pc)).collect();
        if candidates.len() > 1 {
            candidates.retain(|f| pc < f.end());
        }
        match candidates.as_slice() {
            [] => Err(DebuggerError::NoCoveringFrame(pc)),
            [fde] => Ok((fde, &self.cies[fde.cie])),
            _ => Err(DebuggerError::AmbiguousFrame(pc)),
        }
    }
}

fn parse_cie(rd: &mut ByteReader<'_>) -> Result<Cie> {
    let version = rd.u8()?;
    let augmentation = String::from_utf8_lossy(rd.cstr()?).to_string();
    if version >= 4 {
        let address_size = rd.u8()?;
        let _segment_size = rd.u8()?;
        if address_size != 8 {
            return Err(DebuggerError::DwarfParse(format!(
                "address size {address_size} is not supported"
            )));
        }
    }
    let code_alignment = rd.uleb128()?;
    let data_alignment = rd.sleb128()?;
    let return_address_register = if version == 1 {
        u64::from(rd.u8()?)
    } else {
        rd.uleb128()?
    };
    let return_address_register = u16::try_from(return_address_register).map_err(|_| {
        DebuggerError::DwarfParse(format!(
            "return address register {return_address_register} is out of range"
        ))
    })?;
    Ok(Cie {
        version,
        augmentation,
        code_alignment,
        data_alignment,
        return_address_register,
        initial_instructions: rd.rest().to_vec(),
    })
}
