//! # Disassembly Module
//!
//! Turns machine code of the debuggee into readable assembly with [`iced_x86`].
//!
//! A [`Disassembly`] is made from bytes that were read out of the debuggee with the `int3` of
//! every armed breakpoint already replaced by the original byte, so it shows the code of the
//! program and not the patches of the debugger. Each instruction remembers whether it has a
//! breakpoint and, once [annotated](Disassembly::annotate), the source line it belongs to.

use std::fmt::{Display, Write};

use iced_x86::{
    Decoder, DecoderOptions, FlowControl, Formatter, FormatterOutput, FormatterTextKind,
    Instruction, NasmFormatter,
};

use crate::addr::Addr;
use crate::dbginfo::{DebugInfoIndex, SourceLocation};
use crate::errors::{DebuggerError, Result};

const CODE_BITNESS: u32 = 64;
/// Longest possible x86-64 instruction
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// A piece of text and its kind (mnemonic, register, number, ...)
///
/// A [`crate::ui::DebuggerUI`] can use the kind to color the disassembly.
pub type TextContent = (String, FormatterTextKind);

struct DisassemblyOutput(Vec<TextContent>);

impl FormatterOutput for DisassemblyOutput {
    fn write(&mut self, text: &str, kind: FormatterTextKind) {
        self.0.push((text.to_string(), kind));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisassembledInstruction {
    pub addr: Addr,
    pub raw: Vec<u8>,
    pub content: Vec<TextContent>,
    pub has_bp: bool,
    pub location: Option<SourceLocation>,
}

impl DisassembledInstruction {
    #[must_use]
    pub fn text(&self) -> String {
        self.content.iter().map(|(t, _)| t.as_str()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Disassembly {
    vec: Vec<DisassembledInstruction>,
    current: Option<Addr>,
}

/// What the step engine needs to know about the instruction at some address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionInfo {
    pub len: usize,
    pub is_call: bool,
}

impl InstructionInfo {
    /// Decodes the first instruction of `data`, which was read from `addr`
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::Decode`] if the bytes are no valid instruction.
    pub fn decode(data: &[u8], addr: Addr) -> Result<Self> {
        let mut decoder = Decoder::with_ip(CODE_BITNESS, data, addr.u64(), DecoderOptions::NONE);
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(DebuggerError::Decode(addr));
        }
        Ok(Self {
            len: instruction.len(),
            is_call: matches!(
                instruction.flow_control(),
                FlowControl::Call | FlowControl::IndirectCall
            ),
        })
    }
}

fn formatter() -> NasmFormatter {
    let mut formatter = NasmFormatter::new();

    // padding
    formatter.options_mut().set_first_operand_char_index(10);

    // numbers stuff
    formatter.options_mut().set_hex_suffix("");
    formatter.options_mut().set_hex_prefix("0x");
    formatter.options_mut().set_uppercase_hex(false);
    formatter.options_mut().set_decimal_suffix("");
    formatter.options_mut().set_decimal_prefix("");

    // memory stuff
    formatter.options_mut().set_show_symbol_address(true);
    formatter.options_mut().set_rip_relative_addresses(false);
    formatter
        .options_mut()
        .set_memory_size_options(iced_x86::MemorySizeOptions::Always);
    formatter
}

impl Disassembly {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Decodes all of `data`, which starts at `first_addr`
    ///
    /// `bp_addrs` are the addresses that have an armed breakpoint.
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::Decode`] at the first invalid instruction, the rest of the
    /// range can not be trusted after that.
    pub fn disassemble(data: &[u8], first_addr: Addr, bp_addrs: &[Addr]) -> Result<Self> {
        let mut decoder =
            Decoder::with_ip(CODE_BITNESS, data, first_addr.u64(), DecoderOptions::NONE);
        let mut formatter = formatter();

        let mut disassembly = Self::empty();
        let mut instruction = Instruction::default();
        while decoder.can_decode() {
            decoder.decode_out(&mut instruction);
            let addr = Addr::from(instruction.ip());
            if instruction.is_invalid() {
                return Err(DebuggerError::Decode(addr));
            }
            let mut text = DisassemblyOutput(Vec::new());
            formatter.format(&instruction, &mut text);

            let start = (instruction.ip() - first_addr.u64()) as usize;
            disassembly.vec.push(DisassembledInstruction {
                addr,
                raw: data[start..start + instruction.len()].to_vec(),
                content: text.0,
                has_bp: bp_addrs.contains(&addr),
                location: None,
            });
        }

        Ok(disassembly)
    }

    #[must_use]
    pub fn inner(&self) -> &[DisassembledInstruction] {
        &self.vec
    }

    /// Looks up the source line of every instruction
    pub fn annotate(&mut self, index: &DebugInfoIndex) {
        for instruction in &mut self.vec {
            instruction.location = index.resolve_address(instruction.addr).ok();
        }
    }

    /// Marks the instruction the debuggee is stopped at
    pub fn mark_current(&mut self, pc: Addr) {
        self.current = Some(pc);
    }
}

impl Display for Disassembly {
    /// ```text
    ///      main.c:4       0x0000000000401126 55                         push      rbp
    /// .===> main.c:5      0x000000000040112a c7 45 fc 14 00 00 00       mov       dword [rbp-0x4],0x14
    /// ```
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut bytes = String::new();
        for (i, instruction) in self.vec.iter().enumerate() {
            let next = self.vec.get(i + 1).map(|n| n.addr);
            let is_current = self.current.is_some_and(|pc| {
                instruction.addr <= pc && next.map_or(pc == instruction.addr, |n| pc < n)
            });

            write!(f, "{}", if instruction.has_bp { "." } else { " " })?;
            write!(f, "{}", if is_current { "===> " } else { "     " })?;

            let location = match &instruction.location {
                Some(loc) => {
                    let file = std::path::Path::new(&loc.file)
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    format!("{file}:{}", loc.line)
                }
                None => "??".to_string(),
            };
            write!(f, "{location:<16}{} ", instruction.addr)?;

            bytes.clear();
            for byte in &instruction.raw {
                write!(bytes, "{byte:02x} ")?;
            }
            write!(f, "{bytes:<27}")?;
            for (thing, _kind) in &instruction.content {
                write!(f, "{thing}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
