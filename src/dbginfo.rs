//! # Debug Info Module
//!
//! The queryable model of the DWARF information of the debuggee: compile units, functions with
//! their local variables, and the mapping between source lines and addresses.
//!
//! [`DebugInfoIndex`] is filled once, by [`DebugInfoIndex::build`](crate::dwarf_parse), and
//! is not changed afterwards. All addresses in it are already relocated by the load bias of
//! the debuggee.

use std::cell::OnceCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;

use tracing::{debug, trace};

use crate::addr::Addr;
use crate::errors::{DebuggerError, Result};

/// One row of a line table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRecord {
    pub addr: Addr,
    /// The compiler marked this address as the first one after the function prologue
    pub prologue_end: bool,
}

/// file path → line number → rows of the line table for that line
///
/// The rows of one line are kept in line program order, not sorted by address.
pub type SourceMap = BTreeMap<String, BTreeMap<u64, Vec<LineRecord>>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    pub file: String,
    pub line: u64,
}

impl Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// A `DW_TAG_variable` or `DW_TAG_formal_parameter`, kept mostly raw
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableEntry {
    pub name: String,
    /// The `DW_AT_location` expression, empty if it was missing or a location list
    pub location: Vec<u8>,
    /// Section offset of the DIE of the type of this variable
    pub type_offset: Option<u64>,
}

/// What the `print` command needs to know about a type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeEntry {
    pub name: Option<String>,
    pub byte_size: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    pub low_pc: Addr,
    /// First address after the function
    pub high_pc: Addr,
    /// The `DW_AT_frame_base` expression
    pub frame_base: Vec<u8>,
    pub decl_file: u64,
    pub external: bool,
    /// Index of the owning compile unit in [`DebugInfoIndex::units`]
    pub unit: usize,
    pub variables: Vec<VariableEntry>,
}

impl Function {
    #[inline]
    #[must_use]
    pub fn contains(&self, pc: Addr) -> bool {
        self.low_pc <= pc && pc < self.high_pc
    }

    /// The name, demangled if it is a mangled Rust or C++ symbol
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{:#}", rustc_demangle::demangle(&self.name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileUnit {
    pub name: Option<String>,
    pub comp_dir: Option<String>,
    /// Indexes into [`DebugInfoIndex::functions`]
    pub functions: Vec<usize>,
    /// Variables declared outside of any function
    pub globals: Vec<VariableEntry>,
}

/// A line table row in address order
#[derive(Debug, Clone, Copy)]
struct AddrRow {
    addr: Addr,
    file: usize,
    line: u64,
    prologue_end: bool,
}

#[derive(Debug, Default)]
pub struct DebugInfoIndex {
    sources: SourceMap,
    functions: Vec<Function>,
    units: Vec<CompileUnit>,
    types: HashMap<u64, TypeEntry>,
    sequences: Vec<(Addr, Addr)>,

    files: Vec<String>,
    file_ids: HashMap<String, usize>,
    rows: Vec<AddrRow>,
    by_addr: OnceCell<Vec<AddrRow>>,
}

impl DebugInfoIndex {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registers a new compile unit and returns its index
    pub fn add_unit(&mut self, unit: CompileUnit) -> usize {
        self.units.push(unit);
        self.units.len() - 1
    }

    /// Registers a function with the unit given in [`Function::unit`] and returns its index
    ///
    /// # Panics
    ///
    /// Panics if the unit of the function was not added before.
    pub fn add_function(&mut self, function: Function) -> usize {
        let idx = self.functions.len();
        self.units[function.unit].functions.push(idx);
        trace!(
            "function {} [{}, {}) in unit {}",
            function.name,
            function.low_pc,
            function.high_pc,
            function.unit
        );
        self.functions.push(function);
        idx
    }

    pub fn add_variable(&mut self, function: usize, variable: VariableEntry) {
        self.functions[function].variables.push(variable);
    }

    pub fn add_global(&mut self, unit: usize, variable: VariableEntry) {
        self.units[unit].globals.push(variable);
    }

    pub fn add_type(&mut self, offset: u64, entry: TypeEntry) {
        self.types.insert(offset, entry);
    }

    /// Records one line table row
    pub fn add_line_record(&mut self, file: &str, line: u64, addr: Addr, prologue_end: bool) {
        let file_id = match self.file_ids.get(file) {
            Some(id) => *id,
            None => {
                self.files.push(file.to_string());
                self.file_ids.insert(file.to_string(), self.files.len() - 1);
                self.files.len() - 1
            }
        };
        self.sources
            .entry(file.to_string())
            .or_default()
            .entry(line)
            .or_default()
            .push(LineRecord { addr, prologue_end });
        self.rows.push(AddrRow {
            addr,
            file: file_id,
            line,
            prologue_end,
        });
        self.by_addr = OnceCell::new();
    }

    /// Records the address range `[start, end)` of one line table sequence
    pub fn add_sequence(&mut self, start: Addr, end: Addr) {
        self.sequences.push((start, end));
    }

    #[must_use]
    pub fn sources(&self) -> &SourceMap {
        &self.sources
    }

    #[must_use]
    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    #[must_use]
    pub fn units(&self) -> &[CompileUnit] {
        &self.units
    }

    #[must_use]
    pub fn type_entry(&self, offset: u64) -> Option<&TypeEntry> {
        self.types.get(&offset)
    }

    /// Finds the key under which `file` is stored in the source map
    ///
    /// `file` may be the stored path itself, a path relative to the current directory, or a
    /// suffix of exactly one stored path.
    #[must_use]
    pub fn resolve_file(&self, file: &str) -> Option<&str> {
        if let Some((k, _)) = self.sources.get_key_value(file) {
            return Some(k);
        }
        if let Ok(cwd) = std::env::current_dir() {
            let joined = cwd.join(file);
            if let Some((k, _)) = self.sources.get_key_value(joined.to_string_lossy().as_ref()) {
                return Some(k);
            }
        }
        let suffix = format!("/{}", file.trim_start_matches("./"));
        let mut candidates = self.sources.keys().filter(|k| k.ends_with(&suffix));
        match (candidates.next(), candidates.next()) {
            (Some(k), None) => Some(k),
            (Some(_), Some(_)) => {
                debug!("{file} is ambiguous");
                None
            }
            _ => None,
        }
    }

    fn records(&self, file: &str, line: u64) -> Result<&[LineRecord]> {
        self.resolve_file(file)
            .and_then(|f| self.sources.get(f))
            .and_then(|lines| lines.get(&line))
            .filter(|records| !records.is_empty())
            .map(Vec::as_slice)
            .ok_or_else(|| DebuggerError::NoSuchSourceLine(file.to_string(), line))
    }

    /// The first address the line table lists for `file:line`
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::NoSuchSourceLine`] if the line has no rows.
    pub fn lookup_line_address(&self, file: &str, line: u64) -> Result<Addr> {
        Ok(self.records(file, line)?[0].addr)
    }

    /// The address a breakpoint on `file:line` traps at
    ///
    /// Prefers the row marked as prologue end, so the function prologue has set up the frame
    /// when the breakpoint is hit. Without such a row the lowest address of the line is used.
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::NoSuchSourceLine`] if the line has no rows.
    pub fn lookup_breakpoint_address(&self, file: &str, line: u64) -> Result<Addr> {
        let records = self.records(file, line)?;
        if let Some(r) = records.iter().find(|r| r.prologue_end) {
            return Ok(r.addr);
        }
        records
            .iter()
            .map(|r| r.addr)
            .min()
            .filter(|a| !a.is_null())
            .ok_or_else(|| DebuggerError::NoSuchSourceLine(file.to_string(), line))
    }

    /// The function whose `[low_pc, high_pc)` contains `pc`
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::NoSuchFunction`] if there is none.
    pub fn function_containing(&self, pc: Addr) -> Result<&Function> {
        self.functions
            .iter()
            .find(|f| f.contains(pc))
            .ok_or(DebuggerError::NoSuchFunction(pc))
    }

    /// All functions with a low pc that are called `name`
    #[must_use]
    pub fn functions_named(&self, name: &str) -> Vec<&Function> {
        self.functions
            .iter()
            .filter(|f| !f.low_pc.is_null() && (f.name == name || f.display_name() == name))
            .collect()
    }

    /// The source line a breakpoint on `function` should use: the line of the first address
    /// the compiler marked as the end of the prologue, else the line of the low pc
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::NoLineInfo`] if nothing in the function has line info.
    pub fn function_entry(&self, function: &Function) -> Result<SourceLocation> {
        let after_prologue = self
            .sources
            .iter()
            .flat_map(|(file, lines)| {
                lines.iter().flat_map(move |(line, records)| {
                    records.iter().map(move |r| (r, file, *line))
                })
            })
            .filter(|(r, _, _)| r.prologue_end && function.contains(r.addr))
            .min_by_key(|(r, _, _)| r.addr);
        match after_prologue {
            Some((_, file, line)) => Ok(SourceLocation {
                file: file.clone(),
                line,
            }),
            None => self.resolve_address(function.low_pc),
        }
    }

    fn rows_by_addr(&self) -> &[AddrRow] {
        self.by_addr.get_or_init(|| {
            let mut rows = self.rows.clone();
            // the row sorted last wins among rows with the same address
            rows.sort_by_key(|r| (r.addr, r.prologue_end, std::cmp::Reverse(r.line)));
            rows
        })
    }

    /// Maps an address to the source line it belongs to
    ///
    /// An address listed in the line table maps to its own row. Any other address maps to the
    /// nearest row below it, so every address of a function body belongs to the last line
    /// that started before it.
    ///
    /// When several rows share an address, a row marked as prologue end is preferred, since
    /// that is the row a line breakpoint is placed on. Otherwise the lowest line wins.
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::NoLineInfo`] if `pc` lies outside of every line table
    /// sequence.
    pub fn resolve_address(&self, pc: Addr) -> Result<SourceLocation> {
        if !self.sequences.is_empty() && !self.sequences.iter().any(|(s, e)| *s <= pc && pc < *e)
        {
            return Err(DebuggerError::NoLineInfo(pc));
        }
        let rows = self.rows_by_addr();
        let idx = rows.partition_point(|r| r.addr <= pc);
        if idx == 0 {
            return Err(DebuggerError::NoLineInfo(pc));
        }
        let row = rows[idx - 1];
        Ok(SourceLocation {
            file: self.files[row.file].clone(),
            line: row.line,
        })
    }

    /// Finds a variable visible at `pc`: locals of the containing function first, then the
    /// globals of its compile unit
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::UnknownVariable`] if nothing is called `name`.
    pub fn variable_in_scope(&self, pc: Addr, name: &str) -> Result<(&VariableEntry, Option<&Function>)> {
        let function = self.function_containing(pc).ok();
        if let Some(f) = function {
            if let Some(v) = f.variables.iter().rev().find(|v| v.name == name) {
                return Ok((v, Some(f)));
            }
            if let Some(v) = self.units[f.unit].globals.iter().find(|v| v.name == name) {
                return Ok((v, Some(f)));
            }
        }
        self.units
            .iter()
            .flat_map(|u| u.globals.iter())
            .find(|v| v.name == name)
            .map(|v| (v, function))
            .ok_or_else(|| DebuggerError::UnknownVariable(name.to_string()))
    }
}
