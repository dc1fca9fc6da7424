//! # DWARF Parse Module
//!
//! Builds the [`DebugInfoIndex`] from the `.debug_*` sections of an executable with [`gimli`].
//!
//! Every unit is walked depth first. The root entry of a unit opens a [`CompileUnit`] and the
//! line number program of the unit is drained into the source map right away. Subprograms
//! become [`Function`]s, variables and parameters are attached to the innermost subprogram
//! whose subtree they are in, or to the unit if there is none. Base types, structures and
//! the like feed the type table.

use std::collections::HashMap;
use std::rc::Rc;

use gimli::{AttributeValue, DebuggingInformationEntry, Reader, Unit};
use tracing::{debug, info, trace, warn};

use crate::addr::Addr;
use crate::dbginfo::{CompileUnit, DebugInfoIndex, Function, TypeEntry, VariableEntry};
use crate::errors::{DebuggerError, Result};
use crate::section::{load_section, require_section};

pub(crate) type GimliReader = gimli::EndianReader<gimli::LittleEndian, Rc<[u8]>>;

/// The entries of a unit the index cares about
#[derive(Debug)]
enum DwarfEntry {
    CompileUnit(CompileUnit),
    Subprogram(Function),
    Variable(VariableEntry),
    Type { offset: u64, entry: TypeEntry },
    Other,
}

impl DebugInfoIndex {
    /// Builds the index of `obj`, relocating every address by `bias`
    ///
    /// # Errors
    ///
    /// Fails with [`DebuggerError::MissingSection`] if `.debug_info` or `.debug_line` is
    /// missing (in either form), and with [`DebuggerError::Gimli`] or
    /// [`DebuggerError::DwarfParse`] on malformed DWARF.
    pub fn build(obj: &object::File<'_>, bias: Addr) -> Result<Self> {
        let mut required = HashMap::new();
        for name in [".debug_info", ".debug_line"] {
            required.insert(name, require_section(obj, name)?);
        }

        let loader = |section: gimli::SectionId| -> Result<GimliReader> {
            let data = match required.get(section.name()) {
                Some(data) => data.clone(),
                None => load_section(obj, section.name())?.unwrap_or_default(),
            };
            Ok(gimli::EndianReader::new(
                Rc::from(data.as_slice()),
                gimli::LittleEndian,
            ))
        };
        let dwarf = gimli::Dwarf::load(loader)?;

        let mut index = DebugInfoIndex::empty();
        let mut headers = dwarf.units();
        while let Some(header) = headers.next()? {
            let unit = dwarf.unit(header)?;
            index_unit(&mut index, &dwarf, &unit, bias)?;
        }
        info!(
            "indexed {} units, {} functions, {} source files",
            index.units().len(),
            index.functions().len(),
            index.sources().len()
        );
        Ok(index)
    }
}

fn index_unit(
    index: &mut DebugInfoIndex,
    dwarf: &gimli::Dwarf<GimliReader>,
    unit: &Unit<GimliReader>,
    bias: Addr,
) -> Result<()> {
    let mut unit_idx: Option<usize> = None;
    // innermost open subprograms and the depth of their entries
    let mut open_functions: Vec<(usize, isize)> = Vec::new();
    let mut depth: isize = 0;

    let mut cursor = unit.entries();
    while let Some((delta, entry)) = cursor.next_dfs()? {
        depth += delta;
        while open_functions.last().is_some_and(|(_, d)| *d >= depth) {
            open_functions.pop();
        }

        if unit_idx.is_none() {
            let cu = match decode_entry(dwarf, unit, entry, bias)? {
                DwarfEntry::CompileUnit(cu) => cu,
                other => {
                    warn!("unit does not start with a compile unit entry: {other:?}");
                    CompileUnit::default()
                }
            };
            trace!("compile unit {:?}", cu.name);
            let idx = index.add_unit(cu);
            unit_idx = Some(idx);
            drain_line_program(index, dwarf, unit, bias)?;
            continue;
        }
        let Some(cu) = unit_idx else { continue };

        match decode_entry(dwarf, unit, entry, bias)? {
            DwarfEntry::Subprogram(mut function) => {
                function.unit = cu;
                let idx = index.add_function(function);
                open_functions.push((idx, depth));
            }
            DwarfEntry::Variable(variable) => match open_functions.last() {
                Some((f, _)) => index.add_variable(*f, variable),
                None => index.add_global(cu, variable),
            },
            DwarfEntry::Type { offset, entry } => index.add_type(offset, entry),
            DwarfEntry::CompileUnit(_) => {
                return Err(DebuggerError::DwarfParse(
                    "nested compile unit entry".to_string(),
                ))
            }
            DwarfEntry::Other => (),
        }
    }
    Ok(())
}

fn decode_entry(
    dwarf: &gimli::Dwarf<GimliReader>,
    unit: &Unit<GimliReader>,
    entry: &DebuggingInformationEntry<GimliReader>,
    bias: Addr,
) -> Result<DwarfEntry> {
    let decoded = match entry.tag() {
        gimli::DW_TAG_compile_unit | gimli::DW_TAG_partial_unit => {
            DwarfEntry::CompileUnit(CompileUnit {
                name: attr_string(dwarf, unit, entry, gimli::DW_AT_name)?,
                comp_dir: attr_string(dwarf, unit, entry, gimli::DW_AT_comp_dir)?,
                ..Default::default()
            })
        }
        gimli::DW_TAG_subprogram => DwarfEntry::Subprogram(decode_subprogram(dwarf, unit, entry, bias)?),
        gimli::DW_TAG_variable | gimli::DW_TAG_formal_parameter => {
            let Some(name) = attr_string(dwarf, unit, entry, gimli::DW_AT_name)? else {
                return Ok(DwarfEntry::Other);
            };
            DwarfEntry::Variable(VariableEntry {
                name,
                location: attr_expression(entry, gimli::DW_AT_location)?,
                type_offset: attr_type(unit, entry)?,
            })
        }
        gimli::DW_TAG_base_type
        | gimli::DW_TAG_structure_type
        | gimli::DW_TAG_union_type
        | gimli::DW_TAG_enumeration_type
        | gimli::DW_TAG_pointer_type
        | gimli::DW_TAG_typedef => {
            let Some(offset) = entry.offset().to_debug_info_offset(&unit.header) else {
                return Ok(DwarfEntry::Other);
            };
            let byte_size = match entry.attr_value(gimli::DW_AT_byte_size)? {
                Some(v) => v.udata_value(),
                None if entry.tag() == gimli::DW_TAG_pointer_type => {
                    Some(u64::from(unit.encoding().address_size))
                }
                None => None,
            };
            DwarfEntry::Type {
                offset: offset.0 as u64,
                entry: TypeEntry {
                    name: attr_string(dwarf, unit, entry, gimli::DW_AT_name)?,
                    byte_size,
                },
            }
        }
        _ => DwarfEntry::Other,
    };
    Ok(decoded)
}

fn decode_subprogram(
    dwarf: &gimli::Dwarf<GimliReader>,
    unit: &Unit<GimliReader>,
    entry: &DebuggingInformationEntry<GimliReader>,
    bias: Addr,
) -> Result<Function> {
    let mut function = Function::default();
    let mut low: Option<u64> = None;
    let mut high: Option<AttributeValue<GimliReader>> = None;

    let mut attrs = entry.attrs();
    while let Some(attr) = attrs.next()? {
        match attr.name() {
            gimli::DW_AT_name => {
                function.name = dwarf
                    .attr_string(unit, attr.value())?
                    .to_string_lossy()?
                    .into_owned();
            }
            gimli::DW_AT_low_pc => low = dwarf.attr_address(unit, attr.value())?,
            gimli::DW_AT_high_pc => high = Some(attr.value()),
            gimli::DW_AT_frame_base => {
                if let AttributeValue::Exprloc(expr) = attr.value() {
                    function.frame_base = expr.0.to_slice()?.into_owned();
                }
            }
            gimli::DW_AT_decl_file => {
                function.decl_file = attr.udata_value().unwrap_or_default();
            }
            gimli::DW_AT_external => {
                function.external = matches!(attr.value(), AttributeValue::Flag(true));
            }
            _ => (),
        }
    }

    if let Some(low) = low {
        let high = match high {
            Some(AttributeValue::Addr(a)) => a,
            Some(v @ AttributeValue::DebugAddrIndex(_)) => {
                dwarf.attr_address(unit, v)?.unwrap_or(low)
            }
            // any constant form is an offset from the low pc
            Some(v) => {
                let size = v.udata_value().unwrap_or_default();
                low.checked_add(size).ok_or_else(|| {
                    DebuggerError::DwarfParse(format!(
                        "function {} at {low:#x} with size {size:#x} overflows",
                        function.name
                    ))
                })?
            }
            None => low,
        };
        if high < low {
            return Err(DebuggerError::DwarfParse(format!(
                "function {} ends before it starts",
                function.name
            )));
        }
        function.low_pc = relocate(bias, low)?;
        function.high_pc = relocate(bias, high)?;
    }
    Ok(function)
}

fn attr_string(
    dwarf: &gimli::Dwarf<GimliReader>,
    unit: &Unit<GimliReader>,
    entry: &DebuggingInformationEntry<GimliReader>,
    name: gimli::DwAt,
) -> Result<Option<String>> {
    Ok(match entry.attr_value(name)? {
        Some(v) => Some(dwarf.attr_string(unit, v)?.to_string_lossy()?.into_owned()),
        None => None,
    })
}

fn attr_expression(
    entry: &DebuggingInformationEntry<GimliReader>,
    name: gimli::DwAt,
) -> Result<Vec<u8>> {
    Ok(match entry.attr_value(name)? {
        Some(AttributeValue::Exprloc(expr)) => expr.0.to_slice()?.into_owned(),
        Some(other) => {
            trace!("location is not a single expression: {other:?}");
            Vec::new()
        }
        None => Vec::new(),
    })
}

fn attr_type(
    unit: &Unit<GimliReader>,
    entry: &DebuggingInformationEntry<GimliReader>,
) -> Result<Option<u64>> {
    Ok(match entry.attr_value(gimli::DW_AT_type)? {
        Some(AttributeValue::UnitRef(off)) => off
            .to_debug_info_offset(&unit.header)
            .map(|o| o.0 as u64),
        Some(AttributeValue::DebugInfoRef(off)) => Some(off.0 as u64),
        _ => None,
    })
}

fn relocate(bias: Addr, address: u64) -> Result<Addr> {
    bias.checked_add(address).ok_or_else(|| {
        DebuggerError::DwarfParse(format!("address {address:#x} + bias {bias} overflows"))
    })
}

/// Feeds every row of the line program of `unit` into the index
fn drain_line_program(
    index: &mut DebugInfoIndex,
    dwarf: &gimli::Dwarf<GimliReader>,
    unit: &Unit<GimliReader>,
    bias: Addr,
) -> Result<()> {
    let Some(program) = unit.line_program.clone() else {
        debug!("unit without line program");
        return Ok(());
    };

    let mut paths: HashMap<u64, String> = HashMap::new();
    let mut sequence_start: Option<u64> = None;
    let mut rows = program.rows();
    while let Some((header, row)) = rows.next_row()? {
        if row.end_sequence() {
            if let Some(start) = sequence_start.take() {
                index.add_sequence(relocate(bias, start)?, relocate(bias, row.address())?);
            }
            continue;
        }
        if sequence_start.is_none() {
            sequence_start = Some(row.address());
        }
        let Some(line) = row.line() else { continue };

        let path = match paths.get(&row.file_index()) {
            Some(p) => p.clone(),
            None => {
                let Some(file) = row.file(header) else { continue };
                let p = render_file(dwarf, unit, file, header)?;
                paths.insert(row.file_index(), p.clone());
                p
            }
        };
        let address = relocate(bias, row.address())?;
        index.add_line_record(&path, line.get(), address, row.prologue_end());
    }
    Ok(())
}

/// Joins the compilation directory, the include directory and the file name of a line
/// program file entry
fn render_file(
    dwarf: &gimli::Dwarf<GimliReader>,
    unit: &Unit<GimliReader>,
    file: &gimli::FileEntry<GimliReader>,
    header: &gimli::LineProgramHeader<GimliReader>,
) -> Result<String> {
    let mut path = match unit.comp_dir {
        Some(ref comp_dir) => comp_dir.to_string_lossy()?.into_owned(),
        None => String::new(),
    };

    // the first directory entry of DWARF 5 is the compilation directory itself
    if file.directory_index() != 0 || header.version() < 5 {
        if let Some(directory) = file.directory(header) {
            push_path(
                &mut path,
                dwarf.attr_string(unit, directory)?.to_string_lossy()?.as_ref(),
            );
        }
    }

    push_path(
        &mut path,
        dwarf
            .attr_string(unit, file.path_name())?
            .to_string_lossy()?
            .as_ref(),
    );
    Ok(path)
}

fn push_path(path: &mut String, part: &str) {
    if part.starts_with('/') || path.is_empty() {
        *path = part.to_string();
    } else {
        if !path.ends_with('/') {
            path.push('/');
        }
        path.push_str(part);
    }
}
