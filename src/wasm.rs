//! Definitions for the parts of the wasm binary format the linker works with, and a read-only
//! view over a parsed wasm object file: signatures, imports, exports, globals, segments, raw code
//! bytes and the relocations attached to them.

use crate::error::Result;
use crate::leb;
use anyhow::bail;
use anyhow::Context;

pub(crate) const MAGIC: [u8; 4] = *b"\0asm";
pub(crate) const VERSION: u32 = 1;

/// The unit of linear-memory growth.
pub(crate) const PAGE_SIZE: u32 = 65536;

/// Section type codes.
pub(crate) const SEC_CUSTOM: u8 = 0;
pub(crate) const SEC_TYPE: u8 = 1;
pub(crate) const SEC_IMPORT: u8 = 2;
pub(crate) const SEC_FUNCTION: u8 = 3;
pub(crate) const SEC_TABLE: u8 = 4;
pub(crate) const SEC_MEMORY: u8 = 5;
pub(crate) const SEC_GLOBAL: u8 = 6;
pub(crate) const SEC_EXPORT: u8 = 7;
pub(crate) const SEC_START: u8 = 8;
pub(crate) const SEC_ELEM: u8 = 9;
pub(crate) const SEC_CODE: u8 = 10;
pub(crate) const SEC_DATA: u8 = 11;

/// Value and constructed types, as the SLEB128 values that encode them.
pub(crate) const TYPE_I32: i64 = -0x01;
pub(crate) const TYPE_I64: i64 = -0x02;
pub(crate) const TYPE_F32: i64 = -0x03;
pub(crate) const TYPE_F64: i64 = -0x04;
pub(crate) const TYPE_ANYFUNC: i64 = -0x10;
pub(crate) const TYPE_FUNC: i64 = -0x20;

/// Import/export kinds.
pub(crate) const EXTERNAL_FUNCTION: u8 = 0;
pub(crate) const EXTERNAL_TABLE: u8 = 1;
pub(crate) const EXTERNAL_MEMORY: u8 = 2;
pub(crate) const EXTERNAL_GLOBAL: u8 = 3;

pub(crate) const LIMITS_HAS_MAX: u32 = 0x1;

pub(crate) const OPCODE_GET_GLOBAL: u8 = 0x23;
pub(crate) const OPCODE_I32_CONST: u8 = 0x41;
pub(crate) const OPCODE_I64_CONST: u8 = 0x42;
pub(crate) const OPCODE_END: u8 = 0x0b;

/// Subsection code for function names within the "name" custom section.
pub(crate) const NAMES_FUNCTION: u32 = 1;

/// Subsection code for symbol flags within the "linking" custom section.
pub(crate) const LINKING_SYMBOL_INFO: u32 = 2;
pub(crate) const SYMBOL_FLAG_WEAK: u32 = 0x1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RelocKind {
    FunctionIndexLeb,
    TableIndexSleb,
    TableIndexI32,
    GlobalAddrLeb,
    GlobalAddrSleb,
    GlobalAddrI32,
    TypeIndexLeb,
    GlobalIndexLeb,
}

impl RelocKind {
    pub(crate) fn from_code(code: u32) -> Result<RelocKind> {
        Ok(match code {
            0 => RelocKind::FunctionIndexLeb,
            1 => RelocKind::TableIndexSleb,
            2 => RelocKind::TableIndexI32,
            3 => RelocKind::GlobalAddrLeb,
            4 => RelocKind::GlobalAddrSleb,
            5 => RelocKind::GlobalAddrI32,
            6 => RelocKind::TypeIndexLeb,
            7 => RelocKind::GlobalIndexLeb,
            _ => bail!("unknown relocation type: {code}"),
        })
    }

    pub(crate) fn code(self) -> u32 {
        match self {
            RelocKind::FunctionIndexLeb => 0,
            RelocKind::TableIndexSleb => 1,
            RelocKind::TableIndexI32 => 2,
            RelocKind::GlobalAddrLeb => 3,
            RelocKind::GlobalAddrSleb => 4,
            RelocKind::GlobalAddrI32 => 5,
            RelocKind::TypeIndexLeb => 6,
            RelocKind::GlobalIndexLeb => 7,
        }
    }

    /// Whether relocation records of this kind carry an addend on the wire.
    pub(crate) fn has_addend(self) -> bool {
        matches!(
            self,
            RelocKind::GlobalAddrLeb | RelocKind::GlobalAddrSleb | RelocKind::GlobalAddrI32
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Signature {
    pub(crate) params: Vec<i64>,
    pub(crate) ret: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum InitExpr {
    I32Const(i32),
    I64Const(i64),
    GetGlobal(u32),
}

impl InitExpr {
    pub(crate) fn i32_value(self) -> Result<i32> {
        match self {
            InitExpr::I32Const(value) => Ok(value),
            _ => bail!("expected an i32.const initializer"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Limits {
    pub(crate) initial: u32,
    pub(crate) max: Option<u32>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Import<'data> {
    pub(crate) module: &'data str,
    pub(crate) field: &'data str,
    pub(crate) kind: ImportKind,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum ImportKind {
    Function { sig_index: u32 },
    Table { elem_type: i64, limits: Limits },
    Memory { limits: Limits },
    Global { value_type: i64, mutable: bool },
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Export<'data> {
    pub(crate) name: &'data str,
    pub(crate) kind: u8,
    pub(crate) index: u32,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Global {
    pub(crate) value_type: i64,
    pub(crate) mutable: bool,
    pub(crate) init: InitExpr,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Table {
    pub(crate) elem_type: i64,
    pub(crate) limits: Limits,
}

#[derive(Clone, Debug)]
pub(crate) struct ElemSegment {
    pub(crate) table_index: u32,
    pub(crate) offset: InitExpr,
    pub(crate) functions: Vec<u32>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct DataSegment<'data> {
    pub(crate) memory_index: u32,
    pub(crate) offset: InitExpr,
    pub(crate) data: &'data [u8],
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Relocation {
    pub(crate) kind: RelocKind,
    pub(crate) offset: u32,
    pub(crate) index: u32,
    pub(crate) addend: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WasmSymbolKind {
    FunctionImport,
    FunctionExport,
    GlobalImport,
    GlobalExport,
    DebugFunctionName,
}

impl WasmSymbolKind {
    pub(crate) fn is_function(self) -> bool {
        matches!(
            self,
            WasmSymbolKind::FunctionImport
                | WasmSymbolKind::FunctionExport
                | WasmSymbolKind::DebugFunctionName
        )
    }
}

/// An entity named by an input file: imports become undefined references, exports become
/// definitions and name-section entries carry debug names. `element_index` points into the
/// import vector, the export vector or the function index space respectively.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WasmSymbol<'data> {
    pub(crate) name: &'data str,
    pub(crate) kind: WasmSymbolKind,
    pub(crate) element_index: u32,
    pub(crate) weak: bool,
}

#[derive(Default)]
pub(crate) struct Module<'data> {
    pub(crate) signatures: Vec<Signature>,
    /// Signature index for each defined function, in function-section order.
    pub(crate) function_types: Vec<u32>,
    pub(crate) imports: Vec<Import<'data>>,
    pub(crate) exports: Vec<Export<'data>>,
    pub(crate) globals: Vec<Global>,
    pub(crate) tables: Vec<Table>,
    pub(crate) memories: Vec<Limits>,
    pub(crate) elements: Vec<ElemSegment>,
    pub(crate) data_segments: Vec<DataSegment<'data>>,
    /// Raw code section contents, starting with the function-count varint.
    pub(crate) code: Option<&'data [u8]>,
    pub(crate) code_relocations: Vec<Relocation>,
    pub(crate) data_relocations: Vec<Relocation>,
    pub(crate) symbols: Vec<WasmSymbol<'data>>,
    pub(crate) num_function_imports: u32,
    pub(crate) num_global_imports: u32,
}

impl<'data> Module<'data> {
    pub(crate) fn parse(data: &'data [u8]) -> Result<Module<'data>> {
        let mut reader = Reader::new(data);
        let magic = reader.read_bytes(4).context("file too short for wasm header")?;
        if magic != MAGIC {
            bail!("not a wasm file (bad magic)");
        }
        let version = reader.read_u32()?;
        if version != VERSION {
            bail!("unsupported wasm version: {version}");
        }

        let mut module = Module::default();
        let mut weak_names: Vec<(&'data str, u32)> = Vec::new();
        let mut function_names: Vec<(u32, &'data str)> = Vec::new();

        while !reader.done() {
            let id = reader.read_u8().context("truncated section header")?;
            let size = reader.read_uleb()?;
            let payload = reader.read_bytes(size as usize).with_context(|| {
                format!("section {id} claims {size} bytes beyond the end of the file")
            })?;
            let mut section = Reader::new(payload);
            match id {
                SEC_TYPE => module.parse_type_section(&mut section)?,
                SEC_IMPORT => module.parse_import_section(&mut section)?,
                SEC_FUNCTION => {
                    for _ in 0..section.read_uleb()? {
                        module.function_types.push(section.read_uleb()?);
                    }
                }
                SEC_TABLE => {
                    for _ in 0..section.read_uleb()? {
                        let elem_type = section.read_sleb()?;
                        let limits = read_limits(&mut section)?;
                        module.tables.push(Table { elem_type, limits });
                    }
                }
                SEC_MEMORY => {
                    for _ in 0..section.read_uleb()? {
                        module.memories.push(read_limits(&mut section)?);
                    }
                }
                SEC_GLOBAL => module.parse_global_section(&mut section)?,
                SEC_EXPORT => {
                    for _ in 0..section.read_uleb()? {
                        let name = section.read_str()?;
                        let kind = section.read_u8()?;
                        let index = section.read_uleb()?;
                        module.exports.push(Export { name, kind, index });
                    }
                }
                SEC_ELEM => module.parse_elem_section(&mut section)?,
                // Linker inputs don't carry start sections; nothing here consumes one.
                SEC_START => {}
                SEC_CODE => module.code = Some(payload),
                SEC_DATA => module.parse_data_section(&mut section)?,
                SEC_CUSTOM => {
                    let name = section.read_str().context("custom section name")?;
                    match name {
                        "linking" => parse_linking_section(&mut section, &mut weak_names)?,
                        "name" => parse_name_section(&mut section, &mut function_names)?,
                        _ if name.starts_with("reloc") => module.parse_reloc_section(&mut section)?,
                        _ => {}
                    }
                }
                _ => bail!("unknown section type: {id}"),
            }
        }

        module.build_symbols(&weak_names, &function_names);
        Ok(module)
    }

    fn parse_type_section(&mut self, section: &mut Reader<'data>) -> Result {
        for _ in 0..section.read_uleb()? {
            let form = section.read_sleb()?;
            if form != TYPE_FUNC {
                bail!("unsupported type form: {form}");
            }
            let mut params = Vec::new();
            for _ in 0..section.read_uleb()? {
                params.push(section.read_sleb()?);
            }
            let ret = match section.read_uleb()? {
                0 => None,
                1 => Some(section.read_sleb()?),
                n => bail!("unsupported result count: {n}"),
            };
            self.signatures.push(Signature { params, ret });
        }
        Ok(())
    }

    fn parse_import_section(&mut self, section: &mut Reader<'data>) -> Result {
        for _ in 0..section.read_uleb()? {
            let module = section.read_str()?;
            let field = section.read_str()?;
            let kind = match section.read_u8()? {
                EXTERNAL_FUNCTION => ImportKind::Function {
                    sig_index: section.read_uleb()?,
                },
                EXTERNAL_TABLE => ImportKind::Table {
                    elem_type: section.read_sleb()?,
                    limits: read_limits(section)?,
                },
                EXTERNAL_MEMORY => ImportKind::Memory {
                    limits: read_limits(section)?,
                },
                EXTERNAL_GLOBAL => ImportKind::Global {
                    value_type: section.read_sleb()?,
                    mutable: section.read_uleb()? != 0,
                },
                kind => bail!("unknown import kind: {kind}"),
            };
            self.imports.push(Import { module, field, kind });
        }
        Ok(())
    }

    fn parse_global_section(&mut self, section: &mut Reader<'data>) -> Result {
        for _ in 0..section.read_uleb()? {
            let value_type = section.read_sleb()?;
            let mutable = section.read_uleb()? != 0;
            let init = read_init_expr(section)?;
            self.globals.push(Global {
                value_type,
                mutable,
                init,
            });
        }
        Ok(())
    }

    fn parse_elem_section(&mut self, section: &mut Reader<'data>) -> Result {
        for _ in 0..section.read_uleb()? {
            let table_index = section.read_uleb()?;
            let offset = read_init_expr(section)?;
            let mut functions = Vec::new();
            for _ in 0..section.read_uleb()? {
                functions.push(section.read_uleb()?);
            }
            self.elements.push(ElemSegment {
                table_index,
                offset,
                functions,
            });
        }
        Ok(())
    }

    fn parse_data_section(&mut self, section: &mut Reader<'data>) -> Result {
        for _ in 0..section.read_uleb()? {
            let memory_index = section.read_uleb()?;
            let offset = read_init_expr(section)?;
            let size = section.read_uleb()?;
            let data = section.read_bytes(size as usize).context("data segment contents")?;
            self.data_segments.push(DataSegment {
                memory_index,
                offset,
                data,
            });
        }
        Ok(())
    }

    fn parse_reloc_section(&mut self, section: &mut Reader<'data>) -> Result {
        let target = section.read_uleb()?;
        let mut relocations = Vec::new();
        for _ in 0..section.read_uleb()? {
            let kind = RelocKind::from_code(section.read_uleb()?)?;
            let offset = section.read_uleb()?;
            let index = section.read_uleb()?;
            let addend = if kind.has_addend() { section.read_uleb()? } else { 0 };
            relocations.push(Relocation {
                kind,
                offset,
                index,
                addend,
            });
        }
        match target {
            target if target == u32::from(SEC_CODE) => self.code_relocations = relocations,
            target if target == u32::from(SEC_DATA) => self.data_relocations = relocations,
            _ => bail!("relocations against unsupported section: {target}"),
        }
        Ok(())
    }

    /// Derives the file's symbols: one per function/global import, one per function/global
    /// export, then one per name-section entry. Weak flags come from the linking section.
    fn build_symbols(&mut self, weak_names: &[(&'data str, u32)], function_names: &[(u32, &'data str)]) {
        let is_weak = |name: &str| {
            weak_names
                .iter()
                .any(|(n, flags)| *n == name && flags & SYMBOL_FLAG_WEAK != 0)
        };
        for (i, import) in self.imports.iter().enumerate() {
            let kind = match import.kind {
                ImportKind::Function { .. } => {
                    self.num_function_imports += 1;
                    WasmSymbolKind::FunctionImport
                }
                ImportKind::Global { .. } => {
                    self.num_global_imports += 1;
                    WasmSymbolKind::GlobalImport
                }
                _ => continue,
            };
            self.symbols.push(WasmSymbol {
                name: import.field,
                kind,
                element_index: i as u32,
                weak: is_weak(import.field),
            });
        }
        for (i, export) in self.exports.iter().enumerate() {
            let kind = match export.kind {
                EXTERNAL_FUNCTION => WasmSymbolKind::FunctionExport,
                EXTERNAL_GLOBAL => WasmSymbolKind::GlobalExport,
                _ => continue,
            };
            self.symbols.push(WasmSymbol {
                name: export.name,
                kind,
                element_index: i as u32,
                weak: is_weak(export.name),
            });
        }
        for &(function_index, name) in function_names {
            self.symbols.push(WasmSymbol {
                name,
                kind: WasmSymbolKind::DebugFunctionName,
                element_index: function_index,
                weak: false,
            });
        }
    }

    pub(crate) fn initial_memory_pages(&self) -> u32 {
        self.memories.first().map_or(0, |m| m.initial)
    }
}

fn read_limits(reader: &mut Reader) -> Result<Limits> {
    let flags = reader.read_uleb()?;
    let initial = reader.read_uleb()?;
    let max = if flags & LIMITS_HAS_MAX != 0 {
        Some(reader.read_uleb()?)
    } else {
        None
    };
    Ok(Limits { initial, max })
}

fn read_init_expr(reader: &mut Reader) -> Result<InitExpr> {
    let opcode = reader.read_u8()?;
    let expr = match opcode {
        OPCODE_I32_CONST => InitExpr::I32Const(i32::try_from(reader.read_sleb()?)?),
        OPCODE_I64_CONST => InitExpr::I64Const(reader.read_sleb()?),
        OPCODE_GET_GLOBAL => InitExpr::GetGlobal(reader.read_uleb()?),
        _ => bail!("unknown opcode in initializer expression: {opcode:#x}"),
    };
    let end = reader.read_u8()?;
    if end != OPCODE_END {
        bail!("initializer expression not terminated with end");
    }
    Ok(expr)
}

fn parse_linking_section<'data>(
    section: &mut Reader<'data>,
    weak_names: &mut Vec<(&'data str, u32)>,
) -> Result {
    while !section.done() {
        let ty = section.read_uleb()?;
        let len = section.read_uleb()?;
        let payload = section.read_bytes(len as usize).context("linking subsection")?;
        if ty == LINKING_SYMBOL_INFO {
            let mut sub = Reader::new(payload);
            for _ in 0..sub.read_uleb()? {
                let name = sub.read_str()?;
                let flags = sub.read_uleb()?;
                weak_names.push((name, flags));
            }
        }
    }
    Ok(())
}

fn parse_name_section<'data>(
    section: &mut Reader<'data>,
    function_names: &mut Vec<(u32, &'data str)>,
) -> Result {
    while !section.done() {
        let ty = section.read_uleb()?;
        let len = section.read_uleb()?;
        let payload = section.read_bytes(len as usize).context("name subsection")?;
        if ty == NAMES_FUNCTION {
            let mut sub = Reader::new(payload);
            for _ in 0..sub.read_uleb()? {
                let index = sub.read_uleb()?;
                let name = sub.read_str()?;
                function_names.push((index, name));
            }
        }
    }
    Ok(())
}

/// Sequential reader over a byte slice. All multi-byte integers in the format are LEB128 except
/// the version field.
pub(crate) struct Reader<'data> {
    data: &'data [u8],
    pos: usize,
}

impl<'data> Reader<'data> {
    pub(crate) fn new(data: &'data [u8]) -> Reader<'data> {
        Reader { data, pos: 0 }
    }

    pub(crate) fn done(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        let Some(&byte) = self.data.get(self.pos) else {
            bail!("unexpected end of input at offset {}", self.pos);
        };
        self.pos += 1;
        Ok(byte)
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'data [u8]> {
        let Some(bytes) = self.data.get(self.pos..self.pos + len) else {
            bail!("unexpected end of input at offset {}", self.pos);
        };
        self.pos += len;
        Ok(bytes)
    }

    pub(crate) fn read_uleb(&mut self) -> Result<u32> {
        let (value, len) = leb::decode_uleb(&self.data[self.pos..])?;
        self.pos += len;
        u32::try_from(value).context("varint out of 32-bit range")
    }

    pub(crate) fn read_sleb(&mut self) -> Result<i64> {
        let (value, len) = leb::decode_sleb(&self.data[self.pos..])?;
        self.pos += len;
        Ok(value)
    }

    pub(crate) fn read_str(&mut self) -> Result<&'data str> {
        let len = self.read_uleb()?;
        let bytes = self.read_bytes(len as usize)?;
        std::str::from_utf8(bytes).context("string is not valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ObjectBuilder;

    #[test]
    fn parses_a_small_object() {
        let bytes = ObjectBuilder::new()
            .signature(&[], Some(TYPE_I32))
            .signature(&[TYPE_F32, TYPE_F64], None)
            .import_function("env", "helper", 0)
            .function(0, &[0x00, 0x41, 0x2a, 0x0b])
            .export_function("main", 1)
            .memory(2)
            .build();
        let module = Module::parse(&bytes).unwrap();
        assert_eq!(module.signatures.len(), 2);
        assert_eq!(module.signatures[0].ret, Some(TYPE_I32));
        assert_eq!(module.signatures[1].params, vec![TYPE_F32, TYPE_F64]);
        assert_eq!(module.num_function_imports, 1);
        assert_eq!(module.function_types, vec![0]);
        assert_eq!(module.exports.len(), 1);
        assert_eq!(module.exports[0].index, 1);
        assert_eq!(module.initial_memory_pages(), 2);
        // One symbol per import, one per export.
        assert_eq!(module.symbols.len(), 2);
        assert_eq!(module.symbols[0].kind, WasmSymbolKind::FunctionImport);
        assert_eq!(module.symbols[0].name, "helper");
        assert_eq!(module.symbols[1].kind, WasmSymbolKind::FunctionExport);
    }

    #[test]
    fn weak_flag_comes_from_linking_section() {
        let bytes = ObjectBuilder::new()
            .signature(&[], None)
            .function(0, &[0x00, 0x0b])
            .export_function("g", 0)
            .weak("g")
            .build();
        let module = Module::parse(&bytes).unwrap();
        assert!(module.symbols[0].weak);
    }

    #[test]
    fn code_relocations_are_attached() {
        let bytes = ObjectBuilder::new()
            .signature(&[], None)
            .import_function("env", "f", 0)
            .function(0, &[0x00, 0x10, 0x80, 0x80, 0x80, 0x80, 0x00, 0x0b])
            .reloc(RelocKind::FunctionIndexLeb, 4, 0, 0)
            .build();
        let module = Module::parse(&bytes).unwrap();
        assert_eq!(module.code_relocations.len(), 1);
        assert_eq!(module.code_relocations[0].kind, RelocKind::FunctionIndexLeb);
        assert!(module.code.is_some());
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(Module::parse(b"\0elf\x01\0\0\0").is_err());
    }

    #[test]
    fn name_section_entries_become_debug_symbols() {
        let bytes = ObjectBuilder::new()
            .signature(&[], None)
            .function(0, &[0x00, 0x0b])
            .export_function("f", 0)
            .function_name(0, "f")
            .build();
        let module = Module::parse(&bytes).unwrap();
        let debug: Vec<_> = module
            .symbols
            .iter()
            .filter(|s| s.kind == WasmSymbolKind::DebugFunctionName)
            .collect();
        assert_eq!(debug.len(), 1);
        assert_eq!(debug[0].element_index, 0);
    }
}
