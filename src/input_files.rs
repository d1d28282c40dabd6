//! The linker's view of an input: a parsed wasm object, or an archive whose members are pulled on
//! demand. Object files carry the renumbering offsets assigned during layout together with the
//! remap functions that turn input-local indices into output-module indices.

use crate::archive;
use crate::error::Result;
use crate::symbol::SymbolId;
use crate::symbol_db::SymbolTable;
use crate::wasm;
use ahash::AHashSet;
use anyhow::bail;
use anyhow::Context;
use std::fmt::Display;
use std::path::PathBuf;

/// Identifies a parsed input (object or archive) within the symbol table's file vector. Archive
/// members get their own IDs as they're pulled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct FileId(u32);

impl FileId {
    pub(crate) fn new(value: usize) -> FileId {
        FileId(value as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

pub(crate) enum InputFile<'data> {
    Object(ObjectFile<'data>),
    Archive(ArchiveFile<'data>),
}

pub(crate) struct ObjectFile<'data> {
    pub(crate) filename: PathBuf,
    /// The archive this member came from, if any. Only used when naming the file in diagnostics.
    pub(crate) parent: Option<PathBuf>,
    pub(crate) module: wasm::Module<'data>,
    /// The linker symbols this file references or defines, in the order the input names them.
    pub(crate) symbols: Vec<SymbolId>,
    /// One entry per function import, aligned with function indices below the import count.
    pub(crate) function_import_symbols: Vec<SymbolId>,
    /// One entry per global import, aligned with global indices below the import count.
    pub(crate) global_import_symbols: Vec<SymbolId>,
    pub(crate) type_index_offset: u32,
    /// Offset from this file's function index space into the output's. The file's own imports are
    /// replaced by the combined import block, so as an unsigned value this may sit below zero
    /// until a local index (which counts those imports) is added back; all arithmetic wraps.
    pub(crate) function_index_offset: u32,
    /// Same construction as `function_index_offset`, for the global space. Relocatable mode only.
    pub(crate) global_index_offset: u32,
    pub(crate) table_index_offset: u32,
    /// Where this file's data block was placed in linear memory.
    pub(crate) data_offset: u32,
    /// Where this file's code bytes landed in the output code section.
    pub(crate) code_section_offset: u32,
}

pub(crate) struct ArchiveFile<'data> {
    pub(crate) filename: PathBuf,
    pub(crate) data: &'data [u8],
    pub(crate) symbols: Vec<archive::ArchiveSymbol<'data>>,
    pub(crate) extended_filenames: Option<archive::ExtendedFilenames<'data>>,
    /// Header offsets of members that have already been pulled, so a member defining several
    /// requested symbols is only parsed once and pull cycles terminate.
    pub(crate) loaded_members: AHashSet<u32>,
}

impl<'data> ObjectFile<'data> {
    pub(crate) fn new(
        filename: PathBuf,
        parent: Option<PathBuf>,
        module: wasm::Module<'data>,
    ) -> ObjectFile<'data> {
        ObjectFile {
            filename,
            parent,
            module,
            symbols: Vec::new(),
            function_import_symbols: Vec::new(),
            global_import_symbols: Vec::new(),
            type_index_offset: 0,
            function_index_offset: 0,
            global_index_offset: 0,
            table_index_offset: 0,
            data_offset: 0,
            code_section_offset: 0,
        }
    }

    pub(crate) fn relocate_type_index(&self, index: u32) -> u32 {
        self.type_index_offset + index
    }

    pub(crate) fn is_imported_function(&self, index: u32) -> bool {
        (index as usize) < self.function_import_symbols.len()
    }

    pub(crate) fn is_resolved_function_import(&self, symtab: &SymbolTable, index: u32) -> bool {
        self.function_import_symbols
            .get(index as usize)
            .is_some_and(|&sym| symtab.symbol(sym).kind.is_defined())
    }

    /// An index that referred to one of this file's function imports follows the import's symbol:
    /// to the definition's index if some input defined it, otherwise to the import slot the
    /// symbol was assigned. Defined functions are shifted by this file's offset.
    pub(crate) fn relocate_function_index(&self, symtab: &SymbolTable, index: u32) -> Result<u32> {
        if let Some(&sym) = self.function_import_symbols.get(index as usize) {
            symtab.symbol(sym).output_index().with_context(|| {
                format!(
                    "{self}: function import `{}` was never assigned an index",
                    symtab.symbol_name(sym)
                )
            })
        } else {
            Ok(self.function_index_offset.wrapping_add(index))
        }
    }

    pub(crate) fn relocate_global_index(&self, symtab: &SymbolTable, index: u32) -> Result<u32> {
        if let Some(&sym) = self.global_import_symbols.get(index as usize) {
            symtab.symbol(sym).output_index().with_context(|| {
                format!(
                    "{self}: global import `{}` was never assigned an index",
                    symtab.symbol_name(sym)
                )
            })
        } else if symtab.args.relocatable {
            Ok(self.global_index_offset.wrapping_add(index))
        } else {
            // Input-defined globals aren't emitted in executable output; their values are
            // materialized as memory addresses instead, so no index exists to relocate to.
            bail!("{self}: global index relocation against a defined global in executable output");
        }
    }

    pub(crate) fn relocate_table_index(&self, index: u32) -> u32 {
        self.table_index_offset + index
    }

    pub(crate) fn relocate_code_offset(&self, offset: u32) -> u32 {
        self.code_section_offset + offset
    }

    /// The final linear-memory address of the value held by defined global `index`: the file's
    /// data block base plus the global's initializer.
    pub(crate) fn global_address(&self, index: u32) -> Result<i64> {
        let global = self
            .module
            .globals
            .get(index as usize)
            .with_context(|| format!("{self}: global index {index} out of range"))?;
        Ok(i64::from(self.data_offset) + i64::from(global.init.i32_value()?))
    }

    pub(crate) fn wasm_symbol(&self, index: u32) -> &wasm::WasmSymbol<'data> {
        &self.module.symbols[index as usize]
    }

    /// The import record behind an import-derived wasm symbol.
    pub(crate) fn import_record(&self, wasm_symbol: u32) -> Result<&wasm::Import<'data>> {
        let sym = self.wasm_symbol(wasm_symbol);
        self.module
            .imports
            .get(sym.element_index as usize)
            .with_context(|| format!("{self}: import record {} out of range", sym.element_index))
    }

    /// The export record behind an export-derived wasm symbol.
    pub(crate) fn export_record(&self, wasm_symbol: u32) -> Result<&wasm::Export<'data>> {
        let sym = self.wasm_symbol(wasm_symbol);
        self.module
            .exports
            .get(sym.element_index as usize)
            .with_context(|| format!("{self}: export record {} out of range", sym.element_index))
    }

    /// Function index (in this file's index space) of a defined function symbol.
    pub(crate) fn exported_function_index(&self, wasm_symbol: u32) -> Result<u32> {
        let export = self.export_record(wasm_symbol)?;
        if export.kind != wasm::EXTERNAL_FUNCTION {
            bail!("{self}: export `{}` is not a function", export.name);
        }
        Ok(export.index)
    }

    /// Global index (in this file's index space) of a defined global symbol.
    pub(crate) fn exported_global_index(&self, wasm_symbol: u32) -> Result<u32> {
        let export = self.export_record(wasm_symbol)?;
        if export.kind != wasm::EXTERNAL_GLOBAL {
            bail!("{self}: export `{}` is not a global", export.name);
        }
        Ok(export.index)
    }

    /// Signature index recorded by the import behind an undefined function symbol.
    pub(crate) fn imported_function_type_index(&self, wasm_symbol: u32) -> Result<u32> {
        match self.import_record(wasm_symbol)?.kind {
            wasm::ImportKind::Function { sig_index } => Ok(sig_index),
            _ => bail!("{self}: import is not a function"),
        }
    }
}

impl<'data> Display for ObjectFile<'data> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.parent {
            Some(parent) => write!(f, "{}({})", parent.display(), self.filename.display()),
            None => write!(f, "{}", self.filename.display()),
        }
    }
}

impl<'data> InputFile<'data> {
    pub(crate) fn display_name(&self) -> String {
        match self {
            InputFile::Object(object) => object.to_string(),
            InputFile::Archive(archive) => archive.filename.display().to_string(),
        }
    }
}
