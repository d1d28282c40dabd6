//! Builds the map from symbol names to symbols across all inputs and resolves references between
//! them. Ingesting an input runs each of its named entities through the resolution rules;
//! undefined references that hit an archive's symbol table pull the defining member on the spot.

use crate::archive;
use crate::archive::ArchiveEntry;
use crate::archive::ArchiveIterator;
use crate::args::Args;
use crate::input_files::ArchiveFile;
use crate::input_files::FileId;
use crate::input_files::InputFile;
use crate::input_files::ObjectFile;
use crate::symbol::Symbol;
use crate::symbol::SymbolId;
use crate::symbol::SymbolKind;
use crate::symbol::SymbolName;
use crate::symbol::SymbolNameMap;
use crate::wasm;
use crate::wasm::WasmSymbolKind;
use ahash::AHashSet;
use anyhow::bail;
use anyhow::Context;
use std::collections::hash_map;
use std::path::Path;
use std::path::PathBuf;

pub(crate) struct SymbolTable<'data> {
    pub(crate) args: &'data Args,
    symbol_ids: SymbolNameMap<'data, SymbolId>,
    symbols: Vec<Symbol>,
    symbol_names: Vec<SymbolName<'data>>,
    pub(crate) files: Vec<InputFile<'data>>,
    /// Object files in the order their ingestion completed. A member pulled from an archive
    /// finishes ingesting before the input that pulled it, so it sorts ahead of that input here.
    /// Every output index space follows this order.
    pub(crate) object_files: Vec<FileId>,
}

impl<'data> SymbolTable<'data> {
    pub(crate) fn new(args: &'data Args) -> SymbolTable<'data> {
        SymbolTable {
            args,
            symbol_ids: SymbolNameMap::default(),
            symbols: Vec::new(),
            symbol_names: Vec::new(),
            files: Vec::new(),
            object_files: Vec::new(),
        }
    }

    pub(crate) fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.as_usize()]
    }

    pub(crate) fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.as_usize()]
    }

    pub(crate) fn symbol_name(&self, id: SymbolId) -> SymbolName<'data> {
        self.symbol_names[id.as_usize()]
    }

    pub(crate) fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub(crate) fn object(&self, file_id: FileId) -> &ObjectFile<'data> {
        match &self.files[file_id.as_usize()] {
            InputFile::Object(object) => object,
            InputFile::Archive(_) => panic!("file {} is not an object", file_id.as_usize()),
        }
    }

    pub(crate) fn object_mut(&mut self, file_id: FileId) -> &mut ObjectFile<'data> {
        match &mut self.files[file_id.as_usize()] {
            InputFile::Object(object) => object,
            InputFile::Archive(_) => panic!("file {} is not an object", file_id.as_usize()),
        }
    }

    fn archive(&self, file_id: FileId) -> &ArchiveFile<'data> {
        match &self.files[file_id.as_usize()] {
            InputFile::Archive(archive) => archive,
            InputFile::Object(_) => panic!("file {} is not an archive", file_id.as_usize()),
        }
    }

    fn archive_mut(&mut self, file_id: FileId) -> &mut ArchiveFile<'data> {
        match &mut self.files[file_id.as_usize()] {
            InputFile::Archive(archive) => archive,
            InputFile::Object(_) => panic!("file {} is not an archive", file_id.as_usize()),
        }
    }

    pub(crate) fn find(&self, name: &'data str) -> Option<SymbolId> {
        self.symbol_ids.get(&SymbolName::new(name.as_bytes())).copied()
    }

    fn insert(&mut self, name: SymbolName<'data>, kind: SymbolKind) -> (SymbolId, bool) {
        match self.symbol_ids.entry(name) {
            hash_map::Entry::Occupied(entry) => (*entry.get(), false),
            hash_map::Entry::Vacant(entry) => {
                let id = SymbolId::new(self.symbols.len());
                entry.insert(id);
                self.symbols.push(Symbol::new(kind));
                self.symbol_names.push(name);
                (id, true)
            }
        }
    }

    fn update(&mut self, id: SymbolId, kind: SymbolKind, file: FileId, wasm_symbol: u32) {
        let symbol = self.symbol_mut(id);
        symbol.kind = kind;
        symbol.file = Some(file);
        symbol.wasm_symbol = Some(wasm_symbol);
        symbol.archive_symbol = None;
    }

    /// Identifies `data` and ingests it as an object or archive.
    pub(crate) fn add_file(&mut self, filename: &Path, data: &'data [u8]) -> crate::error::Result {
        if data.starts_with(archive::ARCHIVE_MAGIC) {
            self.add_archive(filename.to_owned(), data)
        } else if data.starts_with(&wasm::MAGIC) {
            self.add_object(filename.to_owned(), None, data).map(|_| ())
        } else {
            bail!("unknown file type: {}", filename.display());
        }
    }

    fn add_object(
        &mut self,
        filename: PathBuf,
        parent: Option<PathBuf>,
        data: &'data [u8],
    ) -> crate::error::Result<FileId> {
        let module = wasm::Module::parse(data)
            .with_context(|| format!("failed to parse wasm object `{}`", filename.display()))?;
        let file_id = FileId::new(self.files.len());
        tracing::debug!("processing {}", filename.display());
        self.files
            .push(InputFile::Object(ObjectFile::new(filename, parent, module)));

        let num_symbols = self.object(file_id).module.symbols.len() as u32;
        for index in 0..num_symbols {
            let wasm_symbol = *self.object(file_id).wasm_symbol(index);
            match wasm_symbol.kind {
                WasmSymbolKind::FunctionImport | WasmSymbolKind::GlobalImport => {
                    let id = self.add_undefined(file_id, index)?;
                    let object = self.object_mut(file_id);
                    object.symbols.push(id);
                    if wasm_symbol.kind == WasmSymbolKind::FunctionImport {
                        object.function_import_symbols.push(id);
                    } else {
                        object.global_import_symbols.push(id);
                    }
                }
                WasmSymbolKind::FunctionExport | WasmSymbolKind::GlobalExport => {
                    let id = self.add_defined(file_id, index)?;
                    self.object_mut(file_id).symbols.push(id);
                }
                // Debug names don't resolve; the name-section emitter walks them directly.
                WasmSymbolKind::DebugFunctionName => {}
            }
        }
        self.object_files.push(file_id);
        Ok(file_id)
    }

    fn add_archive(&mut self, filename: PathBuf, data: &'data [u8]) -> crate::error::Result {
        let mut symbol_table = None;
        let mut extended_filenames = None;
        for entry in ArchiveIterator::from_archive_bytes(data)
            .with_context(|| format!("failed to read archive `{}`", filename.display()))?
        {
            match entry? {
                ArchiveEntry::Symbols(table) => symbol_table = Some(table),
                ArchiveEntry::Filenames(filenames) => extended_filenames = Some(filenames),
                ArchiveEntry::Regular(_) => {}
            }
        }
        let symbols = symbol_table
            .map(|table| table.symbols())
            .transpose()
            .with_context(|| format!("failed to read archive `{}`", filename.display()))?
            .unwrap_or_default();

        let file_id = FileId::new(self.files.len());
        tracing::debug!("processing {}", filename.display());
        self.files.push(InputFile::Archive(ArchiveFile {
            filename,
            data,
            symbols,
            extended_filenames,
            loaded_members: AHashSet::new(),
        }));
        let num_symbols = self.archive(file_id).symbols.len() as u32;
        for index in 0..num_symbols {
            self.add_lazy(file_id, index)?;
        }
        Ok(())
    }

    /// Synthesize a defined global that no input backs (the stack pointer).
    pub(crate) fn add_defined_global(&mut self, name: &'data str) -> crate::error::Result<SymbolId> {
        let (id, inserted) = self.insert(SymbolName::new(name.as_bytes()), SymbolKind::DefinedGlobal);
        if !inserted {
            if self.symbol(id).kind.is_function() {
                bail!("symbol type mismatch: {name}");
            }
            self.symbol_mut(id).kind = SymbolKind::DefinedGlobal;
        }
        Ok(id)
    }

    /// Synthesize an undefined function reference (the entry point).
    pub(crate) fn add_undefined_function(&mut self, name: &'data str) -> crate::error::Result<SymbolId> {
        let (id, inserted) =
            self.insert(SymbolName::new(name.as_bytes()), SymbolKind::UndefinedFunction);
        if !inserted && !self.symbol(id).kind.is_function() {
            bail!("symbol type mismatch: {name}");
        }
        Ok(id)
    }

    fn add_defined(&mut self, file_id: FileId, wasm_symbol: u32) -> crate::error::Result<SymbolId> {
        let wasm_sym = *self.object(file_id).wasm_symbol(wasm_symbol);
        let kind = if wasm_sym.kind == WasmSymbolKind::GlobalExport {
            SymbolKind::DefinedGlobal
        } else {
            SymbolKind::DefinedFunction
        };
        let name = SymbolName::new(wasm_sym.name.as_bytes());
        let (id, inserted) = self.insert(name, kind);
        if inserted {
            self.update(id, kind, file_id, wasm_symbol);
            return Ok(id);
        }
        let existing_kind = self.symbol(id).kind;
        if !existing_kind.is_defined() {
            // An undefined reference or a lazy slot; the definition wins.
            self.check_symbol_types(id, file_id, kind.is_function())?;
            self.update(id, kind, file_id, wasm_symbol);
        } else if wasm_sym.weak {
            // The new definition is weak; the existing one stands.
        } else if self.is_weak(id) {
            self.update(id, kind, file_id, wasm_symbol);
        } else {
            bail!(
                "duplicate symbol: {name} in {} and in {}",
                self.file_display_name(self.symbol(id).file),
                self.object(file_id)
            );
        }
        Ok(id)
    }

    fn add_undefined(&mut self, file_id: FileId, wasm_symbol: u32) -> crate::error::Result<SymbolId> {
        let wasm_sym = *self.object(file_id).wasm_symbol(wasm_symbol);
        let kind = if wasm_sym.kind == WasmSymbolKind::GlobalImport {
            SymbolKind::UndefinedGlobal
        } else {
            SymbolKind::UndefinedFunction
        };
        let name = SymbolName::new(wasm_sym.name.as_bytes());
        let (id, inserted) = self.insert(name, kind);
        if inserted {
            self.update(id, kind, file_id, wasm_symbol);
            return Ok(id);
        }
        let existing = self.symbol(id);
        match existing.kind {
            SymbolKind::Lazy => {
                let archive_id = existing.file.expect("lazy symbol without an archive");
                let archive_symbol = existing
                    .archive_symbol
                    .expect("lazy symbol without an archive back-reference");
                let member_offset =
                    self.archive(archive_id).symbols[archive_symbol as usize].member_offset;
                tracing::debug!("resolving `{name}` from an archive member");
                self.load_archive_member(archive_id, member_offset)?;
            }
            k if k.is_defined() => {
                self.check_symbol_types(id, file_id, kind.is_function())?;
            }
            _ => {
                // Still undefined. Attach this reference if the slot has none, so the import
                // emitter can recover a signature for names first created synthetically.
                if existing.file.is_none() {
                    let symbol = self.symbol_mut(id);
                    symbol.file = Some(file_id);
                    symbol.wasm_symbol = Some(wasm_symbol);
                }
            }
        }
        Ok(id)
    }

    /// Associate a yet-unresolved name with a pullable archive member. If the name is already an
    /// undefined reference, the member is pulled immediately.
    fn add_lazy(&mut self, archive_id: FileId, index: u32) -> crate::error::Result {
        let name = SymbolName::new(self.archive(archive_id).symbols[index as usize].name);
        let (id, inserted) = self.insert(name, SymbolKind::Lazy);
        if inserted {
            let symbol = self.symbol_mut(id);
            symbol.file = Some(archive_id);
            symbol.archive_symbol = Some(index);
        } else if self.symbol(id).kind.is_undefined() {
            let member_offset = self.archive(archive_id).symbols[index as usize].member_offset;
            tracing::debug!("`{name}` already referenced, pulling member");
            self.load_archive_member(archive_id, member_offset)?;
        }
        Ok(())
    }

    /// Parses an archive member as a wasm object and ingests it. The member set guard makes
    /// pulls idempotent, which also terminates pull cycles between members.
    fn load_archive_member(
        &mut self,
        archive_id: FileId,
        member_offset: u32,
    ) -> crate::error::Result {
        if !self.archive_mut(archive_id).loaded_members.insert(member_offset) {
            return Ok(());
        }
        let (data, extended_filenames, parent) = {
            let archive = self.archive(archive_id);
            (archive.data, archive.extended_filenames, archive.filename.clone())
        };
        let content = archive::member_at(data, member_offset)
            .with_context(|| format!("failed to load member from `{}`", parent.display()))?;
        let member_name = PathBuf::from(
            String::from_utf8_lossy(content.identifier(extended_filenames).as_slice()).into_owned(),
        );
        if !content.entry_data.starts_with(&wasm::MAGIC) {
            bail!(
                "unknown file type: {}({})",
                parent.display(),
                member_name.display()
            );
        }
        tracing::debug!("loaded {}({})", parent.display(), member_name.display());
        self.add_object(member_name, Some(parent), content.entry_data)?;
        Ok(())
    }

    /// A symbol's function-vs-global nature never changes after first insertion. Lazy entries
    /// haven't declared a nature yet and pass.
    fn check_symbol_types(
        &self,
        existing: SymbolId,
        new_file: FileId,
        new_is_function: bool,
    ) -> crate::error::Result {
        let symbol = self.symbol(existing);
        if symbol.kind == SymbolKind::Lazy {
            return Ok(());
        }
        if symbol.kind.is_function() != new_is_function {
            bail!(
                "symbol type mismatch: {} ({}: {}, {}: {})",
                self.symbol_name(existing),
                self.file_display_name(symbol.file),
                if symbol.kind.is_function() { "Function" } else { "Global" },
                self.object(new_file),
                if new_is_function { "Function" } else { "Global" },
            );
        }
        Ok(())
    }

    pub(crate) fn is_weak(&self, id: SymbolId) -> bool {
        let symbol = self.symbol(id);
        let (Some(file), Some(index)) = (symbol.file, symbol.wasm_symbol) else {
            return false;
        };
        match &self.files[file.as_usize()] {
            InputFile::Object(object) => object.wasm_symbol(index).weak,
            InputFile::Archive(_) => false,
        }
    }

    fn file_display_name(&self, file: Option<FileId>) -> String {
        file.map_or_else(
            || "(internal)".to_owned(),
            |id| self.files[id.as_usize()].display_name(),
        )
    }

    /// After all inputs, every name still undefined and not allowed by configuration is reported
    /// against each input that referenced it, then the link fails.
    pub(crate) fn report_remaining_undefines(&self) -> crate::error::Result {
        let mut undefs = Vec::new();
        for (index, symbol) in self.symbols.iter().enumerate() {
            if !symbol.kind.is_undefined() {
                continue;
            }
            let id = SymbolId::new(index);
            let allowed = std::str::from_utf8(self.symbol_name(id).bytes())
                .is_ok_and(|name| self.args.allow_undefined_symbols.contains(name));
            if !allowed {
                undefs.push(id);
            }
        }
        if undefs.is_empty() {
            return Ok(());
        }
        for &file_id in &self.object_files {
            let object = self.object(file_id);
            for &id in &object.symbols {
                if undefs.contains(&id) {
                    tracing::warn!("{object}: undefined symbol: {}", self.symbol_name(id));
                }
            }
        }
        for &id in &undefs {
            if self.symbol(id).file.is_none() {
                tracing::warn!("undefined symbol: {}", self.symbol_name(id));
            }
        }
        bail!("link failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use crate::testing::ArchiveBuilder;
    use crate::testing::ObjectBuilder;

    fn defined_function() -> ObjectBuilder {
        let mut builder = ObjectBuilder::new();
        builder
            .signature(&[], None)
            .function(0, &[0x00, 0x0b])
            .export_function("f", 0);
        builder
    }

    #[test]
    fn strong_definition_replaces_weak() {
        let args = testing::args(&["--relocatable"]);
        let weak = {
            let mut b = defined_function();
            b.weak("f");
            b.build()
        };
        let strong = defined_function().build();
        let mut symtab = SymbolTable::new(&args);
        symtab.add_file(Path::new("weak.o"), &weak).unwrap();
        symtab.add_file(Path::new("strong.o"), &strong).unwrap();
        let id = symtab.find("f").unwrap();
        let symbol = symtab.symbol(id);
        assert_eq!(symbol.kind, SymbolKind::DefinedFunction);
        assert_eq!(symbol.file, Some(symtab.object_files[1]));
    }

    #[test]
    fn weak_definition_keeps_existing() {
        let args = testing::args(&["--relocatable"]);
        let strong = defined_function().build();
        let weak = {
            let mut b = defined_function();
            b.weak("f");
            b.build()
        };
        let mut symtab = SymbolTable::new(&args);
        symtab.add_file(Path::new("strong.o"), &strong).unwrap();
        symtab.add_file(Path::new("weak.o"), &weak).unwrap();
        let id = symtab.find("f").unwrap();
        assert_eq!(symtab.symbol(id).file, Some(symtab.object_files[0]));
    }

    #[test]
    fn duplicate_strong_definitions_fail() {
        let args = testing::args(&["--relocatable"]);
        let a = defined_function().build();
        let b = defined_function().build();
        let mut symtab = SymbolTable::new(&args);
        symtab.add_file(Path::new("a.o"), &a).unwrap();
        let err = symtab.add_file(Path::new("b.o"), &b).unwrap_err();
        assert!(err.to_string().contains("duplicate symbol"), "{err}");
    }

    #[test]
    fn function_global_mismatch_fails() {
        let args = testing::args(&["--relocatable"]);
        let function = defined_function().build();
        let global = {
            let mut b = ObjectBuilder::new();
            b.global(wasm::TYPE_I32, false, 7).export_global("f", 0);
            b.build()
        };
        let mut symtab = SymbolTable::new(&args);
        symtab.add_file(Path::new("fun.o"), &function).unwrap();
        let err = symtab.add_file(Path::new("glob.o"), &global).unwrap_err();
        assert!(err.to_string().contains("symbol type mismatch"), "{err}");
    }

    #[test]
    fn undefined_reference_pulls_archive_member() {
        let args = testing::args(&["--relocatable"]);
        let user = {
            let mut b = ObjectBuilder::new();
            b.signature(&[], None).import_function("env", "f", 0);
            b.build()
        };
        let member = defined_function().build();
        let lib = ArchiveBuilder::new()
            .member_defining("f.o", member, &["f"])
            .build();
        let mut symtab = SymbolTable::new(&args);
        symtab.add_file(Path::new("user.o"), &user).unwrap();
        symtab.add_file(Path::new("libf.a"), &lib).unwrap();
        let id = symtab.find("f").unwrap();
        assert_eq!(symtab.symbol(id).kind, SymbolKind::DefinedFunction);
        assert_eq!(symtab.object_files.len(), 2);
    }

    #[test]
    fn unreferenced_archive_stays_silent() {
        let args = testing::args(&["--relocatable"]);
        let member = defined_function().build();
        let lib = ArchiveBuilder::new()
            .member_defining("f.o", member, &["f"])
            .build();
        let mut symtab = SymbolTable::new(&args);
        symtab.add_file(Path::new("libf.a"), &lib).unwrap();
        assert!(symtab.object_files.is_empty());
        let id = symtab.find("f").unwrap();
        assert_eq!(symtab.symbol(id).kind, SymbolKind::Lazy);
    }

    #[test]
    fn member_pulled_during_ingestion_precedes_the_puller() {
        let args = testing::args(&["--relocatable"]);
        let member = defined_function().build();
        let lib = ArchiveBuilder::new()
            .member_defining("f.o", member, &["f"])
            .build();
        let user = {
            let mut b = ObjectBuilder::new();
            b.signature(&[], None).import_function("env", "f", 0);
            b.build()
        };
        let mut symtab = SymbolTable::new(&args);
        symtab.add_file(Path::new("libf.a"), &lib).unwrap();
        symtab.add_file(Path::new("user.o"), &user).unwrap();
        assert_eq!(symtab.object_files.len(), 2);
        assert_eq!(symtab.object(symtab.object_files[0]).filename, Path::new("f.o"));
        assert_eq!(symtab.object(symtab.object_files[1]).filename, Path::new("user.o"));
    }

    #[test]
    fn remaining_undefines_fail_unless_allowed() {
        let args = testing::args(&["--relocatable"]);
        let user = {
            let mut b = ObjectBuilder::new();
            b.signature(&[], None).import_function("env", "missing", 0);
            b.build()
        };
        let mut symtab = SymbolTable::new(&args);
        symtab.add_file(Path::new("user.o"), &user).unwrap();
        let err = symtab.report_remaining_undefines().unwrap_err();
        assert_eq!(err.to_string(), "link failed");
    }

    #[test]
    fn resolution_is_deterministic() {
        let args = testing::args(&["--relocatable"]);
        let kinds = |symtab: &SymbolTable| -> Vec<SymbolKind> {
            (0..symtab.num_symbols())
                .map(|i| symtab.symbol(SymbolId::new(i)).kind)
                .collect()
        };
        let strong = defined_function().build();
        let weak = {
            let mut b = defined_function();
            b.weak("f");
            b.build()
        };
        let mut first = SymbolTable::new(&args);
        first.add_file(Path::new("a.o"), &strong).unwrap();
        first.add_file(Path::new("b.o"), &weak).unwrap();
        let mut second = SymbolTable::new(&args);
        second.add_file(Path::new("a.o"), &strong).unwrap();
        second.add_file(Path::new("b.o"), &weak).unwrap();
        assert_eq!(kinds(&first), kinds(&second));
    }
}
