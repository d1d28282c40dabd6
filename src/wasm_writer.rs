//! Writes the output module. Each input's code bytes are copied, patched in place at the original
//! LEB widths, then appended; sections are framed with the size fix-up protocol: a 5-byte padded
//! size placeholder written up front and rewritten once the section's true extent is known.

use crate::error::Result;
use crate::input_files::ObjectFile;
use crate::layout::Layout;
use crate::leb;
use crate::symbol_db::SymbolTable;
use crate::wasm;
use crate::wasm::RelocKind;
use anyhow::bail;
use anyhow::ensure;
use anyhow::Context;

#[tracing::instrument(skip_all, name = "Write")]
pub(crate) fn write(symtab: &mut SymbolTable, layout: &Layout) -> Result<Vec<u8>> {
    let mut writer = Writer {
        out: OutputBuffer::new(),
    };
    writer.write_header();
    writer.write_type_section(symtab, layout)?;
    writer.write_import_section(symtab, layout)?;
    writer.write_function_section(symtab, layout);
    writer.write_table_section(layout);
    writer.write_memory_section(layout);
    writer.write_global_section(symtab, layout)?;
    writer.write_export_section(symtab, layout)?;
    writer.write_elem_section(symtab, layout);
    writer.write_code_section(symtab, layout)?;
    writer.write_data_section(symtab, layout)?;

    let args = symtab.args;
    if args.emit_relocs || args.relocatable {
        writer.write_reloc_section(symtab, layout)?;
    }
    if !args.strip_debug && !args.strip_all {
        writer.write_name_section(symtab)?;
    }
    Ok(writer.out.into_bytes())
}

struct Writer {
    out: OutputBuffer,
}

impl Writer {
    fn write_header(&mut self) {
        self.out.write_bytes(&wasm::MAGIC);
        self.out.write_u32(wasm::VERSION);
    }

    fn write_type_section(&mut self, symtab: &SymbolTable, layout: &Layout) -> Result {
        if layout.total_types == 0 {
            return Ok(());
        }
        let section = self.out.begin_section(wasm::SEC_TYPE);
        self.out.write_uleb(layout.total_types);
        for &file_id in &symtab.object_files {
            for signature in &symtab.object(file_id).module.signatures {
                self.out.write_sleb(wasm::TYPE_FUNC);
                self.out.write_uleb(signature.params.len() as u32);
                for &param in &signature.params {
                    self.out.write_sleb(param);
                }
                match signature.ret {
                    None => self.out.write_uleb(0),
                    Some(ret) => {
                        self.out.write_uleb(1);
                        self.out.write_sleb(ret);
                    }
                }
            }
        }
        self.out.end_section(section);
        Ok(())
    }

    fn write_import_section(&mut self, symtab: &SymbolTable, layout: &Layout) -> Result {
        let total_imports = layout.function_imports.len() + layout.global_imports.len();
        if total_imports == 0 {
            return Ok(());
        }
        let section = self.out.begin_section(wasm::SEC_IMPORT);
        self.out.write_uleb(total_imports as u32);
        for &id in &layout.function_imports {
            let symbol = symtab.symbol(id);
            let (file, wasm_symbol) = symbol
                .file
                .zip(symbol.wasm_symbol)
                .with_context(|| {
                    format!(
                        "function import `{}` has no originating reference",
                        symtab.symbol_name(id)
                    )
                })?;
            let object = symtab.object(file);
            let sig_index =
                object.relocate_type_index(object.imported_function_type_index(wasm_symbol)?);
            self.out.write_str("env");
            self.out.write_name(symtab.symbol_name(id).bytes());
            self.out.write_u8(wasm::EXTERNAL_FUNCTION);
            self.out.write_uleb(sig_index);
        }
        for &id in &layout.global_imports {
            let symbol = symtab.symbol(id);
            let (file, wasm_symbol) = symbol
                .file
                .zip(symbol.wasm_symbol)
                .with_context(|| {
                    format!(
                        "global import `{}` has no originating reference",
                        symtab.symbol_name(id)
                    )
                })?;
            let wasm::ImportKind::Global { value_type, mutable } =
                symtab.object(file).import_record(wasm_symbol)?.kind
            else {
                bail!(
                    "global import `{}` is not backed by a global import record",
                    symtab.symbol_name(id)
                );
            };
            self.out.write_str("env");
            self.out.write_name(symtab.symbol_name(id).bytes());
            self.out.write_u8(wasm::EXTERNAL_GLOBAL);
            self.out.write_sleb(value_type);
            self.out.write_uleb(u32::from(mutable));
        }
        self.out.end_section(section);
        Ok(())
    }

    fn write_function_section(&mut self, symtab: &SymbolTable, layout: &Layout) {
        if layout.total_functions == 0 {
            return;
        }
        let section = self.out.begin_section(wasm::SEC_FUNCTION);
        self.out.write_uleb(layout.total_functions);
        for &file_id in &symtab.object_files {
            let object = symtab.object(file_id);
            for &sig_index in &object.module.function_types {
                self.out.write_uleb(object.relocate_type_index(sig_index));
            }
        }
        self.out.end_section(section);
    }

    fn write_table_section(&mut self, layout: &Layout) {
        if layout.total_table_length == 0 {
            return;
        }
        let section = self.out.begin_section(wasm::SEC_TABLE);
        self.out.write_uleb(1);
        self.out.write_sleb(wasm::TYPE_ANYFUNC);
        self.out.write_uleb(wasm::LIMITS_HAS_MAX);
        self.out.write_uleb(layout.total_table_length);
        self.out.write_uleb(layout.total_table_length);
        self.out.end_section(section);
    }

    fn write_memory_section(&mut self, layout: &Layout) {
        if layout.total_memory_pages == 0 {
            return;
        }
        let section = self.out.begin_section(wasm::SEC_MEMORY);
        self.out.write_uleb(1);
        match layout.max_memory_pages {
            None => {
                self.out.write_uleb(0);
                self.out.write_uleb(layout.total_memory_pages);
            }
            Some(max_pages) => {
                self.out.write_uleb(wasm::LIMITS_HAS_MAX);
                self.out.write_uleb(layout.total_memory_pages);
                self.out.write_uleb(max_pages);
            }
        }
        self.out.end_section(section);
    }

    fn write_global_section(&mut self, symtab: &SymbolTable, layout: &Layout) -> Result {
        if layout.total_globals == 0 {
            return Ok(());
        }
        let section = self.out.begin_section(wasm::SEC_GLOBAL);
        self.out.write_uleb(layout.total_globals);
        for global in &layout.synthetic_globals {
            self.out.write_sleb(wasm::TYPE_I32);
            self.out.write_uleb(1);
            self.out.write_init_expr(wasm::InitExpr::I32Const(global.value));
        }
        if symtab.args.relocatable {
            for &file_id in &symtab.object_files {
                for global in &symtab.object(file_id).module.globals {
                    self.out.write_sleb(global.value_type);
                    self.out.write_uleb(u32::from(global.mutable));
                    self.out.write_init_expr(global.init);
                }
            }
        }
        self.out.end_section(section);
        Ok(())
    }

    fn write_export_section(&mut self, symtab: &SymbolTable, layout: &Layout) -> Result {
        let args = symtab.args;
        let export_memory = !args.relocatable;
        let export_other = args.relocatable;
        let entry = args.entry.as_deref();

        let mut num_exports = 0u32;
        if export_memory {
            num_exports += 1;
        }
        if entry.is_some() {
            num_exports += 1;
        }
        if export_other {
            num_exports += layout.total_exports;
        }
        if num_exports == 0 {
            return Ok(());
        }

        let section = self.out.begin_section(wasm::SEC_EXPORT);
        self.out.write_uleb(num_exports);

        if export_memory {
            self.out.write_str("memory");
            self.out.write_u8(wasm::EXTERNAL_MEMORY);
            self.out.write_sleb(0);
        }

        if let Some(entry) = entry {
            let id = symtab
                .find(entry)
                .with_context(|| format!("undefined entry symbol: {entry}"))?;
            ensure!(
                symtab.symbol(id).kind.is_function(),
                "entry point is not a function: {entry}"
            );
            let index = symtab.symbol(id).output_index().with_context(|| {
                format!("entry symbol `{entry}` was never assigned an index")
            })?;
            self.out
                .write_str(args.export_entry_as.as_deref().unwrap_or(entry));
            self.out.write_u8(wasm::EXTERNAL_FUNCTION);
            self.out.write_uleb(index);
        }

        if export_other {
            for &file_id in &symtab.object_files {
                for export in &symtab.object(file_id).module.exports {
                    self.out.write_str(export.name);
                    self.out.write_u8(export.kind);
                    match export.kind {
                        wasm::EXTERNAL_FUNCTION => self.out.write_uleb(export.index),
                        wasm::EXTERNAL_GLOBAL | wasm::EXTERNAL_MEMORY => {
                            self.out.write_sleb(i64::from(export.index));
                        }
                        kind => bail!("unsupported export type: {kind}"),
                    }
                }
            }
        }

        self.out.end_section(section);
        Ok(())
    }

    /// A single segment at table index 0, offset 0. The inputs' function indices are table slots
    /// in the combined table by construction, so they are copied through.
    fn write_elem_section(&mut self, symtab: &SymbolTable, layout: &Layout) {
        if layout.total_elements == 0 {
            return;
        }
        let section = self.out.begin_section(wasm::SEC_ELEM);
        self.out.write_uleb(1);
        self.out.write_uleb(0);
        self.out.write_init_expr(wasm::InitExpr::I32Const(0));
        self.out.write_uleb(layout.total_elements);
        for &file_id in &symtab.object_files {
            for segment in &symtab.object(file_id).module.elements {
                for &function_index in &segment.functions {
                    self.out.write_uleb(function_index);
                }
            }
        }
        self.out.end_section(section);
    }

    fn write_code_section(&mut self, symtab: &mut SymbolTable, layout: &Layout) -> Result {
        if layout.total_functions == 0 {
            return Ok(());
        }
        let section = self.out.begin_section(wasm::SEC_CODE);
        self.out.write_uleb(layout.total_functions);
        let contents_start = self.out.tell();
        let object_files = symtab.object_files.clone();
        for file_id in object_files {
            let object = symtab.object(file_id);
            let Some(code) = object.module.code else {
                continue;
            };
            let offset = (self.out.tell() - contents_start) as u32;

            // Copy so relocations can be applied without touching the input.
            let mut buffer = code.to_vec();
            apply_code_relocations(object, symtab, &mut buffer)?;

            // The payload's leading function count doesn't survive concatenation.
            let (_, count_width) = leb::decode_uleb(&buffer)
                .with_context(|| format!("{object}: truncated code section"))?;
            self.out.write_bytes(&buffer[count_width..]);

            symtab.object_mut(file_id).code_section_offset = offset;
        }
        self.out.end_section(section);
        Ok(())
    }

    fn write_data_section(&mut self, symtab: &SymbolTable, layout: &Layout) -> Result {
        if layout.total_data_segments == 0 {
            return Ok(());
        }
        let section = self.out.begin_section(wasm::SEC_DATA);
        self.out.write_uleb(layout.total_data_segments);
        for &file_id in &symtab.object_files {
            let object = symtab.object(file_id);
            debug_assert!(object.module.data_segments.len() <= 1);
            for segment in &object.module.data_segments {
                let new_offset = segment
                    .offset
                    .i32_value()?
                    .wrapping_add(object.data_offset as i32);
                self.out.write_uleb(segment.memory_index);
                self.out.write_u8(wasm::OPCODE_I32_CONST);
                self.out.write_sleb(i64::from(new_offset));
                self.out.write_u8(wasm::OPCODE_END);
                self.out.write_uleb(segment.data.len() as u32);
                self.out.write_bytes(segment.data);
            }
        }
        self.out.end_section(section);
        Ok(())
    }

    fn write_reloc_section(&mut self, symtab: &SymbolTable, layout: &Layout) -> Result {
        if layout.total_code_relocations == 0 {
            return Ok(());
        }
        let section = self.out.begin_section(wasm::SEC_CUSTOM);
        self.out.write_str("reloc.CODE");
        self.out.write_uleb(u32::from(wasm::SEC_CODE));
        self.out.write_uleb(layout.total_code_relocations);
        for &file_id in &symtab.object_files {
            let object = symtab.object(file_id);
            if object.module.code.is_none() {
                continue;
            }
            for reloc in &object.module.code_relocations {
                let index = match reloc.kind {
                    RelocKind::TypeIndexLeb => object.relocate_type_index(reloc.index),
                    RelocKind::FunctionIndexLeb => {
                        object.relocate_function_index(symtab, reloc.index)?
                    }
                    RelocKind::TableIndexI32 | RelocKind::TableIndexSleb => {
                        object.relocate_table_index(reloc.index)
                    }
                    RelocKind::GlobalIndexLeb => {
                        object.relocate_global_index(symtab, reloc.index)?
                    }
                    // The record's index field stays a global index; resolving to an address
                    // would change the record's meaning, so only the offset shift is applied.
                    RelocKind::GlobalAddrLeb
                    | RelocKind::GlobalAddrSleb
                    | RelocKind::GlobalAddrI32 => {
                        object.global_index_offset.wrapping_add(reloc.index)
                    }
                };
                self.out.write_uleb(reloc.kind.code());
                self.out.write_uleb(object.relocate_code_offset(reloc.offset));
                self.out.write_uleb(index);
                if reloc.kind.has_addend() {
                    self.out.write_uleb(reloc.addend);
                }
            }
        }
        self.out.end_section(section);
        Ok(())
    }

    /// One function-names sub-section, all imported-function names ahead of locally-defined
    /// ones. Names that coalesced onto one symbol are emitted once: the first pass counts while
    /// raising each symbol's transient flag, the second emits while lowering it.
    fn write_name_section(&mut self, symtab: &mut SymbolTable) -> Result {
        let object_files = symtab.object_files.clone();

        let mut name_count = 0u32;
        for &file_id in &object_files {
            let num_symbols = symtab.object(file_id).module.symbols.len() as u32;
            for index in 0..num_symbols {
                let wasm_symbol = *symtab.object(file_id).wasm_symbol(index);
                if wasm_symbol.kind != wasm::WasmSymbolKind::DebugFunctionName {
                    continue;
                }
                let object = symtab.object(file_id);
                if object.is_resolved_function_import(symtab, wasm_symbol.element_index) {
                    continue;
                }
                if let Some(id) = symtab.find(wasm_symbol.name) {
                    if symtab.symbol(id).written_to_symtab {
                        continue;
                    }
                    symtab.symbol_mut(id).written_to_symtab = true;
                }
                name_count += 1;
            }
        }
        if name_count == 0 {
            return Ok(());
        }

        let section = self.out.begin_section(wasm::SEC_CUSTOM);
        self.out.write_str("name");
        let sub_section = self.out.begin_section(wasm::NAMES_FUNCTION as u8);
        self.out.write_uleb(name_count);
        for imported_names in [true, false] {
            for &file_id in &object_files {
                let num_symbols = symtab.object(file_id).module.symbols.len() as u32;
                for index in 0..num_symbols {
                    let wasm_symbol = *symtab.object(file_id).wasm_symbol(index);
                    if wasm_symbol.kind != wasm::WasmSymbolKind::DebugFunctionName {
                        continue;
                    }
                    let object = symtab.object(file_id);
                    if object.is_imported_function(wasm_symbol.element_index) != imported_names {
                        continue;
                    }
                    if object.is_resolved_function_import(symtab, wasm_symbol.element_index) {
                        continue;
                    }
                    if let Some(id) = symtab.find(wasm_symbol.name) {
                        if !symtab.symbol(id).written_to_symtab {
                            continue;
                        }
                        symtab.symbol_mut(id).written_to_symtab = false;
                    }
                    let function_index = symtab
                        .object(file_id)
                        .relocate_function_index(symtab, wasm_symbol.element_index)?;
                    self.out.write_uleb(function_index);
                    self.out.write_str(wasm_symbol.name);
                }
            }
        }
        self.out.end_section(sub_section);
        self.out.end_section(section);
        Ok(())
    }
}

/// Patches every code relocation into `buffer`, a copy of the input's code section. Values are
/// re-encoded at the immediates' original 5-byte width, so the buffer's length and every other
/// offset in it are preserved.
fn apply_code_relocations(
    object: &ObjectFile,
    symtab: &SymbolTable,
    buffer: &mut [u8],
) -> Result {
    for reloc in &object.module.code_relocations {
        let new_value: i64 = match reloc.kind {
            RelocKind::TypeIndexLeb => i64::from(object.relocate_type_index(reloc.index)),
            RelocKind::FunctionIndexLeb => {
                i64::from(object.relocate_function_index(symtab, reloc.index)?)
            }
            RelocKind::TableIndexI32 | RelocKind::TableIndexSleb => {
                i64::from(object.relocate_table_index(reloc.index)) + i64::from(reloc.addend)
            }
            RelocKind::GlobalIndexLeb => {
                i64::from(object.relocate_global_index(symtab, reloc.index)?)
                    + i64::from(reloc.addend)
            }
            RelocKind::GlobalAddrLeb | RelocKind::GlobalAddrSleb | RelocKind::GlobalAddrI32 => {
                object.global_address(reloc.index)? + i64::from(reloc.addend)
            }
        };
        tracing::debug!(
            "apply reloc kind={:?} offset={:#x} index={} new={new_value}",
            reloc.kind,
            reloc.offset,
            reloc.index
        );

        let offset = reloc.offset as usize;
        let Some(slot) = buffer.get_mut(offset..offset + leb::MAX_WIDTH) else {
            bail!("{object}: relocation offset {offset:#x} is outside the code section");
        };
        match reloc.kind {
            RelocKind::TypeIndexLeb
            | RelocKind::FunctionIndexLeb
            | RelocKind::GlobalAddrLeb
            | RelocKind::GlobalIndexLeb => {
                ensure!(
                    (0..=i64::from(u32::MAX)).contains(&new_value),
                    "{object}: relocated value {new_value} does not fit in an unsigned immediate"
                );
                leb::encode_uleb_padded(new_value as u64, leb::MAX_WIDTH, slot);
            }
            RelocKind::TableIndexSleb | RelocKind::GlobalAddrSleb => {
                ensure!(
                    (i64::from(i32::MIN)..=i64::from(i32::MAX)).contains(&new_value),
                    "{object}: relocated value {new_value} does not fit in a signed immediate"
                );
                leb::encode_sleb_padded(new_value, leb::MAX_WIDTH, slot);
            }
            RelocKind::TableIndexI32 | RelocKind::GlobalAddrI32 => {
                bail!("unimplemented relocation kind: {:?}", reloc.kind);
            }
        }
    }
    Ok(())
}

struct SectionBookkeeping {
    size_offset: usize,
    contents_offset: usize,
}

/// The emitter's seekable byte sink. Sections are appended; the size placeholder is rewritten in
/// place once a section ends.
struct OutputBuffer {
    bytes: Vec<u8>,
}

impl OutputBuffer {
    fn new() -> OutputBuffer {
        OutputBuffer { bytes: Vec::new() }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    fn tell(&self) -> usize {
        self.bytes.len()
    }

    fn write_u8(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    fn write_u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn write_uleb(&mut self, value: u32) {
        leb::encode_uleb(u64::from(value), &mut self.bytes);
    }

    fn write_sleb(&mut self, value: i64) {
        leb::encode_sleb(value, &mut self.bytes);
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    fn write_str(&mut self, value: &str) {
        self.write_name(value.as_bytes());
    }

    fn write_name(&mut self, bytes: &[u8]) {
        self.write_uleb(bytes.len() as u32);
        self.write_bytes(bytes);
    }

    fn write_init_expr(&mut self, expr: wasm::InitExpr) {
        match expr {
            wasm::InitExpr::I32Const(value) => {
                self.write_u8(wasm::OPCODE_I32_CONST);
                self.write_sleb(i64::from(value));
            }
            wasm::InitExpr::I64Const(value) => {
                self.write_u8(wasm::OPCODE_I64_CONST);
                self.write_sleb(value);
            }
            wasm::InitExpr::GetGlobal(index) => {
                self.write_u8(wasm::OPCODE_GET_GLOBAL);
                self.write_uleb(index);
            }
        }
        self.write_u8(wasm::OPCODE_END);
    }

    /// The 5-byte padding keeps the placeholder from growing when the real size lands in it.
    fn begin_section(&mut self, section_type: u8) -> SectionBookkeeping {
        self.write_u8(section_type);
        let size_offset = self.tell();
        let mut placeholder = [0u8; leb::MAX_WIDTH];
        leb::encode_uleb_padded(0, leb::MAX_WIDTH, &mut placeholder);
        self.write_bytes(&placeholder);
        SectionBookkeeping {
            size_offset,
            contents_offset: self.tell(),
        }
    }

    fn end_section(&mut self, section: SectionBookkeeping) {
        let size = (self.tell() - section.contents_offset) as u64;
        leb::encode_uleb_padded(
            size,
            leb::MAX_WIDTH,
            &mut self.bytes[section.size_offset..section.size_offset + leb::MAX_WIDTH],
        );
    }
}
