//! Computes the shape of the output module: import slots for symbols that stayed undefined,
//! renumbering offsets for every per-input index space, output indices for defined symbols, and
//! the layout of linear memory.

use crate::error::Result;
use crate::symbol::SymbolId;
use crate::symbol::SymbolKind;
use crate::symbol_db::SymbolTable;
use crate::wasm;
use anyhow::bail;
use anyhow::ensure;
use anyhow::Context;

#[derive(Default, Debug)]
pub(crate) struct Layout {
    /// Symbols that remained undefined and became function imports, in slot order.
    pub(crate) function_imports: Vec<SymbolId>,
    /// Symbols that remained undefined and became global imports, in slot order.
    pub(crate) global_imports: Vec<SymbolId>,
    /// Linker-injected globals. The stack pointer sits at index 0 and its value is filled in by
    /// the memory layout.
    pub(crate) synthetic_globals: Vec<SyntheticGlobal>,
    pub(crate) total_types: u32,
    pub(crate) total_functions: u32,
    pub(crate) total_globals: u32,
    pub(crate) total_table_length: u32,
    pub(crate) total_exports: u32,
    pub(crate) total_elements: u32,
    pub(crate) total_data_segments: u32,
    pub(crate) total_code_relocations: u32,
    pub(crate) total_data_relocations: u32,
    pub(crate) total_memory_pages: u32,
    pub(crate) max_memory_pages: Option<u32>,
}

#[derive(Debug)]
pub(crate) struct SyntheticGlobal {
    pub(crate) name: String,
    pub(crate) value: i32,
}

#[tracing::instrument(skip_all, name = "Layout")]
pub(crate) fn compute(symtab: &mut SymbolTable) -> Result<Layout> {
    let mut layout = Layout {
        synthetic_globals: symtab
            .args
            .synthetic_globals
            .iter()
            .map(|(name, value)| SyntheticGlobal {
                name: name.clone(),
                value: *value,
            })
            .collect(),
        ..Layout::default()
    };
    calculate_imports(symtab, &mut layout);
    calculate_offsets(symtab, &mut layout)?;
    assign_symbol_indexes(symtab)?;
    layout_memory(symtab, &mut layout)?;

    for &file_id in &symtab.object_files {
        let file = symtab.object(file_id);
        tracing::debug!(
            "[{file}] types@{} functions@{} globals@{} table@{} data@{:#x}",
            file.type_index_offset,
            file.function_index_offset as i32,
            file.global_index_offset as i32,
            file.table_index_offset,
            file.data_offset,
        );
    }
    Ok(layout)
}

/// Walks each input's symbols in order and gives every still-undefined one a slot in the
/// appropriate import space. Slot numbers are dense and start at 0 per space.
fn calculate_imports(symtab: &mut SymbolTable, layout: &mut Layout) {
    for i in 0..symtab.object_files.len() {
        let file_id = symtab.object_files[i];
        let symbols = symtab.object(file_id).symbols.clone();
        for id in symbols {
            let symbol = symtab.symbol(id);
            if symbol.has_output_index() || symbol.kind.is_defined() {
                continue;
            }
            if symbol.kind.is_function() {
                symtab
                    .symbol_mut(id)
                    .set_output_index(layout.function_imports.len() as u32);
                layout.function_imports.push(id);
            } else {
                symtab
                    .symbol_mut(id)
                    .set_output_index(layout.global_imports.len() as u32);
                layout.global_imports.push(id);
            }
        }
    }
}

/// Records each input's renumbering offsets while accumulating output totals, and rejects the
/// input shapes the combined module can't express.
fn calculate_offsets(symtab: &mut SymbolTable, layout: &mut Layout) -> Result {
    layout.total_globals = layout.synthetic_globals.len() as u32;
    let relocatable = symtab.args.relocatable;
    for i in 0..symtab.object_files.len() {
        let file_id = symtab.object_files[i];
        let num_function_imports = layout.function_imports.len() as u32;
        let num_global_imports = layout.global_imports.len() as u32;
        let file = symtab.object_mut(file_id);

        file.type_index_offset = layout.total_types;
        layout.total_types += file.module.signatures.len() as u32;

        file.function_index_offset = num_function_imports
            .wrapping_sub(file.function_import_symbols.len() as u32)
            .wrapping_add(layout.total_functions);
        layout.total_functions += file.module.function_types.len() as u32;

        if relocatable {
            file.global_index_offset = num_global_imports
                .wrapping_sub(file.global_import_symbols.len() as u32)
                .wrapping_add(layout.total_globals);
            layout.total_globals += file.module.globals.len() as u32;
        }

        if file.module.memories.len() > 1 {
            bail!("{file}: contains more than one memory");
        }

        match file.module.tables.len() {
            0 => {}
            1 => {
                file.table_index_offset = layout.total_table_length;
                layout.total_table_length += file.module.tables[0].limits.initial;
            }
            _ => bail!("{file}: contains more than one table"),
        }

        layout.total_exports += file.module.exports.len() as u32;

        match file.module.elements.len() {
            0 => {}
            1 => {
                let segment = &file.module.elements[0];
                if segment.table_index != 0 {
                    bail!("{file}: unsupported table index");
                }
                if segment.offset.i32_value()? != 0 {
                    bail!("{file}: unsupported element segment offset");
                }
                layout.total_elements += segment.functions.len() as u32;
            }
            _ => bail!("{file}: contains more than one element segment"),
        }

        layout.total_data_segments += file.module.data_segments.len() as u32;
        if file.module.code.is_some() {
            layout.total_code_relocations += file.module.code_relocations.len() as u32;
        }
        layout.total_data_relocations += file.module.data_relocations.len() as u32;
    }
    Ok(())
}

/// Gives every defined symbol its index in the combined function or global space, derived from
/// the defining input's offset and the definition's index within that input.
fn assign_symbol_indexes(symtab: &mut SymbolTable) -> Result {
    for i in 0..symtab.object_files.len() {
        let file_id = symtab.object_files[i];
        let symbols = symtab.object(file_id).symbols.clone();
        for id in symbols {
            let symbol = symtab.symbol(id);
            if symbol.has_output_index() || !symbol.kind.is_defined() {
                continue;
            }
            let kind = symbol.kind;
            let (Some(def_file), Some(wasm_symbol)) = (symbol.file, symbol.wasm_symbol) else {
                continue;
            };
            let def = symtab.object(def_file);
            let index = match kind {
                SymbolKind::DefinedFunction => def
                    .function_index_offset
                    .wrapping_add(def.exported_function_index(wasm_symbol)?),
                SymbolKind::DefinedGlobal => def
                    .global_index_offset
                    .wrapping_add(def.exported_global_index(wasm_symbol)?),
                _ => unreachable!(),
            };
            tracing::debug!("assigning index {index} to `{}` ({kind})", symtab.symbol_name(id));
            symtab.symbol_mut(id).set_output_index(index);
        }
    }
    Ok(())
}

/// Lays out linear memory: one reserved page, then the stack region (executable mode), then each
/// input's data block, rounded up to whole pages at the end.
fn layout_memory(symtab: &mut SymbolTable, layout: &mut Layout) -> Result {
    let args = symtab.args;
    let mut memory_ptr = wasm::PAGE_SIZE;
    if !args.relocatable {
        tracing::debug!("stack base = {memory_ptr:#x}");
        memory_ptr = memory_ptr
            .checked_add(args.stack_size)
            .context("stack size overflows the 32-bit address space")?;
        // The stack grows down; the pointer starts at the top of the region.
        if let Some(stack_pointer) = layout.synthetic_globals.first_mut() {
            stack_pointer.value = memory_ptr as i32;
        }
        tracing::debug!("stack top = {memory_ptr:#x}");
    }

    for i in 0..symtab.object_files.len() {
        let file_id = symtab.object_files[i];
        let file = symtab.object_mut(file_id);
        let initial_pages = file.module.initial_memory_pages();
        if initial_pages == 0 {
            continue;
        }
        file.data_offset = memory_ptr;
        tracing::debug!("[{file}] data offset = {memory_ptr:#x}");
        memory_ptr = initial_pages
            .checked_mul(wasm::PAGE_SIZE)
            .and_then(|bytes| memory_ptr.checked_add(bytes))
            .context("memory layout overflows the 32-bit address space")?;
    }

    let mem_size = memory_ptr
        .checked_next_multiple_of(wasm::PAGE_SIZE)
        .context("memory layout overflows the 32-bit address space")?;
    layout.total_memory_pages = mem_size / wasm::PAGE_SIZE;

    if args.initial_memory != 0 {
        ensure!(
            args.initial_memory % wasm::PAGE_SIZE == 0,
            "--initial-memory must be a multiple of the wasm page size"
        );
        let pages = args.initial_memory / wasm::PAGE_SIZE;
        ensure!(
            pages >= layout.total_memory_pages,
            "--initial-memory ({} pages) is smaller than the computed layout ({} pages)",
            pages,
            layout.total_memory_pages
        );
        layout.total_memory_pages = pages;
    }
    if args.max_memory != 0 {
        ensure!(
            args.max_memory % wasm::PAGE_SIZE == 0,
            "--max-memory must be a multiple of the wasm page size"
        );
        let pages = args.max_memory / wasm::PAGE_SIZE;
        ensure!(
            pages >= layout.total_memory_pages,
            "--max-memory ({} pages) is smaller than the initial memory ({} pages)",
            pages,
            layout.total_memory_pages
        );
        layout.max_memory_pages = Some(pages);
    }
    tracing::debug!("memory pages = {}", layout.total_memory_pages);
    Ok(())
}
