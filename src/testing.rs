//! Test-only builders that assemble syntactically valid wasm object files and ar archives, so
//! tests can drive the whole pipeline from bytes they control.

use crate::leb;
use crate::wasm;

pub(crate) fn args(extra: &[&str]) -> crate::args::Args {
    crate::args::parse(extra.iter().copied()).expect("test arguments failed to parse")
}

enum ImportSpec {
    Function { module: String, field: String, sig_index: u32 },
    Global { module: String, field: String, value_type: i64 },
}

#[derive(Default)]
pub(crate) struct ObjectBuilder {
    signatures: Vec<(Vec<i64>, Option<i64>)>,
    imports: Vec<ImportSpec>,
    functions: Vec<(u32, Vec<u8>)>,
    tables: Vec<u32>,
    memories: Vec<u32>,
    globals: Vec<(i64, bool, i32)>,
    exports: Vec<(String, u8, u32)>,
    elements: Vec<u32>,
    data_segments: Vec<(u32, i32, Vec<u8>)>,
    relocs: Vec<wasm::Relocation>,
    weak_names: Vec<String>,
    function_names: Vec<(u32, String)>,
}

impl ObjectBuilder {
    pub(crate) fn new() -> ObjectBuilder {
        ObjectBuilder::default()
    }

    pub(crate) fn signature(&mut self, params: &[i64], ret: Option<i64>) -> &mut Self {
        self.signatures.push((params.to_vec(), ret));
        self
    }

    pub(crate) fn import_function(&mut self, module: &str, field: &str, sig_index: u32) -> &mut Self {
        self.imports.push(ImportSpec::Function {
            module: module.to_owned(),
            field: field.to_owned(),
            sig_index,
        });
        self
    }

    pub(crate) fn import_global(&mut self, module: &str, field: &str, value_type: i64) -> &mut Self {
        self.imports.push(ImportSpec::Global {
            module: module.to_owned(),
            field: field.to_owned(),
            value_type,
        });
        self
    }

    pub(crate) fn function(&mut self, sig_index: u32, body: &[u8]) -> &mut Self {
        self.functions.push((sig_index, body.to_vec()));
        self
    }

    pub(crate) fn table(&mut self, initial: u32) -> &mut Self {
        self.tables.push(initial);
        self
    }

    pub(crate) fn memory(&mut self, pages: u32) -> &mut Self {
        self.memories.push(pages);
        self
    }

    pub(crate) fn global(&mut self, value_type: i64, mutable: bool, init: i32) -> &mut Self {
        self.globals.push((value_type, mutable, init));
        self
    }

    pub(crate) fn export_function(&mut self, name: &str, index: u32) -> &mut Self {
        self.exports.push((name.to_owned(), wasm::EXTERNAL_FUNCTION, index));
        self
    }

    pub(crate) fn export_global(&mut self, name: &str, index: u32) -> &mut Self {
        self.exports.push((name.to_owned(), wasm::EXTERNAL_GLOBAL, index));
        self
    }

    pub(crate) fn element(&mut self, functions: &[u32]) -> &mut Self {
        self.elements.extend_from_slice(functions);
        self
    }

    pub(crate) fn data(&mut self, offset: i32, bytes: Vec<u8>) -> &mut Self {
        self.data_segments.push((0, offset, bytes));
        self
    }

    pub(crate) fn reloc(&mut self, kind: wasm::RelocKind, offset: u32, index: u32, addend: u32) -> &mut Self {
        self.relocs.push(wasm::Relocation {
            kind,
            offset,
            index,
            addend,
        });
        self
    }

    pub(crate) fn weak(&mut self, name: &str) -> &mut Self {
        self.weak_names.push(name.to_owned());
        self
    }

    pub(crate) fn function_name(&mut self, index: u32, name: &str) -> &mut Self {
        self.function_names.push((index, name.to_owned()));
        self
    }

    /// Offset of `byte` within `function`'s body, relative to the start of the code section
    /// contents. Valid once all functions have been added; this is where relocations point.
    pub(crate) fn code_offset_of_function_byte(&self, function: usize, byte: usize) -> u32 {
        let mut offset = leb::uleb_width(self.functions.len() as u64);
        for (i, (_, body)) in self.functions.iter().enumerate() {
            offset += leb::uleb_width(body.len() as u64);
            if i == function {
                return (offset + byte) as u32;
            }
            offset += body.len();
        }
        panic!("no function {function}");
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&wasm::MAGIC);
        out.extend_from_slice(&wasm::VERSION.to_le_bytes());

        if !self.signatures.is_empty() {
            let mut payload = Vec::new();
            uleb(&mut payload, self.signatures.len() as u32);
            for (params, ret) in &self.signatures {
                sleb(&mut payload, wasm::TYPE_FUNC);
                uleb(&mut payload, params.len() as u32);
                for &param in params {
                    sleb(&mut payload, param);
                }
                match ret {
                    None => uleb(&mut payload, 0),
                    Some(ret) => {
                        uleb(&mut payload, 1);
                        sleb(&mut payload, *ret);
                    }
                }
            }
            section(&mut out, wasm::SEC_TYPE, payload);
        }

        if !self.imports.is_empty() {
            let mut payload = Vec::new();
            uleb(&mut payload, self.imports.len() as u32);
            for import in &self.imports {
                match import {
                    ImportSpec::Function { module, field, sig_index } => {
                        string(&mut payload, module);
                        string(&mut payload, field);
                        payload.push(wasm::EXTERNAL_FUNCTION);
                        uleb(&mut payload, *sig_index);
                    }
                    ImportSpec::Global { module, field, value_type } => {
                        string(&mut payload, module);
                        string(&mut payload, field);
                        payload.push(wasm::EXTERNAL_GLOBAL);
                        sleb(&mut payload, *value_type);
                        uleb(&mut payload, 0);
                    }
                }
            }
            section(&mut out, wasm::SEC_IMPORT, payload);
        }

        if !self.functions.is_empty() {
            let mut payload = Vec::new();
            uleb(&mut payload, self.functions.len() as u32);
            for (sig_index, _) in &self.functions {
                uleb(&mut payload, *sig_index);
            }
            section(&mut out, wasm::SEC_FUNCTION, payload);
        }

        if !self.tables.is_empty() {
            let mut payload = Vec::new();
            uleb(&mut payload, self.tables.len() as u32);
            for &initial in &self.tables {
                sleb(&mut payload, wasm::TYPE_ANYFUNC);
                uleb(&mut payload, 0);
                uleb(&mut payload, initial);
            }
            section(&mut out, wasm::SEC_TABLE, payload);
        }

        if !self.memories.is_empty() {
            let mut payload = Vec::new();
            uleb(&mut payload, self.memories.len() as u32);
            for &initial in &self.memories {
                uleb(&mut payload, 0);
                uleb(&mut payload, initial);
            }
            section(&mut out, wasm::SEC_MEMORY, payload);
        }

        if !self.globals.is_empty() {
            let mut payload = Vec::new();
            uleb(&mut payload, self.globals.len() as u32);
            for (value_type, mutable, init) in &self.globals {
                sleb(&mut payload, *value_type);
                uleb(&mut payload, u32::from(*mutable));
                i32_const(&mut payload, *init);
            }
            section(&mut out, wasm::SEC_GLOBAL, payload);
        }

        if !self.exports.is_empty() {
            let mut payload = Vec::new();
            uleb(&mut payload, self.exports.len() as u32);
            for (name, kind, index) in &self.exports {
                string(&mut payload, name);
                payload.push(*kind);
                uleb(&mut payload, *index);
            }
            section(&mut out, wasm::SEC_EXPORT, payload);
        }

        if !self.elements.is_empty() {
            let mut payload = Vec::new();
            uleb(&mut payload, 1);
            uleb(&mut payload, 0);
            i32_const(&mut payload, 0);
            uleb(&mut payload, self.elements.len() as u32);
            for &function in &self.elements {
                uleb(&mut payload, function);
            }
            section(&mut out, wasm::SEC_ELEM, payload);
        }

        if !self.functions.is_empty() {
            let mut payload = Vec::new();
            uleb(&mut payload, self.functions.len() as u32);
            for (_, body) in &self.functions {
                uleb(&mut payload, body.len() as u32);
                payload.extend_from_slice(body);
            }
            section(&mut out, wasm::SEC_CODE, payload);
        }

        if !self.data_segments.is_empty() {
            let mut payload = Vec::new();
            uleb(&mut payload, self.data_segments.len() as u32);
            for (memory_index, offset, bytes) in &self.data_segments {
                uleb(&mut payload, *memory_index);
                i32_const(&mut payload, *offset);
                uleb(&mut payload, bytes.len() as u32);
                payload.extend_from_slice(bytes);
            }
            section(&mut out, wasm::SEC_DATA, payload);
        }

        if !self.weak_names.is_empty() {
            let mut sub = Vec::new();
            uleb(&mut sub, self.weak_names.len() as u32);
            for name in &self.weak_names {
                string(&mut sub, name);
                uleb(&mut sub, wasm::SYMBOL_FLAG_WEAK);
            }
            let mut payload = Vec::new();
            uleb(&mut payload, wasm::LINKING_SYMBOL_INFO);
            uleb(&mut payload, sub.len() as u32);
            payload.extend_from_slice(&sub);
            custom_section(&mut out, "linking", payload);
        }

        if !self.relocs.is_empty() {
            let mut payload = Vec::new();
            uleb(&mut payload, u32::from(wasm::SEC_CODE));
            uleb(&mut payload, self.relocs.len() as u32);
            for reloc in &self.relocs {
                uleb(&mut payload, reloc.kind.code());
                uleb(&mut payload, reloc.offset);
                uleb(&mut payload, reloc.index);
                if reloc.kind.has_addend() {
                    uleb(&mut payload, reloc.addend);
                }
            }
            custom_section(&mut out, "reloc.CODE", payload);
        }

        if !self.function_names.is_empty() {
            let mut sub = Vec::new();
            uleb(&mut sub, self.function_names.len() as u32);
            for (index, name) in &self.function_names {
                uleb(&mut sub, *index);
                string(&mut sub, name);
            }
            let mut payload = Vec::new();
            uleb(&mut payload, wasm::NAMES_FUNCTION);
            uleb(&mut payload, sub.len() as u32);
            payload.extend_from_slice(&sub);
            custom_section(&mut out, "name", payload);
        }

        out
    }
}

fn uleb(out: &mut Vec<u8>, value: u32) {
    leb::encode_uleb(u64::from(value), out);
}

fn sleb(out: &mut Vec<u8>, value: i64) {
    leb::encode_sleb(value, out);
}

fn string(out: &mut Vec<u8>, value: &str) {
    uleb(out, value.len() as u32);
    out.extend_from_slice(value.as_bytes());
}

fn i32_const(out: &mut Vec<u8>, value: i32) {
    out.push(wasm::OPCODE_I32_CONST);
    sleb(out, i64::from(value));
    out.push(wasm::OPCODE_END);
}

fn section(out: &mut Vec<u8>, id: u8, payload: Vec<u8>) {
    out.push(id);
    uleb(out, payload.len() as u32);
    out.extend_from_slice(&payload);
}

fn custom_section(out: &mut Vec<u8>, name: &str, payload: Vec<u8>) {
    let mut contents = Vec::new();
    string(&mut contents, name);
    contents.extend_from_slice(&payload);
    section(out, wasm::SEC_CUSTOM, contents);
}

struct MemberSpec {
    name: String,
    data: Vec<u8>,
    symbols: Vec<String>,
}

/// Assembles GNU-style ar archives, including the symbol-table member that lazy loading walks.
#[derive(Default)]
pub(crate) struct ArchiveBuilder {
    members: Vec<MemberSpec>,
}

impl ArchiveBuilder {
    pub(crate) fn new() -> ArchiveBuilder {
        ArchiveBuilder::default()
    }

    pub(crate) fn member(mut self, name: &str, data: Vec<u8>) -> Self {
        self.members.push(MemberSpec {
            name: name.to_owned(),
            data,
            symbols: Vec::new(),
        });
        self
    }

    pub(crate) fn member_defining(mut self, name: &str, data: Vec<u8>, symbols: &[&str]) -> Self {
        self.members.push(MemberSpec {
            name: name.to_owned(),
            data,
            symbols: symbols.iter().map(|s| (*s).to_owned()).collect(),
        });
        self
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let total_symbols: usize = self.members.iter().map(|m| m.symbols.len()).sum();
        let symtab_size = if total_symbols > 0 {
            4 + 4 * total_symbols
                + self
                    .members
                    .iter()
                    .flat_map(|m| &m.symbols)
                    .map(|s| s.len() + 1)
                    .sum::<usize>()
        } else {
            0
        };

        // Member header offsets are known up front: magic, then the symbol table (if any), then
        // each member with its data padded to an even length.
        let mut offset = 8;
        if total_symbols > 0 {
            offset += 60 + symtab_size + symtab_size % 2;
        }
        let mut member_offsets = Vec::new();
        for member in &self.members {
            member_offsets.push(offset as u32);
            offset += 60 + member.data.len() + member.data.len() % 2;
        }

        let mut out = Vec::new();
        out.extend_from_slice(crate::archive::ARCHIVE_MAGIC);
        if total_symbols > 0 {
            let mut symtab = Vec::new();
            symtab.extend_from_slice(&(total_symbols as u32).to_be_bytes());
            for (member, &member_offset) in self.members.iter().zip(&member_offsets) {
                for _ in &member.symbols {
                    symtab.extend_from_slice(&member_offset.to_be_bytes());
                }
            }
            for member in &self.members {
                for symbol in &member.symbols {
                    symtab.extend_from_slice(symbol.as_bytes());
                    symtab.push(0);
                }
            }
            write_member(&mut out, "/", &symtab);
        }
        for member in &self.members {
            write_member(&mut out, &format!("{}/", member.name), &member.data);
        }
        out
    }
}

fn write_member(out: &mut Vec<u8>, ident: &str, data: &[u8]) {
    assert!(ident.len() <= 16, "long archive member names aren't needed in tests");
    let mut header = [b' '; 60];
    header[..ident.len()].copy_from_slice(ident.as_bytes());
    // Timestamp, owner, group and mode don't matter to the reader.
    header[16] = b'0';
    header[28] = b'0';
    header[34] = b'0';
    header[40] = b'0';
    let size = data.len().to_string();
    header[48..48 + size.len()].copy_from_slice(size.as_bytes());
    header[58] = 0x60;
    header[59] = b'\n';
    out.extend_from_slice(&header);
    out.extend_from_slice(data);
    if data.len() % 2 != 0 {
        out.push(b'\n');
    }
}
