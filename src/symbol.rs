use crate::input_files::FileId;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::BuildHasher;
use std::hash::Hasher;

/// An index into the symbol table's symbol vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct SymbolId(u32);

impl SymbolId {
    pub(crate) fn new(value: usize) -> SymbolId {
        SymbolId(value as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SymbolKind {
    DefinedFunction,
    DefinedGlobal,
    UndefinedFunction,
    UndefinedGlobal,
    Lazy,
}

impl SymbolKind {
    pub(crate) fn is_defined(self) -> bool {
        matches!(self, SymbolKind::DefinedFunction | SymbolKind::DefinedGlobal)
    }

    pub(crate) fn is_undefined(self) -> bool {
        matches!(self, SymbolKind::UndefinedFunction | SymbolKind::UndefinedGlobal)
    }

    pub(crate) fn is_function(self) -> bool {
        matches!(self, SymbolKind::DefinedFunction | SymbolKind::UndefinedFunction)
    }
}

impl Display for SymbolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SymbolKind::DefinedFunction => "DefinedFunction",
            SymbolKind::DefinedGlobal => "DefinedGlobal",
            SymbolKind::UndefinedFunction => "UndefinedFunction",
            SymbolKind::UndefinedGlobal => "UndefinedGlobal",
            SymbolKind::Lazy => "Lazy",
        };
        name.fmt(f)
    }
}

/// A named entity aggregated across inputs. Back-references into inputs are stored as
/// `(file, index)` pairs rather than pointers; the inputs' parsed vectors are immutable after
/// parsing, so the indices stay valid.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Symbol {
    pub(crate) kind: SymbolKind,
    /// The input that contributed the current definition or reference.
    pub(crate) file: Option<FileId>,
    /// Index into `file`'s wasm symbol vector, absent for synthesized symbols.
    pub(crate) wasm_symbol: Option<u32>,
    /// For `Lazy`, the index into `file`'s archive symbol table naming the pullable member.
    pub(crate) archive_symbol: Option<u32>,
    output_index: Option<u32>,
    /// Transient marker used by the name-section emitter to coalesce duplicates.
    pub(crate) written_to_symtab: bool,
}

impl Symbol {
    pub(crate) fn new(kind: SymbolKind) -> Symbol {
        Symbol {
            kind,
            file: None,
            wasm_symbol: None,
            archive_symbol: None,
            output_index: None,
            written_to_symtab: false,
        }
    }

    pub(crate) fn has_output_index(&self) -> bool {
        self.output_index.is_some()
    }

    pub(crate) fn output_index(&self) -> Option<u32> {
        self.output_index
    }

    /// Output indices are assigned exactly once; a second write is a linker bug.
    pub(crate) fn set_output_index(&mut self, index: u32) {
        assert!(
            self.output_index.is_none(),
            "attempted to assign a second output index ({index})"
        );
        self.output_index = Some(index);
    }
}

/// A symbol name along with a precomputed hash. Hashing happens once at parse time; the interning
/// map then uses the pass-through hasher below.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct SymbolName<'data> {
    hash: u64,
    bytes: &'data [u8],
}

impl<'data> std::hash::Hash for SymbolName<'data> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl<'data> SymbolName<'data> {
    pub(crate) fn new(bytes: &'data [u8]) -> SymbolName<'data> {
        Self {
            bytes,
            hash: fxhash::hash64(bytes),
        }
    }

    pub(crate) fn bytes(&self) -> &'data [u8] {
        self.bytes
    }
}

impl<'data> Display for SymbolName<'data> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        String::from_utf8_lossy(self.bytes).fmt(f)
    }
}

pub(crate) type SymbolNameMap<'data, V> = HashMap<SymbolName<'data>, V, PassThroughHasher>;

#[derive(Default)]
pub(crate) struct PassThroughHasher {
    hash: u64,
}

impl Hasher for PassThroughHasher {
    fn finish(&self) -> u64 {
        self.hash
    }

    fn write_u64(&mut self, i: u64) {
        self.hash = i;
    }

    fn write(&mut self, _bytes: &[u8]) {
        panic!("PassThroughHasher used with inappropriate hash implementation");
    }
}

impl BuildHasher for PassThroughHasher {
    type Hasher = PassThroughHasher;

    fn build_hasher(&self) -> Self::Hasher {
        PassThroughHasher::default()
    }
}
