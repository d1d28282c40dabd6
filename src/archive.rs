//! Code to read ar files. We don't use the ar crate because it provides access to data only via
//! the Read trait and we want to borrow the data of each entry. We also need the GNU symbol-table
//! member, which member-loading is driven from and which the ar crate doesn't expose.

use crate::error::Result;
use anyhow::bail;
use anyhow::Context;
use bytemuck::Pod;
use bytemuck::Zeroable;

pub(crate) const ARCHIVE_MAGIC: &[u8] = b"!<arch>\n";

pub(crate) enum ArchiveEntry<'data> {
    Regular(ArchiveContent<'data>),
    Symbols(SymbolTable<'data>),
    Filenames(ExtendedFilenames<'data>),
}

#[derive(Clone, Copy)]
pub(crate) struct ExtendedFilenames<'data> {
    data: &'data [u8],
}

#[derive(Clone, Copy)]
pub(crate) struct Identifier<'data> {
    /// The start of the identifier. Where it ends is computed on demand.
    data: &'data [u8],
}

pub(crate) struct ArchiveContent<'data> {
    ident: &'data str,
    pub(crate) entry_data: &'data [u8],
}

/// The GNU symbol-table member ("/"). Lists, for each global symbol defined by some member, the
/// byte offset of that member's header within the archive.
#[derive(Clone, Copy)]
pub(crate) struct SymbolTable<'data> {
    data: &'data [u8],
}

/// One entry of the symbol-table member.
#[derive(Clone, Copy)]
pub(crate) struct ArchiveSymbol<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) member_offset: u32,
}

pub(crate) struct ArchiveIterator<'data> {
    data: &'data [u8],
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
struct EntryHeader {
    ident: [u8; 16],
    _timestamp: [u8; 12],
    _owner_id: [u8; 6],
    _group_id: [u8; 6],
    _mode: [u8; 8],
    size: [u8; 10],
    end: [u8; 2],
}

const _ASSERTS: () = {
    assert!(core::mem::size_of::<EntryHeader>() == 60);
};

const HEADER_SIZE: usize = core::mem::size_of::<EntryHeader>();

impl<'data> ArchiveIterator<'data> {
    /// Create an iterator from the bytes of the whole archive.
    pub(crate) fn from_archive_bytes(data: &'data [u8]) -> Result<Self> {
        let Some(rest) = data.strip_prefix(ARCHIVE_MAGIC) else {
            bail!("missing archive header");
        };
        Ok(Self { data: rest })
    }

    fn next_result(&mut self) -> Result<Option<ArchiveEntry<'data>>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        let (entry, consumed) = parse_entry(self.data)?;
        self.data = &self.data[consumed.min(self.data.len())..];
        Ok(Some(entry))
    }
}

impl<'data> Iterator for ArchiveIterator<'data> {
    type Item = Result<ArchiveEntry<'data>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_result().transpose()
    }
}

/// Parses the member whose header starts at `header_offset` within the whole archive file. This
/// is how symbol-table references are turned into member data without walking the archive.
pub(crate) fn member_at(archive_data: &[u8], header_offset: u32) -> Result<ArchiveContent> {
    let offset = header_offset as usize;
    if offset < ARCHIVE_MAGIC.len() || offset > archive_data.len() {
        bail!("archive member offset {offset} is out of range");
    }
    let (entry, _) = parse_entry(&archive_data[offset..])?;
    match entry {
        ArchiveEntry::Regular(content) => Ok(content),
        _ => bail!("archive member offset {offset} does not name a regular member"),
    }
}

fn parse_entry(data: &[u8]) -> Result<(ArchiveEntry, usize)> {
    if data.len() < HEADER_SIZE {
        bail!("short archive entry header");
    }
    let (header, rest) = data.split_at(HEADER_SIZE);
    let header: &EntryHeader = bytemuck::from_bytes(header);
    let size = parse_decimal_int(&header.size);
    if rest.len() < size {
        bail!("archive entry size is {size}, but only {} bytes left", rest.len());
    }
    let ident = std::str::from_utf8(&header.ident).context("archive ident is invalid UTF-8")?;
    let ident = ident.trim();
    let entry_data = &rest[..size];
    let entry = match ident {
        "/" => ArchiveEntry::Symbols(SymbolTable { data: entry_data }),
        "//" => ArchiveEntry::Filenames(ExtendedFilenames { data: entry_data }),
        _ => ArchiveEntry::Regular(ArchiveContent { ident, entry_data }),
    };
    let size_with_padding = size.next_multiple_of(2).min(rest.len());
    Ok((entry, HEADER_SIZE + size_with_padding))
}

fn parse_decimal_int(bytes: &[u8]) -> usize {
    let mut value = 0;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            break;
        }
        value = value * 10 + ((byte - b'0') as usize);
    }
    value
}

impl<'data> SymbolTable<'data> {
    /// Decodes the member: a big-endian count, that many big-endian member header offsets, then
    /// the same number of NUL-terminated symbol names.
    pub(crate) fn symbols(&self) -> Result<Vec<ArchiveSymbol<'data>>> {
        let mut data = self.data;
        let count = read_u32_be(&mut data).context("archive symbol table is truncated")?;
        let mut offsets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            offsets.push(read_u32_be(&mut data).context("archive symbol table is truncated")?);
        }
        let mut symbols = Vec::with_capacity(count as usize);
        for member_offset in offsets {
            let end = memchr::memchr(0, data)
                .context("archive symbol table has fewer names than offsets")?;
            symbols.push(ArchiveSymbol {
                name: &data[..end],
                member_offset,
            });
            data = &data[end + 1..];
        }
        Ok(symbols)
    }
}

fn read_u32_be(data: &mut &[u8]) -> Option<u32> {
    let (bytes, rest) = data.split_first_chunk::<4>()?;
    *data = rest;
    Some(u32::from_be_bytes(*bytes))
}

impl<'data> ArchiveContent<'data> {
    /// Returns the identifier (generally a filename) for this entry. The identifier may live in
    /// the entry's header or, for long names, in the extended filenames entry.
    pub(crate) fn identifier(
        &self,
        extended_filenames: Option<ExtendedFilenames<'data>>,
    ) -> Identifier<'data> {
        if let Some(filenames) = extended_filenames {
            if let Some(rest) = self.ident.strip_prefix('/') {
                if let Ok(offset) = rest.parse::<usize>() {
                    if offset <= filenames.data.len() {
                        return Identifier {
                            data: &filenames.data[offset..],
                        };
                    }
                }
            }
        }
        Identifier {
            data: self.ident.as_bytes(),
        }
    }
}

impl<'data> Identifier<'data> {
    pub(crate) fn as_slice(&self) -> &'data [u8] {
        let end = memchr::memchr2(b'/', b'\n', self.data).unwrap_or(self.data.len());
        &self.data[..end]
    }
}
