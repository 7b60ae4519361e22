//! The note records inside the dump's PT_NOTE segment. Only two of them matter
//! here: NT_FILE, the table of memory ranges backed by mapped files (see
//! fill_files_note in the kernel's fs/binfmt_elf.c), and NT_AUXV, the process's
//! auxiliary vector at crash time. Everything else is skipped.
use super::Stream;
use crate::error::{Error, Result};
use std::collections::BTreeMap;

pub const NT_AUXV: u32 = 6;
pub const NT_FILE: u32 = 0x46494c45;

/// Half-open `[start, end)` virtual address range.
pub type FileRange = (u64, u64);

/// Where a mapped file's content can be found again, so the segment bytes don't
/// have to ship with the core.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MappedFile {
    /// Byte offset into the file at which the range was mapped.
    pub offset: u64,

    /// Absolute path of the file.
    pub path: String,
}

/// The NT_FILE table keyed by address range. Lookups are exact-match only: the
/// kernel produces non-overlapping ranges and the filter compares whole
/// segments against them.
pub type FileMappings = BTreeMap<FileRange, MappedFile>;

// Widened so a hostile size near u32::MAX can't wrap; the bounds check in
// Stream::skip turns the oversized result into a format error.
fn align_to_word(n: u32) -> u64 {
    (n as u64 + 3) & !3
}

/// One decoded note record. The description is borrowed from the note buffer.
pub struct Note<'a> {
    pub ntype: u32,
    pub desc: &'a [u8],
}

/// Walks the note segment's record list: a 12-byte header (namesz, descsz,
/// type), then the name and description each padded to a 4-byte boundary.
/// Stops after the first malformed record.
pub struct NoteIter<'a> {
    s: Stream<'a>,
    failed: bool,
}

impl<'a> NoteIter<'a> {
    pub fn new(note_buf: &'a [u8], little_endian: bool) -> Self {
        NoteIter {
            // Note headers are u32s regardless of class.
            s: Stream::new(note_buf, little_endian, false),
            failed: false,
        }
    }

    fn read_record(&mut self) -> Result<Note<'a>> {
        let namesz = self.s.read_word()?;
        let descsz = self.s.read_word()?;
        let ntype = self.s.read_word()?;
        self.s.skip(align_to_word(namesz) as usize)?;
        let desc = self.s.slice(descsz as usize)?;
        // The trailing pad can be absent when the record is the last one.
        let pad = (align_to_word(descsz) - descsz as u64) as usize;
        self.s.skip(pad.min(self.s.remaining()))?;
        Ok(Note { ntype, desc })
    }
}

impl<'a> Iterator for NoteIter<'a> {
    type Item = Result<Note<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.s.remaining() < 12 {
            return None;
        }
        match self.read_record() {
            Ok(note) => Some(Ok(note)),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

fn find_note<'a>(
    note_buf: &'a [u8],
    little_endian: bool,
    wanted: u32,
    what: &str,
) -> Result<&'a [u8]> {
    for note in NoteIter::new(note_buf, little_endian) {
        let note = note?;
        if note.ntype == wanted {
            return Ok(note.desc);
        }
    }
    Err(Error::format(format!("no {what} note in dump")))
}

/// Builds the file-mapping table from the NT_FILE note. The description is laid
/// out as count, page size, then (start, end, offset) triples, then the packed
/// null-terminated file names, all integers class-sized:
///
///   Number of mapped files
///   Page size
///   Start address of file 1
///   End address of file 1
///   Offset of file 1 (in pages)
///   ...
///   File name 1
///   File name 2
///   ...
pub fn decode_file_mappings(
    note_buf: &[u8],
    little_endian: bool,
    sixty_four_bit: bool,
) -> Result<FileMappings> {
    let desc = find_note(note_buf, little_endian, NT_FILE, "NT_FILE")?;
    let mut s = Stream::new(desc, little_endian, sixty_four_bit);

    let count = s.read_ulong()?;
    let page_size = s.read_ulong()?;

    let mut ranges = Vec::new();
    for _ in 0..count {
        let start = s.read_ulong()?;
        let end = s.read_ulong()?;
        let offset = s.read_ulong()?;
        ranges.push((start, end, offset));
    }

    let mut mappings = FileMappings::new();
    for (start, end, offset) in ranges {
        let path = s.read_string()?;
        let offset = offset
            .checked_mul(page_size)
            .ok_or_else(|| Error::format("file offset overflows"))?;
        mappings.insert((start, end), MappedFile { offset, path });
    }
    Ok(mappings)
}

/// Returns the NT_AUXV description verbatim; it's already in the same format as
/// /proc/[pid]/auxv.
pub fn decode_auxv(note_buf: &[u8], little_endian: bool) -> Result<Vec<u8>> {
    let desc = find_note(note_buf, little_endian, NT_AUXV, "NT_AUXV")?;
    Ok(desc.to_vec())
}
