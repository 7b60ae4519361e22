//! The conversion pipeline: parse the incoming dump, decide which segments are
//! worth keeping, enforce the size budget, then emit the reduced core and the
//! auxv/maps side files. One invocation per crash event; on any failure the
//! destination is removed so a half-written core never survives.
use crate::budget::SizeBudget;
use crate::elf::{
    ElfHeader, FileMappings, ProgramHeader, SourceReader, Stream, decode_auxv,
    decode_file_mappings,
};
use crate::error::{Error, Result};
use log::{debug, info};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct CoredumpWriter<R: Read> {
    source: SourceReader<R>,
    coredump_path: PathBuf,
    proc_files_dir: PathBuf,
    size_limit: Option<u64>,
}

impl<R: Read> CoredumpWriter<R> {
    pub fn new(source: R, coredump_path: PathBuf, proc_files_dir: PathBuf) -> Self {
        CoredumpWriter {
            source: SourceReader::new(source),
            coredump_path,
            proc_files_dir,
            size_limit: None,
        }
    }

    /// Pins the size ceiling instead of deriving it from free disk space.
    pub fn with_size_limit(mut self, limit: u64) -> Self {
        self.size_limit = Some(limit);
        self
    }

    /// Runs the whole conversion. Returns the byte length of the written core.
    pub fn write(mut self) -> Result<u64> {
        // Exclusive create: an existing file means a prior crash report we
        // must not clobber.
        let mut dest = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.coredump_path)?;
        let result = self.write_to(&mut dest);
        drop(dest);
        if result.is_err() {
            let _ = fs::remove_file(&self.coredump_path);
        }
        result
    }

    fn write_to(&mut self, dest: &mut File) -> Result<u64> {
        let (header, program_headers, note_buf) = self.read_until_note()?;
        debug!(
            "parsed {} program headers, {} byte note segment",
            program_headers.len(),
            note_buf.len()
        );

        let mappings =
            decode_file_mappings(&note_buf, header.little_endian, header.sixty_four_bit)?;
        debug!("{} mapped files", mappings.len());

        // Segments backed by mapped files are useless to the report generator;
        // their bytes can be recovered from the files themselves.
        let filtered = filter_segments(&program_headers, &mappings)?;

        let budget = match self.size_limit {
            Some(limit) => SizeBudget::new(limit),
            None => SizeBudget::for_path(&self.coredump_path)?,
        };
        let last = filtered
            .last()
            .ok_or_else(|| Error::format("empty program header table"))?;
        let expected_size = last
            .offset
            .checked_add(last.file_size)
            .ok_or_else(|| Error::format("expected core size overflows"))?;
        budget.check(expected_size)?;
        debug!(
            "expected core size {expected_size} bytes (limit {})",
            budget.limit()
        );

        let auxv = decode_auxv(&note_buf, header.little_endian)?;
        self.write_auxv(&auxv)?;
        self.write_maps(&program_headers, &mappings)?;

        // ELF header, reproduced verbatim.
        dest.seek(SeekFrom::Start(0))?;
        dest.write_all(header.raw_bytes())?;

        // The rewritten program header table, directly after the header.
        for (i, ph) in filtered.iter().enumerate() {
            let slot = header.size() as u64 + i as u64 * header.ph_entry_size as u64;
            dest.seek(SeekFrom::Start(slot))?;
            dest.write_all(&ph.encode(header.little_endian, header.sixty_four_bit))?;
        }

        // The NOTE segment, verbatim at its (unchanged) offset.
        dest.seek(SeekFrom::Start(filtered[0].offset))?;
        dest.write_all(&note_buf)?;

        // Surviving payloads: re-read from the source at the original offsets,
        // land at the recomputed ones. The kernel emits segments in ascending
        // offset order so the forward-only source never has to back up.
        for i in 1..filtered.len() {
            if filtered[i].file_size == 0 {
                continue;
            }
            self.source.seek_forward(program_headers[i].offset)?;
            dest.seek(SeekFrom::Start(filtered[i].offset))?;
            self.source.copy_to(Some(dest), filtered[i].file_size)?;
        }

        info!(
            "wrote {expected_size} byte core dump to {}",
            self.coredump_path.display()
        );
        Ok(expected_size)
    }

    /// Reads the ELF header, the full program header table, and the leading
    /// NOTE segment off the stream, validating as it goes.
    fn read_until_note(&mut self) -> Result<(ElfHeader, Vec<ProgramHeader>, Vec<u8>)> {
        let header = ElfHeader::read(&mut self.source)?;

        self.source.seek_forward(header.ph_offset)?;
        let table_size = header.num_ph_entries as usize * header.ph_entry_size as usize;
        let mut table = vec![0u8; table_size];
        self.source.read_exact(&mut table)?;

        let mut s = Stream::new(&table, header.little_endian, header.sixty_four_bit);
        let mut program_headers = Vec::with_capacity(header.num_ph_entries as usize);
        for _ in 0..header.num_ph_entries {
            program_headers.push(ProgramHeader::parse(&mut s)?);
        }

        let (note_offset, note_size) = match program_headers.first() {
            Some(ph) if ph.is_note() => (ph.offset, ph.file_size),
            _ => return Err(Error::format("first segment is not PT_NOTE")),
        };

        self.source.seek_forward(note_offset)?;
        let mut note_buf = vec![0u8; note_size as usize];
        self.source.read_exact(&mut note_buf)?;

        Ok((header, program_headers, note_buf))
    }

    /// Side file matching /proc/[pid]/auxv: the NT_AUXV description as-is.
    fn write_auxv(&self, auxv: &[u8]) -> Result<()> {
        let mut file = create_side_file(&self.proc_files_dir.join("auxv"))?;
        file.write_all(auxv)?;
        Ok(())
    }

    /// Side file matching /proc/[pid]/maps: one line per original LOAD segment,
    /// in table order. Device and inode fields are always zero (the dump
    /// doesn't record them) and offset/path are only known for file-backed
    /// ranges.
    fn write_maps(
        &self,
        program_headers: &[ProgramHeader],
        mappings: &FileMappings,
    ) -> Result<()> {
        let mut file = create_side_file(&self.proc_files_dir.join("maps"))?;
        for ph in program_headers {
            if !ph.is_load() {
                continue;
            }
            let (start, end) = ph.vaddr_range()?;
            let (offset, path) = match mappings.get(&(start, end)) {
                Some(mapped) => (mapped.offset, mapped.path.as_str()),
                None => (0, ""),
            };
            writeln!(
                file,
                "{start:08x}-{end:08x} {} {offset:08x} {:02x}:{:02x} {} {path}",
                ph.perms(),
                0, // fake device major
                0, // fake device minor
                0, // fake inode
            )?;
        }
        Ok(())
    }
}

/// Rewrites the program header table for the reduced layout. Entry 0 (the NOTE
/// segment) passes through unchanged. Every later LOAD segment whose address
/// range exactly matches a mapped file loses its payload, and every later
/// entry's offset becomes the previous entry's end, rounded up to the entry's
/// own alignment. The result is a contiguous, gap-minimal layout whatever the
/// original looked like. Header fields are untrusted, so a recomputed offset
/// that wraps means the dump is malformed.
pub fn filter_segments(
    program_headers: &[ProgramHeader],
    mappings: &FileMappings,
) -> Result<Vec<ProgramHeader>> {
    let mut filtered: Vec<ProgramHeader> = Vec::with_capacity(program_headers.len());
    for (i, ph) in program_headers.iter().enumerate() {
        let mut out = ph.clone();
        if i == 0 {
            filtered.push(out);
            continue;
        }
        if out.is_load() && mappings.contains_key(&out.vaddr_range()?) {
            out.file_size = 0;
        }
        let prev = &filtered[i - 1];
        out.offset = prev
            .offset
            .checked_add(prev.file_size)
            .ok_or_else(|| Error::format("segment offset overflows"))?;
        if out.align != 0 && out.offset % out.align != 0 {
            out.offset = out
                .offset
                .checked_add(out.align - out.offset % out.align)
                .ok_or_else(|| Error::format("segment offset overflows"))?;
        }
        filtered.push(out);
    }
    Ok(filtered)
}

fn create_side_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::notes::tests::{file_note_desc, push_note};
    use crate::elf::{MappedFile, NT_AUXV, NT_FILE, PT_LOAD, PT_NOTE};

    const PAGE: u64 = 0x1000;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("coretrim-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn load(vaddr: u64, size: u64, flags: u32) -> ProgramHeader {
        ProgramHeader {
            ptype: PT_LOAD,
            flags,
            offset: 0,
            vaddr,
            paddr: 0,
            file_size: size,
            mem_size: size,
            align: PAGE,
        }
    }

    fn note_entry(offset: u64, size: u64) -> ProgramHeader {
        ProgramHeader {
            ptype: PT_NOTE,
            flags: 4,
            offset,
            vaddr: 0,
            paddr: 0,
            file_size: size,
            mem_size: 0,
            align: 4,
        }
    }

    fn mappings_for(ranges: &[(u64, u64)]) -> FileMappings {
        let mut mappings = FileMappings::new();
        for (start, end) in ranges {
            mappings.insert(
                (*start, *end),
                MappedFile {
                    offset: 0,
                    path: "/lib/x.so".to_string(),
                },
            );
        }
        mappings
    }

    /// The note segment used by the synthetic cores: a one-file NT_FILE table
    /// covering [0x1000, 0x2000) plus a recognizable NT_AUXV blob.
    fn test_note_buf() -> (Vec<u8>, Vec<u8>) {
        let auxv: Vec<u8> = (1..=48).collect();
        let mut buf = Vec::new();
        push_note(
            &mut buf,
            NT_FILE,
            &file_note_desc(PAGE, &[(0x1000, 0x2000, 0, "/lib/x.so")]),
        );
        push_note(&mut buf, NT_AUXV, &auxv);
        (buf, auxv)
    }

    /// Builds a complete 64-bit little-endian core with three segments: the
    /// NOTE, a file-backed LOAD at [0x1000, 0x2000), and an anonymous LOAD at
    /// [0x3000, 0x4000). Payloads are 0xaa and 0xbb fill.
    fn build_core(first_entry_type: u32, load2_filesz: u64) -> Vec<u8> {
        let (note_buf, _) = test_note_buf();
        let phdr_off = 64u64;
        let note_off = phdr_off + 3 * 56;
        let load1_off = PAGE; // next page after header table + note
        let load2_off = 2 * PAGE;

        let mut ehdr = vec![0u8; 64];
        ehdr[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        ehdr[4] = 2; // ELFCLASS64
        ehdr[5] = 1; // little endian
        ehdr[6] = 1; // EV_CURRENT
        ehdr[16..18].copy_from_slice(&4u16.to_le_bytes()); // ET_CORE
        ehdr[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        ehdr[20..24].copy_from_slice(&1u32.to_le_bytes());
        ehdr[32..40].copy_from_slice(&phdr_off.to_le_bytes());
        ehdr[52..54].copy_from_slice(&64u16.to_le_bytes());
        ehdr[54..56].copy_from_slice(&56u16.to_le_bytes());
        ehdr[56..58].copy_from_slice(&3u16.to_le_bytes());

        let mut e0 = note_entry(note_off, note_buf.len() as u64);
        e0.ptype = first_entry_type;
        let mut e1 = load(0x1000, PAGE, 5); // r-x, backed by /lib/x.so
        e1.offset = load1_off;
        let mut e2 = load(0x3000, PAGE, 6); // rw-, anonymous
        e2.offset = load2_off;
        e2.file_size = load2_filesz;
        // Declared sizes can be hostile values way past what the builder could
        // materialize; the payload is capped at one page.
        e2.mem_size = load2_filesz.min(PAGE);

        let mut core = ehdr;
        for ph in [&e0, &e1, &e2] {
            core.extend_from_slice(&ph.encode(true, true));
        }
        core.extend_from_slice(&note_buf);
        core.resize(load1_off as usize, 0);
        core.resize(load1_off as usize + PAGE as usize, 0xaa);
        core.resize(load2_off as usize, 0);
        core.resize(load2_off as usize + load2_filesz.min(PAGE) as usize, 0xbb);
        core
    }

    fn reparse(bytes: &[u8]) -> (ElfHeader, Vec<ProgramHeader>) {
        let mut reader = SourceReader::new(bytes);
        let header = ElfHeader::read(&mut reader).unwrap();
        reader.seek_forward(header.ph_offset).unwrap();
        let mut table = vec![0u8; header.num_ph_entries as usize * 56];
        reader.read_exact(&mut table).unwrap();
        let mut s = Stream::new(&table, true, true);
        let headers = (0..header.num_ph_entries)
            .map(|_| ProgramHeader::parse(&mut s).unwrap())
            .collect();
        (header, headers)
    }

    #[test]
    fn filter_strips_exact_matches_only() {
        let headers = vec![
            note_entry(0xe8, 0x200),
            load(0x1000, PAGE, 5),
            load(0x3000, PAGE, 6),
            load(0x5000, 2 * PAGE, 4),
        ];
        // The third LOAD's mapping covers only half the segment: no exact
        // match, so its payload stays.
        let mappings = mappings_for(&[(0x1000, 0x2000), (0x5000, 0x6000)]);
        let filtered = filter_segments(&headers, &mappings).unwrap();

        assert_eq!(filtered.len(), headers.len());
        assert_eq!(filtered[0], headers[0]);
        assert_eq!(filtered[1].file_size, 0);
        assert_eq!(filtered[2].file_size, PAGE);
        assert_eq!(filtered[3].file_size, 2 * PAGE);
    }

    #[test]
    fn filter_recomputes_offsets() {
        let headers = vec![
            note_entry(0xe8, 0x200),
            load(0x1000, PAGE, 5),
            load(0x3000, PAGE, 6),
        ];
        let mappings = mappings_for(&[(0x1000, 0x2000)]);
        let filtered = filter_segments(&headers, &mappings).unwrap();

        let summary: String = filtered
            .iter()
            .map(|ph| format!("{} {:#x} {:#x}\n", ph.ptype, ph.offset, ph.file_size))
            .collect();
        insta::assert_snapshot!(summary, @r"
        4 0xe8 0x200
        1 0x1000 0x0
        1 0x1000 0x1000
        ");
    }

    #[test]
    fn filter_output_is_monotonic_and_aligned() {
        let headers = vec![
            note_entry(0xe8, 0x234),
            load(0x1000, PAGE, 5),
            load(0x3000, 3 * PAGE, 6),
            load(0x8000, PAGE, 4),
        ];
        let filtered = filter_segments(&headers, &FileMappings::new()).unwrap();
        for pair in filtered.windows(2) {
            assert!(pair[1].offset >= pair[0].offset + pair[0].file_size);
            if pair[1].align != 0 {
                assert_eq!(pair[1].offset % pair[1].align, 0);
            }
        }
    }

    #[test]
    fn overflowing_header_fields_are_format_errors() {
        // A memory size that wraps the address space.
        let headers = vec![note_entry(0xe8, 0x200), load(0x1000, u64::MAX, 5)];
        assert!(matches!(
            filter_segments(&headers, &FileMappings::new()),
            Err(Error::Format(_))
        ));

        // A file size that wraps the recomputed offset of the next entry.
        let headers = vec![note_entry(0xe8, u64::MAX - 0x10), load(0x1000, PAGE, 5)];
        assert!(matches!(
            filter_segments(&headers, &FileMappings::new()),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn converts_a_simple_core() {
        let dir = scratch_dir("simple");
        let proc_dir = dir.join("proc");
        fs::create_dir(&proc_dir).unwrap();
        let core_path = dir.join("core");

        let core = build_core(PT_NOTE, PAGE);
        let (note_buf, auxv) = test_note_buf();
        let writer = CoredumpWriter::new(core.as_slice(), core_path.clone(), proc_dir.clone());
        let size = writer.write().unwrap();

        // The file-backed LOAD collapses to nothing, so the anonymous LOAD
        // lands right after the note, at the next page boundary.
        assert_eq!(size, 2 * PAGE);
        let written = fs::read(&core_path).unwrap();
        assert_eq!(written.len(), size as usize);

        let (header, headers) = reparse(&written);
        assert_eq!(header.num_ph_entries, 3);
        assert!(headers[0].is_note());
        assert_eq!(headers[1].file_size, 0);
        assert_eq!(headers[2].file_size, PAGE);
        assert_eq!(headers[2].offset, PAGE);

        // Note segment verbatim, anonymous payload byte-for-byte.
        let note_off = headers[0].offset as usize;
        assert_eq!(&written[note_off..note_off + note_buf.len()], note_buf);
        assert!(written[PAGE as usize..2 * PAGE as usize]
            .iter()
            .all(|b| *b == 0xbb));

        assert_eq!(fs::read(proc_dir.join("auxv")).unwrap(), auxv);
    }

    #[test]
    fn writes_one_maps_line_per_load_segment() {
        let dir = scratch_dir("maps");
        let proc_dir = dir.join("proc");
        fs::create_dir(&proc_dir).unwrap();

        let core = build_core(PT_NOTE, PAGE);
        let writer = CoredumpWriter::new(core.as_slice(), dir.join("core"), proc_dir.clone());
        writer.write().unwrap();

        let maps = fs::read_to_string(proc_dir.join("maps")).unwrap();
        insta::assert_snapshot!(maps, @r"
        00001000-00002000 r-xp 00000000 00:00 0 /lib/x.so
        00003000-00004000 rw-p 00000000 00:00 0
        ");
        // The anonymous range has no offset or path, but the line still ends
        // with the (empty) path field. Snapshot normalization trims trailing
        // whitespace so the exact text is pinned separately.
        assert_eq!(
            maps.lines().nth(1).unwrap(),
            "00003000-00004000 rw-p 00000000 00:00 0 "
        );
    }

    #[test]
    fn rejects_core_without_leading_note() {
        let dir = scratch_dir("no-note");
        let proc_dir = dir.join("proc");
        fs::create_dir(&proc_dir).unwrap();
        let core_path = dir.join("core");

        let core = build_core(PT_LOAD, PAGE);
        let writer = CoredumpWriter::new(core.as_slice(), core_path.clone(), proc_dir);
        assert!(matches!(writer.write(), Err(Error::Format(_))));
        assert!(!core_path.exists());
    }

    #[test]
    fn truncated_payload_fails_and_removes_destination() {
        let dir = scratch_dir("truncated");
        let proc_dir = dir.join("proc");
        fs::create_dir(&proc_dir).unwrap();
        let core_path = dir.join("core");

        let mut core = build_core(PT_NOTE, PAGE);
        core.truncate(core.len() - 0x800); // cut mid-payload
        let writer = CoredumpWriter::new(core.as_slice(), core_path.clone(), proc_dir);
        assert!(matches!(writer.write(), Err(Error::Io(_))));
        assert!(!core_path.exists());
    }

    #[test]
    fn oversized_core_fails_the_budget() {
        let dir = scratch_dir("budget");
        let proc_dir = dir.join("proc");
        fs::create_dir(&proc_dir).unwrap();
        let core_path = dir.join("core");

        // Declared anonymous segment of 2 MiB against a 1 MiB ceiling. The
        // check fires before any payload is read or written.
        let core = build_core(PT_NOTE, 2 * 1024 * 1024);
        let writer = CoredumpWriter::new(core.as_slice(), core_path.clone(), proc_dir)
            .with_size_limit(1024 * 1024);
        assert!(matches!(writer.write(), Err(Error::Resource(_))));
        assert!(!core_path.exists());
    }

    #[test]
    fn overflowing_declared_size_fails_and_removes_destination() {
        let dir = scratch_dir("overflow");
        let proc_dir = dir.join("proc");
        fs::create_dir(&proc_dir).unwrap();
        let core_path = dir.join("core");

        // The last segment claims a u64::MAX payload, so the expected output
        // size wraps. That's a malformed dump, not a budget problem.
        let core = build_core(PT_NOTE, u64::MAX);
        let writer = CoredumpWriter::new(core.as_slice(), core_path.clone(), proc_dir);
        assert!(matches!(writer.write(), Err(Error::Format(_))));
        assert!(!core_path.exists());
    }

    #[test]
    fn refuses_to_clobber_an_existing_core() {
        let dir = scratch_dir("clobber");
        let proc_dir = dir.join("proc");
        fs::create_dir(&proc_dir).unwrap();
        let core_path = dir.join("core");
        fs::write(&core_path, b"previous crash report").unwrap();

        let core = build_core(PT_NOTE, PAGE);
        let writer = CoredumpWriter::new(core.as_slice(), core_path.clone(), proc_dir);
        assert!(matches!(writer.write(), Err(Error::Io(_))));
        assert_eq!(fs::read(&core_path).unwrap(), b"previous crash report");
    }
}
