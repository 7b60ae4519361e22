use super::{SourceReader, Stream};
use crate::error::{Error, Result};
use std::io::Read;

const MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ET_CORE: u16 = 4;

/// ELFCLASS32/ELFCLASS64. The kernel writes the dump with native structs so the
/// class has to match the platform we're running on.
#[cfg(target_pointer_width = "64")]
pub const NATIVE_CLASS: u8 = 2;
#[cfg(target_pointer_width = "32")]
pub const NATIVE_CLASS: u8 = 1;

pub fn ehdr_size(sixty_four_bit: bool) -> u16 {
    if sixty_four_bit { 64 } else { 52 }
}

pub fn phdr_size(sixty_four_bit: bool) -> u16 {
    if sixty_four_bit { 56 } else { 32 }
}

/// The validated ELF header of the incoming dump. The raw bytes are kept around
/// because the reduced core starts with the header reproduced verbatim.
pub struct ElfHeader {
    raw: Vec<u8>,
    pub little_endian: bool,
    pub sixty_four_bit: bool,

    /// Offset of the program header table within the source dump.
    pub ph_offset: u64,

    /// Size of one program header table entry.
    pub ph_entry_size: u16,

    /// Number of program header table entries.
    pub num_ph_entries: u16,
}

impl ElfHeader {
    /// Reads and validates the header at the very start of the stream. Any
    /// violation means the whole input is malformed: unlike a debugger we can't
    /// limp along with a dump we don't fully understand, we'd write garbage.
    pub fn read<R: Read>(reader: &mut SourceReader<R>) -> Result<ElfHeader> {
        // see https://en.wikipedia.org/wiki/Executable_and_Linkable_Format
        let mut ident = [0u8; 16];
        reader.read_exact(&mut ident)?;
        if ident[0..4] != MAGIC {
            return Err(Error::format("not an ELF file (bad magic)"));
        }
        let ei_class = ident[4];
        let ei_data = ident[5];
        let ei_version = ident[6];
        if ei_class != NATIVE_CLASS {
            return Err(Error::format(format!(
                "elf class {ei_class} doesn't match this platform"
            )));
        }
        if ei_data != 1 && ei_data != 2 {
            return Err(Error::format(format!("bad elf data encoding: {ei_data}")));
        }
        if ei_version != 1 {
            return Err(Error::format(format!("bad elf version: {ei_version}")));
        }
        let sixty_four_bit = ei_class == 2;
        let little_endian = ei_data == 1;

        let mut raw = vec![0u8; ehdr_size(sixty_four_bit) as usize];
        raw[0..16].copy_from_slice(&ident);
        reader.read_exact(&mut raw[16..])?;

        let mut s = Stream::new(&raw, little_endian, sixty_four_bit);
        s.skip(16)?;
        let e_type = s.read_half()?;
        let _e_machine = s.read_half()?;
        let e_version = s.read_word()?;
        let _e_entry = s.read_ulong()?;
        let ph_offset = s.read_ulong()?;
        let _e_shoff = s.read_ulong()?;
        let _e_flags = s.read_word()?;
        let e_ehsize = s.read_half()?;
        let e_phentsize = s.read_half()?;
        let e_phnum = s.read_half()?;

        if e_type != ET_CORE {
            return Err(Error::format(format!("not a core file (type {e_type})")));
        }
        if e_version != 1 {
            return Err(Error::format(format!("bad elf version: {e_version}")));
        }
        if e_ehsize != ehdr_size(sixty_four_bit) {
            return Err(Error::format(format!("bad elf header size: {e_ehsize}")));
        }
        if e_phentsize != phdr_size(sixty_four_bit) {
            return Err(Error::format(format!(
                "bad program header entry size: {e_phentsize}"
            )));
        }

        Ok(ElfHeader {
            raw,
            little_endian,
            sixty_four_bit,
            ph_offset,
            ph_entry_size: e_phentsize,
            num_ph_entries: e_phnum,
        })
    }

    /// The header exactly as it appeared in the source dump.
    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn size(&self) -> u16 {
        self.raw.len() as u16
    }
}
