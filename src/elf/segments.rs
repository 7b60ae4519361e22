//! Program header table entries, one per memory segment of the dumped process.
use super::Stream;
use crate::error::{Error, Result};

pub const PT_LOAD: u32 = 1;
pub const PT_NOTE: u32 = 4;

const EXECUTE_FLAG: u32 = 0x1;
const WRITE_FLAG: u32 = 0x2;
const READ_FLAG: u32 = 0x4;

/// One Elf64_Phdr or Elf32_Phdr, see https://llvm.org/doxygen/BinaryFormat_2ELF_8h_source.html.
/// The raw type and alignment are kept because entries get written back out
/// (with adjusted offset/filesz) rather than just inspected.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProgramHeader {
    /// Raw segment type (PT_LOAD, PT_NOTE, ...).
    pub ptype: u32,

    /// Read/Write/Execute flags.
    pub flags: u32,

    /// Offset to the first byte of the segment.
    pub offset: u64,

    /// Virtual address of the first byte in the segment.
    pub vaddr: u64,

    /// Physical address of the first byte in the segment.
    pub paddr: u64,

    /// Number of bytes the segment occupies in the core file.
    pub file_size: u64,

    /// Number of bytes the segment occupies in memory.
    pub mem_size: u64,

    /// Required file-offset alignment, 0 or 1 meaning none.
    pub align: u64,
}

impl ProgramHeader {
    /// Field sizes and order differ between 32-bit and 64-bit ELF files.
    pub fn parse(s: &mut Stream) -> Result<Self> {
        if s.sixty_four_bit {
            let p_type = s.read_word()?;
            let p_flags = s.read_word()?;
            let p_offset = s.read_xword()?;
            let p_vaddr = s.read_xword()?;
            let p_paddr = s.read_xword()?;
            let p_filesz = s.read_xword()?;
            let p_memsz = s.read_xword()?;
            let p_align = s.read_xword()?;
            Ok(ProgramHeader {
                ptype: p_type,
                flags: p_flags,
                offset: p_offset,
                vaddr: p_vaddr,
                paddr: p_paddr,
                file_size: p_filesz,
                mem_size: p_memsz,
                align: p_align,
            })
        } else {
            let p_type = s.read_word()?;
            let p_offset = s.read_word()? as u64;
            let p_vaddr = s.read_word()? as u64;
            let p_paddr = s.read_word()? as u64;
            let p_filesz = s.read_word()? as u64;
            let p_memsz = s.read_word()? as u64;
            let p_flags = s.read_word()?;
            let p_align = s.read_word()? as u64;
            Ok(ProgramHeader {
                ptype: p_type,
                flags: p_flags,
                offset: p_offset,
                vaddr: p_vaddr,
                paddr: p_paddr,
                file_size: p_filesz,
                mem_size: p_memsz,
                align: p_align,
            })
        }
    }

    /// Inverse of `parse`, in the same class and byte order as the source dump.
    pub fn encode(&self, little_endian: bool, sixty_four_bit: bool) -> Vec<u8> {
        fn push32(out: &mut Vec<u8>, value: u32, little_endian: bool) {
            if little_endian {
                out.extend_from_slice(&value.to_le_bytes());
            } else {
                out.extend_from_slice(&value.to_be_bytes());
            }
        }
        fn push64(out: &mut Vec<u8>, value: u64, little_endian: bool) {
            if little_endian {
                out.extend_from_slice(&value.to_le_bytes());
            } else {
                out.extend_from_slice(&value.to_be_bytes());
            }
        }

        let mut out = Vec::with_capacity(if sixty_four_bit { 56 } else { 32 });
        if sixty_four_bit {
            push32(&mut out, self.ptype, little_endian);
            push32(&mut out, self.flags, little_endian);
            push64(&mut out, self.offset, little_endian);
            push64(&mut out, self.vaddr, little_endian);
            push64(&mut out, self.paddr, little_endian);
            push64(&mut out, self.file_size, little_endian);
            push64(&mut out, self.mem_size, little_endian);
            push64(&mut out, self.align, little_endian);
        } else {
            push32(&mut out, self.ptype, little_endian);
            push32(&mut out, self.offset as u32, little_endian);
            push32(&mut out, self.vaddr as u32, little_endian);
            push32(&mut out, self.paddr as u32, little_endian);
            push32(&mut out, self.file_size as u32, little_endian);
            push32(&mut out, self.mem_size as u32, little_endian);
            push32(&mut out, self.flags, little_endian);
            push32(&mut out, self.align as u32, little_endian);
        }
        out
    }

    pub fn is_load(&self) -> bool {
        self.ptype == PT_LOAD
    }

    pub fn is_note(&self) -> bool {
        self.ptype == PT_NOTE
    }

    /// The address range the segment occupies in the dumped process. The
    /// fields come straight off the wire, so a range that wraps around the
    /// address space is a malformed dump, not a math error.
    pub fn vaddr_range(&self) -> Result<(u64, u64)> {
        let end = self
            .vaddr
            .checked_add(self.mem_size)
            .ok_or_else(|| Error::format("segment address range overflows"))?;
        Ok((self.vaddr, end))
    }

    /// Permission string the way /proc/[pid]/maps spells it. The sharing mode is
    /// always reported as private: the dump doesn't record it.
    pub fn perms(&self) -> String {
        let mut result = String::with_capacity(4);
        result.push(if self.flags & READ_FLAG != 0 { 'r' } else { '-' });
        result.push(if self.flags & WRITE_FLAG != 0 { 'w' } else { '-' });
        result.push(if self.flags & EXECUTE_FLAG != 0 { 'x' } else { '-' });
        result.push('p');
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProgramHeader {
        ProgramHeader {
            ptype: PT_LOAD,
            flags: READ_FLAG | EXECUTE_FLAG,
            offset: 0x2000,
            vaddr: 0x40_0000,
            paddr: 0,
            file_size: 0x1000,
            mem_size: 0x1000,
            align: 0x1000,
        }
    }

    #[test]
    fn encode_parse_round_trip_64() {
        let ph = sample();
        let bytes = ph.encode(true, true);
        assert_eq!(bytes.len(), 56);
        let mut s = Stream::new(&bytes, true, true);
        assert_eq!(ProgramHeader::parse(&mut s).unwrap(), ph);
    }

    #[test]
    fn encode_parse_round_trip_32() {
        let ph = sample();
        let bytes = ph.encode(true, false);
        assert_eq!(bytes.len(), 32);
        let mut s = Stream::new(&bytes, true, false);
        assert_eq!(ProgramHeader::parse(&mut s).unwrap(), ph);
    }

    #[test]
    fn vaddr_range_rejects_wraparound() {
        let mut ph = sample();
        ph.vaddr = u64::MAX - 0x10;
        ph.mem_size = 0x100;
        assert!(matches!(ph.vaddr_range(), Err(Error::Format(_))));

        ph.mem_size = 0x10;
        assert_eq!(ph.vaddr_range().unwrap(), (u64::MAX - 0x10, u64::MAX));
    }

    #[test]
    fn perm_strings() {
        let mut ph = sample();
        assert_eq!(ph.perms(), "r-xp");
        ph.flags = READ_FLAG | WRITE_FLAG;
        assert_eq!(ph.perms(), "rw-p");
        ph.flags = 0;
        assert_eq!(ph.perms(), "---p");
    }
}
