use crate::error::{Error, Result};
use std::io::{ErrorKind, Read, Write};

/// How much of a segment payload we shuttle between descriptors at a time.
const COPY_BUF_SIZE: usize = 32768;

/// Sequential, skip-capable reader over the raw dump. The kernel pipes the dump
/// to us exactly once so this can never rewind; it just counts what it has
/// consumed and satisfies "seeks" by discarding bytes.
pub struct SourceReader<R: Read> {
    source: R,
    consumed: u64,
}

impl<R: Read> SourceReader<R> {
    pub fn new(source: R) -> Self {
        SourceReader {
            source,
            consumed: 0,
        }
    }

    /// Cumulative bytes consumed from the stream.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Reads exactly `buf.len()` bytes. A truncated stream shows up here as an
    /// UnexpectedEof.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.source.read_exact(buf)?;
        self.consumed += buf.len() as u64;
        Ok(())
    }

    /// Reads the next `num_bytes` bytes and forwards them to `dest`, or just
    /// discards them when `dest` is `None`. Fails if the stream runs out first.
    pub fn copy_to<W: Write>(&mut self, mut dest: Option<&mut W>, num_bytes: u64) -> Result<()> {
        let mut buf = [0u8; COPY_BUF_SIZE];
        let mut remaining = num_bytes;
        while remaining > 0 {
            let want = remaining.min(COPY_BUF_SIZE as u64) as usize;
            let got = match self.source.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            if let Some(dest) = dest.as_mut() {
                dest.write_all(&buf[..got])?;
            }
            remaining -= got as u64;
            self.consumed += got as u64;
        }
        if remaining > 0 {
            return Err(Error::Io(ErrorKind::UnexpectedEof.into()));
        }
        Ok(())
    }

    /// Discards bytes until `target` bytes have been consumed in total. The
    /// stream is single-pass, so a target behind the cursor is an error.
    pub fn seek_forward(&mut self, target: u64) -> Result<()> {
        if target < self.consumed {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "cannot seek backward to {target} (already consumed {})",
                    self.consumed
                ),
            )));
        }
        self.copy_to::<std::io::Sink>(None, target - self.consumed)
    }
}

/// Cursor over an in-memory buffer (the note segment, or a header table we
/// already pulled off the stream). These buffers are untrusted input so every
/// read is bounds checked and a miss is a format error.
pub struct Stream<'a> {
    bytes: &'a [u8],
    pub offset: usize,
    pub little_endian: bool,
    pub sixty_four_bit: bool,
}

impl<'a> Stream<'a> {
    pub fn new(bytes: &'a [u8], little_endian: bool, sixty_four_bit: bool) -> Self {
        Stream {
            bytes,
            offset: 0,
            little_endian,
            sixty_four_bit,
        }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.offset)
    }

    pub fn slice(&mut self, size: usize) -> Result<&'a [u8]> {
        let end = self
            .offset
            .checked_add(size)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| Error::format(format!("read of {size} bytes out of bounds")))?;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    /// Moves the cursor forward without looking at the bytes.
    pub fn skip(&mut self, size: usize) -> Result<()> {
        self.slice(size)?;
        Ok(())
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        Ok(self.slice(1)?[0])
    }

    pub fn read_half(&mut self) -> Result<u16> {
        let slice = self.slice(2)?;
        if self.little_endian {
            Ok(u16::from_le_bytes(slice.try_into().unwrap()))
        } else {
            Ok(u16::from_be_bytes(slice.try_into().unwrap()))
        }
    }

    pub fn read_word(&mut self) -> Result<u32> {
        let slice = self.slice(4)?;
        if self.little_endian {
            Ok(u32::from_le_bytes(slice.try_into().unwrap()))
        } else {
            Ok(u32::from_be_bytes(slice.try_into().unwrap()))
        }
    }

    pub fn read_xword(&mut self) -> Result<u64> {
        let slice = self.slice(8)?;
        if self.little_endian {
            Ok(u64::from_le_bytes(slice.try_into().unwrap()))
        } else {
            Ok(u64::from_be_bytes(slice.try_into().unwrap()))
        }
    }

    /// Corresponds to the kernel's user_long_t: 64 or 32 bits depending on the
    /// class of the dump. Always widened to 64 bits for sanity.
    pub fn read_ulong(&mut self) -> Result<u64> {
        if self.sixty_four_bit {
            self.read_xword()
        } else {
            Ok(self.read_word()? as u64)
        }
    }

    /// Read a null-terminated ASCII string.
    pub fn read_string(&mut self) -> Result<String> {
        let mut s = String::new();
        loop {
            // Kernel documents these as ASCII though I'm not sure I believe that.
            let byte = self.read_byte()?;
            if byte == 0 {
                break;
            }
            s.push(byte as char);
        }
        Ok(s)
    }
}
