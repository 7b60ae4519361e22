//! The subset of ELF needed to rework a kernel core dump. Quick ELF reference:
//! https://gist.github.com/x0nu11byt3/bcb35c3de461e5fb66173071a2379779
//!
//! Dumps produced by the kernel's fs/binfmt_elf.c are laid out like:
//!
//!   ELF Header
//!   Program Header 1
//!   Program Header 2
//!   ...
//!   Program Header n
//!   Segment 1 (type PT_NOTE)
//!   Segment 2
//!   ...
//!   Segment n
//!
//! The program headers describe the segments. For a core file the LOAD segments
//! are the process's memory regions and the leading NOTE segment holds tagged
//! metadata records: signal info, register state, the auxiliary vector, and the
//! table of memory-mapped files. Only the last two are decoded here; the file
//! table decides which LOAD payloads are worth keeping.
//!
//! Everything arrives over a pipe, so the reading side is strictly forward-only.
pub mod header;
pub mod io;
pub mod notes;
pub mod segments;

pub use header::*;
pub use io::*;
pub use notes::*;
pub use segments::*;
