//! Search ELF executables for ROP gadgets.
//!
//! A gadget is a short instruction sequence ending in a control-transfer
//! instruction an attacker who controls the stack can chain: a return, a
//! register-indirect jump, or a register call. This crate reconstructs the
//! executable memory map from an ELF image, aligns a decoder on every byte
//! offset of it, walks backwards from each matched terminator, and yields
//! the maximal set of distinct gadgets as a lazy stream.
//!
//! # Examples
//!
//! Scanning a raw executable segment:
//!
//! ```
//! use ropscan::{find_disassembler, scan_segment, Arch, Rets, Segment};
//!
//! let dasm = find_disassembler(Arch::X86_64)?;
//! let segment = Segment {
//!     bytes: vec![0x58, 0xc3], // pop rax; ret
//!     base_addr: 0x400000,
//! };
//! let gadgets: Vec<_> = scan_segment(&dasm, &segment, &Rets::default(), 20).collect();
//! assert_eq!(gadgets.len(), 1);
//! assert_eq!(gadgets[0].addr(), 0x400000);
//! # Ok::<(), ropscan::Error>(())
//! ```
//!
//! Streaming gadgets out of an ELF file:
//!
//! ```no_run
//! use std::fs::File;
//!
//! let mut file = File::open("/bin/ls")?;
//! for gadget in ropscan::search_elf_for_ret_gadgets(&mut file, 20)? {
//!     println!("{gadget}\n");
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

use std::io::Read;

pub mod arch;
pub mod backend;
pub mod decoder;
pub mod elf;
pub mod error;
pub mod gadget;
pub mod inst;
pub mod matcher;
pub mod search;

pub use arch::Arch;
pub use decoder::{backends, find_disassembler, Backend, Disassembler};
pub use elf::{Image, Segment, Symbol};
pub use error::{Error, Result};
pub use gadget::{maximal_unique, Gadget};
pub use inst::{Inst, InstFlags, InstSeq};
pub use matcher::{CallReg, FlowAllow, JmpRegUncond, Matcher, RegexMatcher, Rets};
pub use search::{
    backward_search, scan_segment, scan_segment_for_byte_seq, GadgetStream, DEFAULT_DEPTH,
};

/// Searches `io` for gadgets ending in a return, walking back up to `depth`
/// bytes from each one.
pub fn search_elf_for_ret_gadgets<R: Read>(
    io: &mut R,
    depth: usize,
) -> Result<GadgetStream<Rets>> {
    GadgetStream::new(Image::parse(io)?, Rets::default(), depth)
}

/// Searches `io` for gadgets ending in an unconditional register-indirect
/// jump.
pub fn search_elf_for_jmp_reg_gadgets<R: Read>(
    io: &mut R,
    depth: usize,
) -> Result<GadgetStream<JmpRegUncond>> {
    GadgetStream::new(Image::parse(io)?, JmpRegUncond::default(), depth)
}

/// Searches `io` for gadgets ending in a register call.
pub fn search_elf_for_call_reg_gadgets<R: Read>(
    io: &mut R,
    depth: usize,
) -> Result<GadgetStream<CallReg>> {
    GadgetStream::new(Image::parse(io)?, CallReg::default(), depth)
}

/// Searches `io` for gadgets whose terminator matches `pattern`,
/// case-insensitively.
pub fn search_elf_for_regex_gadgets<R: Read>(
    io: &mut R,
    depth: usize,
    pattern: &str,
) -> Result<GadgetStream<RegexMatcher>> {
    let matcher = RegexMatcher::new(pattern)?;
    GadgetStream::new(Image::parse(io)?, matcher, depth)
}
