//! Decoded instruction and instruction sequence values.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use bitflags::bitflags;
use regex::Regex;

use crate::arch::Arch;
use crate::decoder::Disassembler;

bitflags! {
    /// Semantic capabilities of one instruction, computed by the backend at
    /// decode time.
    #[cfg_attr(
        feature = "serialization",
        derive(serde::Deserialize, serde::Serialize)
    )]
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    pub struct InstFlags: u8 {
        /// A pure no-op, including register-to-self moves on x86.
        const NOP            = 1 << 0;
        /// Pops a stack value and jumps to it.
        const RET            = 1 << 1;
        /// Unconditional branch through a register, direct or via memory.
        const JMP_REG_UNCOND = 1 << 2;
        /// Call through a register, direct or via memory.
        const CALL_REG       = 1 << 3;
        /// Any call, unconditional branch, or return.
        const UNCOND_FLOW    = 1 << 4;
        /// Any conditional branch.
        const COND_FLOW      = 1 << 5;
        /// Undecodable, or an encoding class that never yields a useful
        /// gadget body.
        const BAD            = 1 << 6;
    }
}

/// One decoded instruction.
///
/// Equality is by `(bytes, addr, arch)`; [`Inst::same`] ignores the address.
/// Instances are immutable once built by a backend.
#[derive(Clone, Debug)]
pub struct Inst {
    addr: u64,
    bytes: Vec<u8>,
    arch: Arch,
    text: String,
    flags: InstFlags,
}

impl Inst {
    /// Builds an instruction from the parts a backend decoded.
    pub fn new(addr: u64, bytes: Vec<u8>, arch: Arch, text: String, flags: InstFlags) -> Inst {
        assert!(!bytes.is_empty(), "instruction with empty encoding");
        Inst {
            addr,
            bytes,
            arch,
            text,
            flags,
        }
    }

    /// Builds the marker a backend yields when it hits bytes it cannot
    /// decode.
    pub fn undecodable(addr: u64, bytes: Vec<u8>, arch: Arch) -> Inst {
        Inst::new(addr, bytes, arch, "(bad)".to_owned(), InstFlags::BAD)
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Length of the encoding, in bytes. Never zero.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// The rendered form, suitable for regex matching and display.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Whether this is the same instruction, disregarding where it sits in
    /// memory.
    pub fn same(&self, other: &Inst) -> bool {
        self.bytes == other.bytes && self.arch == other.arch
    }

    pub fn nop(&self) -> bool {
        self.flags.contains(InstFlags::NOP)
    }

    pub fn ret(&self) -> bool {
        self.flags.contains(InstFlags::RET)
    }

    pub fn jmp_reg_uncond(&self) -> bool {
        self.flags.contains(InstFlags::JMP_REG_UNCOND)
    }

    pub fn call_reg(&self) -> bool {
        self.flags.contains(InstFlags::CALL_REG)
    }

    pub fn has_uncond_ctrl_flow(&self) -> bool {
        self.flags.contains(InstFlags::UNCOND_FLOW)
    }

    pub fn has_cond_ctrl_flow(&self) -> bool {
        self.flags.contains(InstFlags::COND_FLOW)
    }

    pub fn bad(&self) -> bool {
        self.flags.contains(InstFlags::BAD)
    }

    /// Resolves the absolute target of an EIP/RIP-relative memory operand,
    /// when the rendered text carries one.
    pub fn rip_target(&self) -> Option<u64> {
        static RIP_REL: OnceLock<Regex> = OnceLock::new();
        let re = RIP_REL.get_or_init(|| {
            Regex::new(r"(?i)\[\s*(?:eip|rip)\s*\+\s*0x([0-9a-f]+)\s*\]").unwrap()
        });
        let caps = re.captures(&self.text)?;
        let disp = u64::from_str_radix(&caps[1], 16).ok()?;
        Some(self.addr.wrapping_add(disp))
    }
}

impl PartialEq for Inst {
    fn eq(&self, other: &Inst) -> bool {
        self.addr == other.addr && self.same(other)
    }
}

impl Eq for Inst {}

impl Hash for Inst {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr.hash(state);
        self.bytes.hash(state);
        self.arch.hash(state);
    }
}

impl fmt::Display for Inst {
    /// One pretty line: padded address, encoding bytes, rendered text, and
    /// the resolved RIP-relative target when there is one.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let hex: String = self.bytes.iter().map(|b| format!("{b:02x}")).collect();
        let (addr, comment) = if self.arch.address_bits() == 64 {
            let comment = match self.rip_target() {
                Some(target) => format!(" ; 0x{target:016x}"),
                None => String::new(),
            };
            (format!("{:016x}", self.addr), comment)
        } else {
            let comment = match self.rip_target() {
                Some(target) => format!(" ; 0x{target:08x}"),
                None => String::new(),
            };
            (format!("{:08x}", self.addr), comment)
        };
        write!(f, "    {addr:<16}  {hex:<16}{}{comment}", self.text)
    }
}

/// An ordered sequence of instructions decoded from one contiguous byte
/// range.
///
/// The sequence keeps the raw window it was decoded from together with a
/// back-reference to the decoder, so derived views (slices, gadget bodies)
/// can be re-decoded at their own addresses. Equality and hashing are by
/// `(base_addr, bytes, arch)`.
#[derive(Clone)]
pub struct InstSeq {
    base_addr: u64,
    bytes: Vec<u8>,
    dasm: Arc<dyn Disassembler>,
    insts: Vec<Inst>,
}

impl InstSeq {
    /// Decodes `bytes` as if loaded at `base_addr`.
    pub fn decode(dasm: Arc<dyn Disassembler>, base_addr: u64, bytes: &[u8]) -> InstSeq {
        let insts = dasm.decode(base_addr, bytes).collect();
        InstSeq {
            base_addr,
            bytes: bytes.to_vec(),
            dasm,
            insts,
        }
    }

    /// Wraps one already-decoded instruction.
    pub fn single(dasm: Arc<dyn Disassembler>, inst: Inst) -> InstSeq {
        InstSeq {
            base_addr: inst.addr(),
            bytes: inst.bytes().to_vec(),
            dasm,
            insts: vec![inst],
        }
    }

    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    /// The raw byte window this sequence was decoded from.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn arch(&self) -> Arch {
        self.dasm.arch()
    }

    pub fn dasm(&self) -> &Arc<dyn Disassembler> {
        &self.dasm
    }

    /// Number of decoded instructions.
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Inst> {
        self.insts.get(index)
    }

    pub fn first(&self) -> Option<&Inst> {
        self.insts.first()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Inst> {
        self.insts.iter()
    }

    /// A new sequence over `insts[start..end]`, rooted at the first element
    /// of the slice.
    pub fn slice(&self, start: usize, end: usize) -> InstSeq {
        assert!(start <= end && end <= self.insts.len(), "slice out of range");
        let lead: usize = self.insts[..start].iter().map(Inst::len).sum();
        let bytes: Vec<u8> = self.insts[start..end]
            .iter()
            .flat_map(|inst| inst.bytes().iter().copied())
            .collect();
        InstSeq {
            base_addr: self.base_addr + lead as u64,
            bytes,
            dasm: Arc::clone(&self.dasm),
            insts: self.insts[start..end].to_vec(),
        }
    }

    /// The rendered form of each instruction, head first.
    pub fn str_seq(&self) -> Vec<&str> {
        self.insts.iter().map(Inst::text).collect()
    }

    /// The rendered form of each instruction, tail first. Canonicalisation
    /// keys gadgets on this view, so the terminator comes first.
    pub fn as_prefix(&self) -> Vec<&str> {
        self.insts.iter().rev().map(Inst::text).collect()
    }

    /// Whether both sequences decode to the same instructions, disregarding
    /// where they sit in memory and how they are encoded.
    pub fn proc_equal(&self, other: &InstSeq) -> bool {
        self.same_str_seq(&other.str_seq())
    }

    /// Whether `strs` equals this sequence's rendered form.
    pub fn same_str_seq<S: AsRef<str>>(&self, strs: &[S]) -> bool {
        self.insts.len() == strs.len()
            && self
                .insts
                .iter()
                .zip(strs)
                .all(|(inst, s)| inst.text() == s.as_ref())
    }

    /// Whether every instruction is a no-op. Vacuously true when empty.
    pub fn nop(&self) -> bool {
        self.insts.iter().all(Inst::nop)
    }

    /// The sequence with any leading run of no-ops removed.
    pub fn without_nop_prefix(&self) -> InstSeq {
        let start = self
            .insts
            .iter()
            .position(|inst| !inst.nop())
            .unwrap_or(self.insts.len());
        self.slice(start, self.insts.len())
    }

    pub fn has_ret(&self) -> bool {
        self.insts.iter().any(Inst::ret)
    }

    pub fn has_bad_ins(&self) -> bool {
        self.insts.iter().any(Inst::bad)
    }

    pub fn has_uncond_ctrl_flow(&self) -> bool {
        self.insts.iter().any(Inst::has_uncond_ctrl_flow)
    }

    pub fn has_cond_ctrl_flow(&self) -> bool {
        self.insts.iter().any(Inst::has_cond_ctrl_flow)
    }
}

impl PartialEq for InstSeq {
    fn eq(&self, other: &InstSeq) -> bool {
        self.base_addr == other.base_addr
            && self.bytes == other.bytes
            && self.arch() == other.arch()
    }
}

impl Eq for InstSeq {}

impl Hash for InstSeq {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.base_addr.hash(state);
        self.bytes.hash(state);
        self.arch().hash(state);
    }
}

impl fmt::Debug for InstSeq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InstSeq")
            .field("base_addr", &self.base_addr)
            .field("arch", &self.arch())
            .field("insts", &self.str_seq())
            .finish()
    }
}

impl fmt::Display for InstSeq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for inst in &self.insts {
            if !first {
                writeln!(f)?;
            }
            write!(f, "{inst}")?;
            first = false;
        }
        Ok(())
    }
}
