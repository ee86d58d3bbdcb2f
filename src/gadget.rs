//! Gadgets and their canonicalisation.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::decoder::Disassembler;
use crate::inst::InstSeq;

/// An instruction sequence ending in a matched terminator.
///
/// `parent_offset` is the byte offset inside the sequence at which the
/// terminator begins. The *suffix* is everything before it (the gadget
/// body); the *prefix* (or parent) is the terminator itself, so named
/// because it leads the reversed view used for canonicalisation.
#[derive(Clone)]
pub struct Gadget {
    seq: InstSeq,
    parent_offset: usize,
}

impl Gadget {
    /// Decodes `bytes` at `addr` and takes the instruction starting at
    /// `parent_offset` as the terminator.
    pub fn new(
        dasm: Arc<dyn Disassembler>,
        addr: u64,
        bytes: &[u8],
        parent_offset: usize,
    ) -> Gadget {
        assert!(parent_offset <= bytes.len(), "terminator offset out of range");
        Gadget {
            seq: InstSeq::decode(dasm, addr, bytes),
            parent_offset,
        }
    }

    pub fn addr(&self) -> u64 {
        self.seq.base_addr()
    }

    pub fn bytes(&self) -> &[u8] {
        self.seq.bytes()
    }

    pub fn parent_offset(&self) -> usize {
        self.parent_offset
    }

    /// The whole decoded sequence, body and terminator.
    pub fn seq(&self) -> &InstSeq {
        &self.seq
    }

    /// The gadget body: everything before the terminator, re-decoded at the
    /// gadget address.
    pub fn suffix(&self) -> InstSeq {
        InstSeq::decode(
            Arc::clone(self.seq.dasm()),
            self.addr(),
            &self.bytes()[..self.parent_offset],
        )
    }

    /// The terminator, re-decoded at its own address.
    pub fn parent(&self) -> InstSeq {
        InstSeq::decode(
            Arc::clone(self.seq.dasm()),
            self.addr() + self.parent_offset as u64,
            &self.bytes()[self.parent_offset..],
        )
    }

    /// Alias for [`Gadget::parent`].
    pub fn prefix(&self) -> InstSeq {
        self.parent()
    }

    /// The rendered instructions, terminator first. Canonicalisation keys on
    /// this view.
    pub fn as_prefix(&self) -> Vec<&str> {
        self.seq.as_prefix()
    }

    /// Whether the body contains an instruction that never yields a useful
    /// gadget. The terminator is exempt.
    pub fn has_bad_ins(&self) -> bool {
        self.suffix().has_bad_ins()
    }

    /// Whether the body is nothing but no-ops.
    pub fn nop(&self) -> bool {
        self.suffix().nop()
    }

    /// Strips any leading run of no-ops from the body, or drops the gadget
    /// entirely when nothing else remains: a bare terminator is not a
    /// gadget. Idempotent.
    pub fn compact(&self) -> Option<Gadget> {
        let suffix = self.suffix();
        if suffix.nop() {
            return None;
        }
        if !suffix.first().is_some_and(|inst| inst.nop()) {
            return Some(self.clone());
        }
        let trimmed = suffix.without_nop_prefix();
        let mut bytes = trimmed.bytes().to_vec();
        let parent_offset = bytes.len();
        bytes.extend_from_slice(&self.bytes()[self.parent_offset..]);
        Some(Gadget::new(
            Arc::clone(self.seq.dasm()),
            trimmed.base_addr(),
            &bytes,
            parent_offset,
        ))
    }
}

impl PartialEq for Gadget {
    fn eq(&self, other: &Gadget) -> bool {
        self.parent_offset == other.parent_offset && self.seq == other.seq
    }
}

impl Eq for Gadget {}

impl Hash for Gadget {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.seq.hash(state);
        self.parent_offset.hash(state);
    }
}

impl fmt::Debug for Gadget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Gadget")
            .field("addr", &self.addr())
            .field("insts", &self.seq.str_seq())
            .field("parent_offset", &self.parent_offset)
            .finish()
    }
}

impl fmt::Display for Gadget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}", self.suffix())?;
        writeln!(f, "    {}", "_".repeat(40))?;
        write!(f, "{}", self.parent())
    }
}

/// Collapses a candidate list into the maximal distinct gadgets.
///
/// Candidates for one matched offset overlap heavily: shorter ones are
/// prefixes of longer ones in the terminator-first view. Partitioning on
/// successive [`Gadget::as_prefix`] elements keeps exactly one gadget per
/// maximal sequence, in first-seen order. A gadget that runs out of
/// elements while siblings remain is a strict prefix of those siblings and
/// is dropped.
pub fn maximal_unique(gadgets: Vec<Gadget>) -> Vec<Gadget> {
    maximal_unique_at(gadgets, 0)
}

fn maximal_unique_at(gadgets: Vec<Gadget>, depth: usize) -> Vec<Gadget> {
    if gadgets.len() <= 1 {
        return gadgets;
    }

    let mut partitions: Vec<(String, Vec<Gadget>)> = Vec::new();
    for gadget in gadgets {
        let Some(head) = gadget.as_prefix().get(depth).map(|s| s.to_string()) else {
            continue;
        };
        match partitions.iter_mut().find(|(key, _)| *key == head) {
            Some((_, bucket)) => bucket.push(gadget),
            None => partitions.push((head, vec![gadget])),
        }
    }

    partitions
        .into_iter()
        .flat_map(|(_, bucket)| maximal_unique_at(bucket, depth + 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;
    use crate::backend;

    fn dasm() -> Arc<dyn Disassembler> {
        backend::x86::new(Arch::X86_64).unwrap().unwrap()
    }

    fn ret_gadget(bytes: &[u8]) -> Gadget {
        // terminator is the final ret byte
        Gadget::new(dasm(), 0x400000, bytes, bytes.len() - 1)
    }

    #[test]
    fn suffix_and_parent_views() {
        let g = ret_gadget(&[0x58, 0xc3]);
        assert_eq!(g.suffix().str_seq(), ["pop rax"]);
        assert_eq!(g.parent().str_seq(), ["ret"]);
        assert_eq!(g.parent().base_addr(), 0x400001);
        assert_eq!(g.as_prefix(), ["ret", "pop rax"]);
    }

    #[test]
    fn compaction_strips_leading_nops() {
        let g = ret_gadget(&[0x90, 0x58, 0xc3]);
        let compacted = g.compact().unwrap();
        assert_eq!(compacted.addr(), 0x400001);
        assert_eq!(compacted.parent_offset(), 1);
        assert_eq!(compacted.suffix().str_seq(), ["pop rax"]);
        // idempotent
        assert_eq!(compacted.compact().unwrap(), compacted);
    }

    #[test]
    fn all_nop_bodies_are_dropped() {
        assert!(ret_gadget(&[0x90, 0x90, 0xc3]).compact().is_none());
        assert!(ret_gadget(&[0xc3]).compact().is_none());
    }

    #[test]
    fn bad_instructions_poison_bodies_only() {
        // hlt; pop rax; ret
        let g = Gadget::new(dasm(), 0x400000, &[0xf4, 0x58, 0xc3], 2);
        assert!(g.has_bad_ins());
        // pop rax; ret
        let g = ret_gadget(&[0x58, 0xc3]);
        assert!(!g.has_bad_ins());
    }

    #[test]
    fn keeps_maximal_distinct_tails() {
        let candidates = vec![
            ret_gadget(&[0xc3]),                         // ret
            ret_gadget(&[0x58, 0xc3]),                   // pop rax; ret
            ret_gadget(&[0x5b, 0xc3]),                   // pop rbx; ret
            ret_gadget(&[0x31, 0xc0, 0x58, 0xc3]),       // xor eax, eax; pop rax; ret
        ];
        let kept = maximal_unique(candidates);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].as_prefix(), ["ret", "pop rax", "xor eax, eax"]);
        assert_eq!(kept[1].as_prefix(), ["ret", "pop rbx"]);
    }

    #[test]
    fn canonicalisation_is_idempotent() {
        let kept = maximal_unique(vec![
            ret_gadget(&[0x58, 0xc3]),
            ret_gadget(&[0x5b, 0xc3]),
        ]);
        let again = maximal_unique(kept.clone());
        assert_eq!(again, kept);
    }
}
