//! Byte-offset scanning and the backward gadget search.

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;

use crate::decoder::{find_disassembler, Disassembler};
use crate::elf::{Image, Segment};
use crate::error::Result;
use crate::gadget::{maximal_unique, Gadget};
use crate::inst::InstSeq;
use crate::matcher::{FlowAllow, Matcher};

/// Bytes decoded per probe; comfortably above the longest x86 instruction.
const PROBE_LEN: usize = 32;

/// Default number of bytes to walk back from a matched terminator.
pub const DEFAULT_DEPTH: usize = 20;

/// Walks backwards from the terminator matched at `offset`, returning the
/// canonical set of gadgets ending in it.
///
/// `term` is the terminator template: the single instruction the matcher
/// accepted, whose encoded length fixes the terminator footprint. Each step
/// `k` re-decodes a window that starts `k` bytes earlier; windows whose
/// decoding realigns away from the terminator are skipped, and the walk
/// stops early once the body itself ends in an equivalent terminator, since
/// every longer window from here was already visited at a smaller `k`.
pub fn backward_search<M: Matcher + ?Sized>(
    dasm: &Arc<dyn Disassembler>,
    term: &InstSeq,
    segment: &Segment,
    offset: usize,
    depth: usize,
    matcher: &M,
) -> Vec<Gadget> {
    let bs = term.bytes().len();
    let base = segment.base_addr + offset as u64;
    assert!(!term.is_empty(), "empty terminator template");
    assert!(offset + bs <= segment.bytes.len(), "terminator out of segment");
    debug!(
        "backward search from 0x{:08x} for sequences ending in {:?}",
        base,
        term.str_seq()
    );

    let flow = matcher.flow();
    let mut candidates = Vec::new();
    for k in 1..=depth.min(offset) {
        let addr = base - k as u64;
        let data = &segment.bytes[offset - k..offset + bs];
        let ns = InstSeq::decode(Arc::clone(dasm), addr, data);
        if ns.len() <= term.len() {
            continue;
        }
        let tail = ns.slice(ns.len() - term.len(), ns.len());
        if !term.proc_equal(&tail) {
            // the extra bytes realigned the decoding and the terminator is
            // gone from this window
            continue;
        }
        // a realigned decode can produce an equivalent, longer encoding of
        // the terminator; the body ends where that encoding starts
        let parent_offset = k + bs - tail.bytes().len();
        let gadget = Gadget::new(Arc::clone(dasm), addr, data, parent_offset);
        let suffix = gadget.suffix();
        if suffix.proc_equal(term) || matcher.matches(&suffix) {
            // the same terminator sits immediately before this one, so every
            // longer window here was already covered by an earlier offset
            break;
        }
        if suffix.has_ret() {
            continue;
        }
        if !flow.contains(FlowAllow::UNCOND) && suffix.has_uncond_ctrl_flow() {
            continue;
        }
        if !flow.contains(FlowAllow::COND) && suffix.has_cond_ctrl_flow() {
            continue;
        }
        if gadget.has_bad_ins() {
            continue;
        }
        match gadget.compact() {
            Some(compacted) => candidates.push(compacted),
            None => debug!("compacted gadget at 0x{addr:08x} was empty"),
        }
    }
    maximal_unique(candidates)
}

/// Probes `offset` and, when the matcher accepts the first decoded
/// instruction, runs the backward search there. `None` means no match.
fn match_at<M: Matcher + ?Sized>(
    dasm: &Arc<dyn Disassembler>,
    segment: &Segment,
    offset: usize,
    depth: usize,
    matcher: &M,
) -> Option<Vec<Gadget>> {
    let window = &segment.bytes[offset..(offset + PROBE_LEN).min(segment.bytes.len())];
    let addr = segment.base_addr + offset as u64;
    let first = dasm.decode(addr, window).next()?;
    let probe = InstSeq::single(Arc::clone(dasm), first);
    if !matcher.matches(&probe) {
        return None;
    }
    Some(backward_search(dasm, &probe, segment, offset, depth, matcher))
}

/// Lazily scans one segment, yielding canonical gadgets in ascending offset
/// order.
pub fn scan_segment<'a, M: Matcher + ?Sized>(
    dasm: &'a Arc<dyn Disassembler>,
    segment: &'a Segment,
    matcher: &'a M,
    depth: usize,
) -> SegmentScan<'a, M> {
    debug!(
        "search {} bytes starting at 0x{:08x}",
        segment.bytes.len(),
        segment.base_addr
    );
    SegmentScan {
        dasm,
        segment,
        matcher,
        depth,
        offset: 0,
        pending: VecDeque::new(),
    }
}

/// Iterator returned by [`scan_segment`].
pub struct SegmentScan<'a, M: ?Sized> {
    dasm: &'a Arc<dyn Disassembler>,
    segment: &'a Segment,
    matcher: &'a M,
    depth: usize,
    offset: usize,
    pending: VecDeque<Gadget>,
}

impl<M: Matcher + ?Sized> Iterator for SegmentScan<'_, M> {
    type Item = Gadget;

    fn next(&mut self) -> Option<Gadget> {
        loop {
            if let Some(gadget) = self.pending.pop_front() {
                return Some(gadget);
            }
            if self.offset >= self.segment.bytes.len() {
                return None;
            }
            let offset = self.offset;
            self.offset += 1;
            if let Some(batch) =
                match_at(self.dasm, self.segment, offset, self.depth, self.matcher)
            {
                self.pending.extend(batch);
            }
        }
    }
}

/// Searches one segment for a literal terminator encoding, walking back from
/// every occurrence.
///
/// Unlike [`scan_segment`] this does not probe-decode every offset; it only
/// fires where the raw bytes equal `byte_seq`.
pub fn scan_segment_for_byte_seq<'a>(
    dasm: &'a Arc<dyn Disassembler>,
    segment: &'a Segment,
    byte_seq: &'a [u8],
    depth: usize,
) -> impl Iterator<Item = Gadget> + 'a {
    assert!(!byte_seq.is_empty(), "empty byte sequence");
    let matcher = LiteralBytes(byte_seq.to_vec());
    let mut pending: VecDeque<Gadget> = VecDeque::new();
    let mut offset = 0;
    std::iter::from_fn(move || loop {
        if let Some(gadget) = pending.pop_front() {
            return Some(gadget);
        }
        if offset >= segment.bytes.len() {
            return None;
        }
        let i = offset;
        offset += 1;
        if !segment.bytes[i..].starts_with(byte_seq) {
            continue;
        }
        let term = InstSeq::decode(Arc::clone(dasm), segment.base_addr + i as u64, byte_seq);
        if term.is_empty() {
            continue;
        }
        pending.extend(backward_search(dasm, &term, segment, i, depth, &matcher));
    })
}

/// Matches a sequence whose first instruction has exactly this encoding.
struct LiteralBytes(Vec<u8>);

impl Matcher for LiteralBytes {
    fn matches(&self, seq: &InstSeq) -> bool {
        seq.first().is_some_and(|inst| inst.bytes() == &self.0[..])
    }
}

/// Streams gadgets out of an ELF image, one executable segment at a time.
///
/// The pipeline is pull-based throughout: segments are projected only when
/// the scan reaches them, and candidates are canonicalised per matched
/// offset, so dropping the stream abandons all remaining work.
pub struct GadgetStream<M> {
    image: Image,
    dasm: Arc<dyn Disassembler>,
    matcher: M,
    depth: usize,
    interval: usize,
    current: Option<Segment>,
    offset: usize,
    pending: VecDeque<Gadget>,
}

impl<M: Matcher> GadgetStream<M> {
    /// Opens `image` for scanning, resolving a decoder for its architecture.
    pub fn new(image: Image, matcher: M, depth: usize) -> Result<GadgetStream<M>> {
        let dasm = find_disassembler(image.arch())?;
        Ok(GadgetStream {
            image,
            dasm,
            matcher,
            depth,
            interval: 0,
            current: None,
            offset: 0,
            pending: VecDeque::new(),
        })
    }

    pub fn image(&self) -> &Image {
        &self.image
    }
}

impl<M: Matcher> Iterator for GadgetStream<M> {
    type Item = Gadget;

    fn next(&mut self) -> Option<Gadget> {
        loop {
            if let Some(gadget) = self.pending.pop_front() {
                return Some(gadget);
            }
            if self.current.is_none() {
                if self.interval >= self.image.segment_count() {
                    return None;
                }
                let segment = self.image.segment(self.interval)?;
                self.interval += 1;
                debug!(
                    "search {} bytes starting at 0x{:08x}",
                    segment.bytes.len(),
                    segment.base_addr
                );
                self.offset = 0;
                self.current = Some(segment);
            }
            let Some(segment) = self.current.as_ref() else {
                continue;
            };
            if self.offset >= segment.bytes.len() {
                self.current = None;
                continue;
            }
            let offset = self.offset;
            self.offset += 1;
            if let Some(batch) =
                match_at(&self.dasm, segment, offset, self.depth, &self.matcher)
            {
                self.pending.extend(batch);
            }
        }
    }
}
