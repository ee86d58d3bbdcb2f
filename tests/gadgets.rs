//! End-to-end behaviour of the scan and backward search over hand-built
//! segments.

use std::sync::Arc;

use ropscan::{
    find_disassembler, scan_segment, scan_segment_for_byte_seq, Arch, Disassembler, Gadget,
    InstSeq, JmpRegUncond, Matcher, Rets, Segment,
};

fn dasm() -> Arc<dyn Disassembler> {
    find_disassembler(Arch::X86_64).unwrap()
}

fn segment(bytes: &[u8]) -> Segment {
    Segment {
        bytes: bytes.to_vec(),
        base_addr: 0x400000,
    }
}

fn ret_gadgets(bytes: &[u8]) -> Vec<Gadget> {
    let dasm = dasm();
    let segment = segment(bytes);
    scan_segment(&dasm, &segment, &Rets::default(), 20).collect()
}

#[test]
fn all_nop_bodies_yield_nothing() {
    // nop; nop; ret compacts down to a bare ret, which is not a gadget
    assert!(ret_gadgets(&[0x90, 0x90, 0xc3]).is_empty());
}

#[test]
fn pop_ret_yields_one_gadget() {
    let gadgets = ret_gadgets(&[0x58, 0xc3]);
    assert_eq!(gadgets.len(), 1);
    let gadget = &gadgets[0];
    assert_eq!(gadget.addr(), 0x400000);
    assert_eq!(gadget.suffix().str_seq(), ["pop rax"]);
    assert_eq!(gadget.parent().str_seq(), ["ret"]);
    assert_eq!(gadget.parent().base_addr(), 0x400001);
}

#[test]
fn duplicate_terminators_are_eliminated() {
    // the walk back from the second ret stops as soon as the body is itself
    // a ret, and bare terminators are dropped
    assert!(ret_gadgets(&[0xc3, 0xc3]).is_empty());
}

#[test]
fn internal_returns_prune_longer_candidates() {
    // ret; pop rbx; ret
    let gadgets = ret_gadgets(&[0xc3, 0x5b, 0xc3]);
    assert_eq!(gadgets.len(), 1);
    assert_eq!(gadgets[0].addr(), 0x400001);
    assert_eq!(gadgets[0].suffix().str_seq(), ["pop rbx"]);
    assert_eq!(gadgets[0].parent().str_seq(), ["ret"]);
}

#[test]
fn jmp_reg_terminators() {
    // pop rax; jmp rax
    let dasm = dasm();
    let segment = segment(&[0x58, 0xff, 0xe0]);
    let gadgets: Vec<_> = scan_segment(&dasm, &segment, &JmpRegUncond::default(), 20).collect();
    assert_eq!(gadgets.len(), 1);
    assert_eq!(gadgets[0].addr(), 0x400000);
    assert_eq!(gadgets[0].suffix().str_seq(), ["pop rax"]);
    assert_eq!(gadgets[0].parent().str_seq(), ["jmp rax"]);
}

#[test]
fn zero_depth_finds_nothing() {
    let dasm = dasm();
    let segment = segment(&[0x58, 0xc3]);
    let gadgets: Vec<_> = scan_segment(&dasm, &segment, &Rets::default(), 0).collect();
    assert!(gadgets.is_empty());
}

#[test]
fn truncated_terminator_at_segment_end_is_no_match() {
    // 0xff alone is a truncated indirect-branch encoding
    let dasm = dasm();
    let segment = segment(&[0x58, 0xff]);
    let gadgets: Vec<_> = scan_segment(&dasm, &segment, &JmpRegUncond::default(), 20).collect();
    assert!(gadgets.is_empty());
}

#[test]
fn bad_instructions_discard_candidates() {
    // hlt; pop rax; ret: the depth-2 window contains hlt and is dropped,
    // leaving only the depth-1 gadget
    let gadgets = ret_gadgets(&[0xf4, 0x58, 0xc3]);
    assert_eq!(gadgets.len(), 1);
    assert_eq!(gadgets[0].suffix().str_seq(), ["pop rax"]);
}

#[test]
fn nop_padded_windows_collapse_with_their_duplicate() {
    // nop; pop rax; ret: the depth-2 window compacts to exactly the gadget
    // the depth-1 window produced, and identical candidates drop together
    // during canonicalisation
    assert!(ret_gadgets(&[0x90, 0x58, 0xc3]).is_empty());
}

#[test]
fn emitted_gadgets_stay_inside_the_segment() {
    // a small deterministic byte soup
    let mut bytes = Vec::with_capacity(512);
    let mut x: u32 = 0x2545f491;
    for _ in 0..512 {
        x = x.wrapping_mul(1103515245).wrapping_add(12345);
        bytes.push((x >> 16) as u8);
    }
    let dasm = dasm();
    let segment = Segment {
        bytes,
        base_addr: 0x10000,
    };
    let matcher = Rets::default();
    for gadget in scan_segment(&dasm, &segment, &matcher, 20) {
        let lo = segment.base_addr;
        let hi = segment.base_addr + segment.bytes.len() as u64;
        assert!(gadget.addr() >= lo);
        assert!(gadget.addr() + gadget.bytes().len() as u64 <= hi);

        let parent = gadget.parent();
        assert_eq!(parent.len(), 1, "terminator must be one instruction");
        assert!(matcher.matches(&parent));

        let suffix = gadget.suffix();
        assert!(!suffix.is_empty());
        assert!(!suffix.has_ret());
        assert!(!suffix.has_bad_ins());
        assert!(!suffix.first().unwrap().nop());
    }
}

#[test]
fn byte_seq_search_matches_literal_terminators() {
    let dasm = dasm();
    let segment = segment(&[0x58, 0xc3, 0x5b, 0xc3]);
    let gadgets: Vec<_> = scan_segment_for_byte_seq(&dasm, &segment, &[0xc3], 20).collect();
    assert_eq!(gadgets.len(), 2);
    assert_eq!(gadgets[0].suffix().str_seq(), ["pop rax"]);
    assert_eq!(gadgets[1].suffix().str_seq(), ["pop rbx"]);
}

#[test]
fn proc_equal_ignores_addresses() {
    let dasm = dasm();
    let a = InstSeq::decode(Arc::clone(&dasm), 0x1000, &[0x58, 0xc3]);
    let b = InstSeq::decode(Arc::clone(&dasm), 0x2000, &[0x58, 0xc3]);
    let c = InstSeq::decode(Arc::clone(&dasm), 0x3000, &[0x5b, 0xc3]);
    assert!(a.proc_equal(&a));
    assert!(a.proc_equal(&b) && b.proc_equal(&a));
    assert!(!a.proc_equal(&c));
    // different length is never equal
    let d = InstSeq::decode(Arc::clone(&dasm), 0x1000, &[0xc3]);
    assert!(!a.proc_equal(&d));
}

#[test]
fn slices_recompose_to_the_original() {
    let dasm = dasm();
    // xor eax, eax; pop rax; ret
    let seq = InstSeq::decode(Arc::clone(&dasm), 0x1000, &[0x31, 0xc0, 0x58, 0xc3]);
    assert_eq!(seq.len(), 3);
    let mut bytes = Vec::new();
    for i in 0..seq.len() {
        let single = seq.slice(i, i + 1);
        assert_eq!(single.base_addr(), seq.get(i).unwrap().addr());
        bytes.extend_from_slice(single.bytes());
    }
    let recomposed = InstSeq::decode(dasm, seq.base_addr(), &bytes);
    assert!(recomposed.proc_equal(&seq));
}

#[test]
fn rendering_has_fixed_columns() {
    let gadgets = ret_gadgets(&[0x58, 0xc3]);
    let text = gadgets[0].to_string();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "    0000000000400000  58              pop rax");
    assert_eq!(lines[1], format!("    {}", "_".repeat(40)));
    assert_eq!(lines[2], "    0000000000400001  c3              ret");
}

#[test]
fn rip_relative_targets_are_resolved() {
    let dasm = dasm();
    // lea rax, [rip+0x1234]
    let seq = InstSeq::decode(dasm, 0x400000, &[0x48, 0x8d, 0x05, 0x34, 0x12, 0x00, 0x00]);
    let inst = seq.first().unwrap();
    assert_eq!(inst.text(), "lea rax, [rip+0x1234]");
    assert_eq!(inst.rip_target(), Some(0x401234));
    assert!(inst.to_string().ends_with(" ; 0x0000000000401234"));
}
