//! ARM / Thumb backend on top of `capstone`.

use std::sync::Arc;

use capstone::arch::arm::ArmCC;
use capstone::arch::ArchDetail;
use capstone::prelude::*;
use capstone::Insn;

use crate::arch::Arch;
use crate::decoder::{Disassembler, InstIter};
use crate::error::{Error, Result};
use crate::inst::{Inst, InstFlags};

/// Builds an ARM-family decoder, or `None` for other architectures.
///
/// A capstone initialisation failure maps to [`Error::LibNotFound`] so
/// backend discovery can demote this backend and keep scanning.
pub fn new(arch: Arch) -> Result<Option<Arc<dyn Disassembler>>> {
    use capstone::arch::arm::ArchMode;

    let (mode, word) = match arch {
        Arch::Arm => (ArchMode::Arm, 4),
        Arch::Thumb => (ArchMode::Thumb, 2),
        Arch::Thumb2 => (ArchMode::Thumb, 4),
        _ => return Ok(None),
    };
    let cs = Capstone::new()
        .arm()
        .mode(mode)
        .detail(true)
        .build()
        .map_err(|err| Error::LibNotFound(format!("capstone: {err}")))?;
    Ok(Some(Arc::new(ArmDasm { arch, word, cs })))
}

struct ArmDasm {
    arch: Arch,
    /// Nominal instruction width; only used to size undecodable markers.
    word: usize,
    cs: Capstone,
}

impl Disassembler for ArmDasm {
    fn arch(&self) -> Arch {
        self.arch
    }

    fn decode<'a>(&'a self, addr: u64, bytes: &'a [u8]) -> InstIter<'a> {
        Box::new(ArmIter {
            dasm: self,
            bytes,
            base: addr,
            pos: 0,
            done: false,
        })
    }
}

struct ArmIter<'a> {
    dasm: &'a ArmDasm,
    bytes: &'a [u8],
    base: u64,
    pos: usize,
    done: bool,
}

impl Iterator for ArmIter<'_> {
    type Item = Inst;

    fn next(&mut self) -> Option<Inst> {
        if self.done || self.pos >= self.bytes.len() {
            return None;
        }
        let addr = self.base + self.pos as u64;
        let rest = &self.bytes[self.pos..];
        let decoded = self.dasm.cs.disasm_count(rest, addr, 1).ok();
        let insn = decoded.as_ref().and_then(|insns| insns.iter().next());
        let Some(insn) = insn else {
            // undecodable word, or a partial one at the end of the window
            self.done = true;
            let width = self.dasm.word.min(rest.len());
            return Some(Inst::undecodable(addr, rest[..width].to_vec(), self.dasm.arch));
        };
        let raw = insn.bytes().to_vec();
        self.pos += raw.len();
        let mnemonic = insn.mnemonic().unwrap_or("");
        let op_str = insn.op_str().unwrap_or("");
        let text = if op_str.is_empty() {
            mnemonic.to_owned()
        } else {
            format!("{mnemonic} {op_str}")
        };
        let flags = classify(&self.dasm.cs, insn, mnemonic, op_str);
        Some(Inst::new(addr, raw, self.dasm.arch, text, flags))
    }
}

/// Whether this instruction loads the program counter from the stack: a
/// `pop` whose register list includes `pc`, or an `ldm` variant based on
/// `sp` whose list includes `pc`.
fn loads_pc_from_stack(mnemonic: &str, op_str: &str) -> bool {
    let list_has_pc = op_str
        .rsplit('{')
        .next()
        .is_some_and(|list| list.split(&[',', '}'][..]).any(|reg| reg.trim() == "pc"));
    if mnemonic.starts_with("pop") {
        return list_has_pc;
    }
    mnemonic.starts_with("ldm") && op_str.trim_start().starts_with("sp") && list_has_pc
}

/// A bare register operand, as opposed to an immediate (`#0x1234`) or a
/// register list.
fn reg_operand(op_str: &str) -> bool {
    !op_str.is_empty() && !op_str.starts_with('#') && !op_str.contains(',')
}

fn classify(cs: &Capstone, insn: &Insn, mnemonic: &str, op_str: &str) -> InstFlags {
    let mut flags = InstFlags::empty();
    let Ok(detail) = cs.insn_detail(insn) else {
        return flags;
    };

    let mut is_jump = false;
    let mut is_call = false;
    for group in detail.groups() {
        match cs.group_name(*group).as_deref() {
            Some("jump") => is_jump = true,
            Some("call") => is_call = true,
            _ => {}
        }
    }
    let cond = match detail.arch_detail() {
        ArchDetail::ArmDetail(arm) => arm.cc(),
        _ => ArmCC::ARM_CC_AL,
    };
    let uncond = matches!(cond, ArmCC::ARM_CC_AL | ArmCC::ARM_CC_INVALID);

    if loads_pc_from_stack(mnemonic, op_str) {
        flags |= InstFlags::RET | InstFlags::UNCOND_FLOW;
    }
    let mov_to_pc = mnemonic == "mov"
        && op_str.starts_with("pc,")
        && reg_operand(op_str.split(',').nth(1).unwrap_or("").trim());
    if ((mnemonic == "bx" || mnemonic == "bxj") && reg_operand(op_str) || mov_to_pc) && uncond {
        flags |= InstFlags::JMP_REG_UNCOND | InstFlags::UNCOND_FLOW;
    }
    if mnemonic == "blx" && reg_operand(op_str) && uncond {
        flags |= InstFlags::CALL_REG;
    }
    if is_jump || is_call {
        if mnemonic == "cbz" || mnemonic == "cbnz" || !uncond {
            flags |= InstFlags::COND_FLOW;
        } else {
            flags |= InstFlags::UNCOND_FLOW;
        }
    }
    if mnemonic == "nop" {
        flags |= InstFlags::NOP;
    } else if mnemonic == "mov" {
        let mut regs = op_str.split(',').map(str::trim);
        if let (Some(dst), Some(src), None) = (regs.next(), regs.next(), regs.next()) {
            if dst == src {
                flags |= InstFlags::NOP;
            }
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::InstSeq;

    fn dasm() -> Arc<dyn Disassembler> {
        new(Arch::Arm).unwrap().unwrap()
    }

    #[test]
    fn decodes_word_aligned_stream() {
        // mov r0, r1 ; bx lr
        let bytes = [0x01, 0x00, 0xa0, 0xe1, 0x1e, 0xff, 0x2f, 0xe1];
        let seq = InstSeq::decode(dasm(), 0x8000, &bytes);
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.get(0).unwrap().text(), "mov r0, r1");
        assert_eq!(seq.get(1).unwrap().addr(), 0x8004);
        assert!(seq.get(1).unwrap().jmp_reg_uncond());
    }

    #[test]
    fn pop_with_pc_is_a_return() {
        // pop {r4, pc}
        let bytes = [0x10, 0x80, 0xbd, 0xe8];
        let seq = InstSeq::decode(dasm(), 0, &bytes);
        let inst = seq.first().unwrap();
        assert!(inst.ret(), "expected a return: {}", inst.text());
        assert!(inst.has_uncond_ctrl_flow());
    }

    #[test]
    fn blx_register_is_a_register_call() {
        // blx r3
        let bytes = [0x33, 0xff, 0x2f, 0xe1];
        let seq = InstSeq::decode(dasm(), 0, &bytes);
        assert!(seq.first().unwrap().call_reg());
    }

    #[test]
    fn conditional_branch_is_conditional_flow() {
        // beq +8
        let bytes = [0x00, 0x00, 0x00, 0x0a];
        let seq = InstSeq::decode(dasm(), 0, &bytes);
        let inst = seq.first().unwrap();
        assert!(inst.has_cond_ctrl_flow(), "got {}", inst.text());
        assert!(!inst.has_uncond_ctrl_flow());
    }

    #[test]
    fn partial_trailing_word_is_bad() {
        // one whole mov plus two stray bytes
        let bytes = [0x01, 0x00, 0xa0, 0xe1, 0x01, 0x00];
        let seq = InstSeq::decode(dasm(), 0, &bytes);
        assert_eq!(seq.len(), 2);
        assert!(seq.get(1).unwrap().bad());
        assert_eq!(seq.get(1).unwrap().len(), 2);
    }
}
