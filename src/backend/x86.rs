//! x86 / x86-64 backend on top of `iced-x86`.

use std::sync::Arc;

use iced_x86::{
    Decoder, DecoderOptions, FlowControl, Formatter, Instruction, IntelFormatter, Mnemonic, OpKind,
    Register,
};

use crate::arch::Arch;
use crate::decoder::{Disassembler, InstIter};
use crate::error::Result;
use crate::inst::{Inst, InstFlags};

/// Builds an x86 decoder, or `None` for non-x86 architectures.
pub fn new(arch: Arch) -> Result<Option<Arc<dyn Disassembler>>> {
    let bitness = match arch {
        Arch::X86 => 32,
        Arch::X86_64 => 64,
        _ => return Ok(None),
    };
    Ok(Some(Arc::new(X86Dasm { arch, bitness })))
}

struct X86Dasm {
    arch: Arch,
    bitness: u32,
}

impl Disassembler for X86Dasm {
    fn arch(&self) -> Arch {
        self.arch
    }

    fn decode<'a>(&'a self, addr: u64, bytes: &'a [u8]) -> InstIter<'a> {
        let mut formatter = IntelFormatter::new();
        formatter.options_mut().set_hex_prefix("0x");
        formatter.options_mut().set_hex_suffix("");
        formatter.options_mut().set_uppercase_hex(false);
        formatter.options_mut().set_space_after_operand_separator(true);
        formatter.options_mut().set_rip_relative_addresses(true);
        Box::new(X86Iter {
            decoder: Decoder::with_ip(self.bitness, bytes, addr, DecoderOptions::NONE),
            formatter,
            bytes,
            arch: self.arch,
            done: false,
        })
    }
}

struct X86Iter<'a> {
    decoder: Decoder<'a>,
    formatter: IntelFormatter,
    bytes: &'a [u8],
    arch: Arch,
    done: bool,
}

impl Iterator for X86Iter<'_> {
    type Item = Inst;

    fn next(&mut self) -> Option<Inst> {
        if self.done || !self.decoder.can_decode() {
            return None;
        }
        let start = self.decoder.position();
        let ins = self.decoder.decode();
        let end = self.decoder.position().max(start + 1).min(self.bytes.len());
        let raw = self.bytes[start..end].to_vec();
        if ins.is_invalid() {
            self.done = true;
            return Some(Inst::undecodable(ins.ip(), raw, self.arch));
        }
        let mut text = String::new();
        self.formatter.format(&ins, &mut text);
        Some(Inst::new(ins.ip(), raw, self.arch, text, classify(&ins)))
    }
}

/// Encoding classes that never yield a useful gadget body. Returns are in
/// here on purpose: they terminate gadgets but poison bodies.
fn rejected(mnemonic: Mnemonic) -> bool {
    matches!(
        mnemonic,
        Mnemonic::In
            | Mnemonic::Insb
            | Mnemonic::Insw
            | Mnemonic::Insd
            | Mnemonic::Outsb
            | Mnemonic::Outsw
            | Mnemonic::Outsd
            | Mnemonic::Hlt
            | Mnemonic::Ret
            | Mnemonic::Retf
    )
}

/// Whether the branch target is a register, directly or as the base or
/// index of a memory operand. An absolute memory address with neither is
/// not register-controlled.
fn reg_target(ins: &Instruction) -> bool {
    match ins.op0_kind() {
        OpKind::Register => true,
        OpKind::Memory => {
            ins.memory_base() != Register::None || ins.memory_index() != Register::None
        }
        _ => false,
    }
}

fn classify(ins: &Instruction) -> InstFlags {
    let mut flags = InstFlags::empty();
    match ins.flow_control() {
        FlowControl::Return
        | FlowControl::Call
        | FlowControl::IndirectCall
        | FlowControl::UnconditionalBranch
        | FlowControl::IndirectBranch => flags |= InstFlags::UNCOND_FLOW,
        FlowControl::ConditionalBranch => flags |= InstFlags::COND_FLOW,
        _ => {}
    }
    match ins.mnemonic() {
        Mnemonic::Ret | Mnemonic::Retf => flags |= InstFlags::RET,
        Mnemonic::Jmp if reg_target(ins) => flags |= InstFlags::JMP_REG_UNCOND,
        Mnemonic::Call if reg_target(ins) => flags |= InstFlags::CALL_REG,
        Mnemonic::Nop => flags |= InstFlags::NOP,
        // a register moved onto itself does nothing
        Mnemonic::Mov
            if ins.op_count() == 2
                && ins.op0_kind() == OpKind::Register
                && ins.op1_kind() == OpKind::Register
                && ins.op0_register() == ins.op1_register() =>
        {
            flags |= InstFlags::NOP
        }
        _ => {}
    }
    if rejected(ins.mnemonic()) {
        flags |= InstFlags::BAD;
    }
    flags
}
