//! Terminator selection predicates.

use bitflags::bitflags;
use regex::{Regex, RegexBuilder};

use crate::error::Result;
use crate::inst::{Inst, InstSeq};

bitflags! {
    /// Which kinds of intra-gadget control flow a matcher admits in a gadget
    /// body. The terminator itself is exempt.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct FlowAllow: u8 {
        const UNCOND = 1 << 0;
        const COND   = 1 << 1;
    }
}

impl Default for FlowAllow {
    fn default() -> FlowAllow {
        FlowAllow::all()
    }
}

/// Selects gadget terminators.
///
/// The predicate is evaluated against the first instruction of a probe
/// sequence; during the backward walk it is also consulted over candidate
/// bodies to detect an equivalent terminator appearing earlier.
pub trait Matcher {
    /// Whether the sequence starts with an acceptable terminator.
    fn matches(&self, seq: &InstSeq) -> bool;

    /// Control-flow admission for gadget bodies.
    fn flow(&self) -> FlowAllow {
        FlowAllow::all()
    }
}

/// Matches return instructions.
#[derive(Clone, Copy, Debug, Default)]
pub struct Rets {
    pub flow: FlowAllow,
}

impl Matcher for Rets {
    fn matches(&self, seq: &InstSeq) -> bool {
        seq.first().is_some_and(Inst::ret)
    }

    fn flow(&self) -> FlowAllow {
        self.flow
    }
}

/// Matches unconditional register-indirect jumps.
#[derive(Clone, Copy, Debug, Default)]
pub struct JmpRegUncond {
    pub flow: FlowAllow,
}

impl Matcher for JmpRegUncond {
    fn matches(&self, seq: &InstSeq) -> bool {
        seq.first().is_some_and(Inst::jmp_reg_uncond)
    }

    fn flow(&self) -> FlowAllow {
        self.flow
    }
}

/// Matches register calls.
#[derive(Clone, Copy, Debug, Default)]
pub struct CallReg {
    pub flow: FlowAllow,
}

impl Matcher for CallReg {
    fn matches(&self, seq: &InstSeq) -> bool {
        seq.first().is_some_and(Inst::call_reg)
    }

    fn flow(&self) -> FlowAllow {
        self.flow
    }
}

/// Fallback matcher running a case-insensitive pattern over the rendered
/// first instruction.
#[derive(Clone, Debug)]
pub struct RegexMatcher {
    pattern: Regex,
    pub flow: FlowAllow,
}

impl RegexMatcher {
    pub fn new(pattern: &str) -> Result<RegexMatcher> {
        let pattern = RegexBuilder::new(pattern).case_insensitive(true).build()?;
        Ok(RegexMatcher {
            pattern,
            flow: FlowAllow::all(),
        })
    }
}

impl Matcher for RegexMatcher {
    fn matches(&self, seq: &InstSeq) -> bool {
        seq.first()
            .is_some_and(|inst| self.pattern.is_match(inst.text()))
    }

    fn flow(&self) -> FlowAllow {
        self.flow
    }
}
