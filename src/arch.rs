//! The architecture registry.

use core::fmt;

use crate::error::{Error, Result};

/// The closed set of instruction-set architectures the crate knows about.
///
/// `Arch` is a routing key between the ELF machine field and the
/// disassembler backends; it carries no decoding logic of its own.
#[cfg_attr(
    feature = "serialization",
    derive(serde::Deserialize, serde::Serialize)
)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Arch {
    X86,
    X86_64,
    Arm,
    Thumb,
    Thumb2,
    Mips,
}

/// Every registered architecture, in registry order.
pub const ARCHES: [Arch; 6] = [
    Arch::X86,
    Arch::X86_64,
    Arch::Arm,
    Arch::Thumb,
    Arch::Thumb2,
    Arch::Mips,
];

impl Arch {
    /// The canonical tag for this architecture.
    pub fn tag(self) -> &'static str {
        match self {
            Arch::X86 => "x86",
            Arch::X86_64 => "x86-64",
            Arch::Arm => "arm",
            Arch::Thumb => "thumb",
            Arch::Thumb2 => "thumb2",
            Arch::Mips => "mips",
        }
    }

    /// Width of a virtual address on this architecture, in bits.
    pub fn address_bits(self) -> u32 {
        match self {
            Arch::X86_64 => 64,
            _ => 32,
        }
    }

    /// Maps an ELF machine string to an architecture.
    ///
    /// Normalises the spellings ELF header readers produce (`"x64"`,
    /// `"x86"`, `"ARM"`) and otherwise matches canonical tags exactly.
    ///
    /// # Examples
    /// ```
    /// use ropscan::Arch;
    /// assert_eq!(Arch::from_elf_machine_arch("x64").unwrap(), Arch::X86_64);
    /// assert_eq!(Arch::from_elf_machine_arch("thumb2").unwrap(), Arch::Thumb2);
    /// assert!(Arch::from_elf_machine_arch("s390").is_err());
    /// ```
    pub fn from_elf_machine_arch(machine_arch: &str) -> Result<Arch> {
        let ma = machine_arch.trim();
        match ma {
            "x64" => Ok(Arch::X86_64),
            "x86" => Ok(Arch::X86),
            "ARM" => Ok(Arch::Arm),
            _ => ARCHES
                .iter()
                .copied()
                .find(|arch| arch.tag() == ma)
                .ok_or_else(|| Error::UnknownElfArch(ma.to_owned())),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.tag())
    }
}
