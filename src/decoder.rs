//! The disassembler interface and backend discovery.

use std::sync::Arc;

use log::debug;

use crate::arch::Arch;
use crate::backend;
use crate::error::{Error, Result};
use crate::inst::Inst;

/// The lazy instruction stream a backend produces.
pub type InstIter<'a> = Box<dyn Iterator<Item = Inst> + 'a>;

/// A streaming instruction decoder for one architecture.
///
/// The decoded sequence starts at `addr`, covers `bytes` greedily from the
/// start, and stops at the first undecodable byte after yielding a marker
/// whose [`Inst::bad`] is true. Behaviour past a bad instruction is
/// unspecified; callers never decode past one.
pub trait Disassembler {
    /// The architecture this decoder decodes.
    fn arch(&self) -> Arch;

    /// Decodes `bytes` as if loaded at `addr`.
    fn decode<'a>(&'a self, addr: u64, bytes: &'a [u8]) -> InstIter<'a>;
}

type Factory = fn(Arch) -> Result<Option<Arc<dyn Disassembler>>>;

/// One named backend factory in the registry.
///
/// A factory returns a ready decoder, `None` when the library is present but
/// does not cover the requested architecture, or [`Error::LibNotFound`] when
/// the library itself is unusable.
pub struct Backend {
    pub name: &'static str,
    pub rank: i32,
    factory: Factory,
}

/// The built-in registry, highest rank first. The native x86 decoder ranks
/// above capstone so x86 images stay off the generic path.
pub fn backends() -> Vec<Backend> {
    let mut all = vec![
        Backend {
            name: "iced",
            rank: 200,
            factory: backend::x86::new,
        },
        Backend {
            name: "capstone",
            rank: 100,
            factory: backend::arm::new,
        },
    ];
    all.sort_by(|a, b| b.rank.cmp(&a.rank));
    all
}

/// Resolves a decoder for `arch`, scanning the registry in descending rank.
///
/// # Examples
/// ```
/// use ropscan::{find_disassembler, Arch};
///
/// let dasm = find_disassembler(Arch::X86_64)?;
/// assert_eq!(dasm.arch(), Arch::X86_64);
/// # Ok::<(), ropscan::Error>(())
/// ```
pub fn find_disassembler(arch: Arch) -> Result<Arc<dyn Disassembler>> {
    let mut tried = Vec::new();
    for backend in backends() {
        tried.push(backend.name);
        match (backend.factory)(arch) {
            Ok(Some(dasm)) => {
                debug!("decoding {arch} with the {} backend", backend.name);
                return Ok(dasm);
            }
            Ok(None) => continue,
            Err(Error::LibNotFound(reason)) => {
                debug!("backend {} unavailable: {reason}", backend.name);
                continue;
            }
            Err(err) => return Err(err),
        }
    }
    Err(Error::ArchNotSupported { arch, tried })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_rank_ordered() {
        let all = backends();
        assert!(all.windows(2).all(|w| w[0].rank >= w[1].rank));
    }

    #[test]
    fn x86_resolves_to_the_native_backend() {
        for arch in [Arch::X86, Arch::X86_64] {
            let dasm = find_disassembler(arch).unwrap();
            assert_eq!(dasm.arch(), arch);
        }
    }

    #[test]
    fn mips_is_unsupported() {
        match find_disassembler(Arch::Mips) {
            Err(Error::ArchNotSupported { arch, tried }) => {
                assert_eq!(arch, Arch::Mips);
                assert_eq!(tried, vec!["iced", "capstone"]);
            }
            Err(other) => panic!("expected ArchNotSupported, got {other:?}"),
            Ok(_) => panic!("expected ArchNotSupported, got a disassembler"),
        }
    }
}
