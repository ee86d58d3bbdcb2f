//! ELF image loading and executable-memory projection.

use std::io::Read;

use goblin::elf::program_header::{pt_to_str, PF_X};
use goblin::elf::Elf;
use log::{debug, info, warn};

use crate::arch::Arch;
use crate::error::Result;

/// A maximal contiguous span of executable memory, projected the way the
/// loader would lay it out at load time.
///
/// The byte at `bytes[i]` is mapped at virtual address `base_addr + i`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    pub bytes: Vec<u8>,
    pub base_addr: u64,
}

/// A symbol from `.symtab`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub value: u64,
    pub size: u64,
}

/// The program-header fields the projection needs.
#[derive(Clone, Copy, Debug)]
struct Phdr {
    vaddr: u64,
    filesz: u64,
    offset: u64,
}

/// A parsed ELF image, ready to project executable segments.
pub struct Image {
    data: Vec<u8>,
    arch: Arch,
    num_sections: usize,
    num_segments: usize,
    /// Surviving PF_X headers, ascending by virtual address.
    xsegs: Vec<Phdr>,
    /// Half-open `[lo, hi)` union of the surviving extents.
    intervals: Vec<(u64, u64)>,
    symbols: Vec<Symbol>,
}

impl Image {
    /// Reads the whole stream and parses it as an ELF image.
    pub fn parse<R: Read>(io: &mut R) -> Result<Image> {
        let mut data = Vec::new();
        io.read_to_end(&mut data)?;
        Image::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Image> {
        let elf = Elf::parse(&data)?;
        info!(
            "parsed elf file with {} sections and {} segments",
            elf.section_headers.len(),
            elf.program_headers.len()
        );
        let arch = Arch::from_elf_machine_arch(&machine_arch(elf.header.e_machine))?;
        info!("  elf file arch is {arch}");

        let mut xsegs = Vec::new();
        for ph in &elf.program_headers {
            if ph.p_flags & PF_X == 0 {
                continue;
            }
            info!(
                "  {}(0x{:x}..0x{:x})",
                pt_to_str(ph.p_type),
                ph.p_vaddr,
                ph.p_vaddr + ph.p_memsz
            );
            if ph.p_filesz == 0 {
                info!("    segment is empty on file, skipping it");
                continue;
            }
            if ph.p_filesz != ph.p_memsz {
                warn!(
                    "executable segment at 0x{:x} occupies 0x{:x} bytes on file \
                     but 0x{:x} in memory; skipping it",
                    ph.p_vaddr, ph.p_filesz, ph.p_memsz
                );
                continue;
            }
            let (start, end) = (ph.p_offset, ph.p_offset + ph.p_filesz);
            if end > data.len() as u64 || start > end {
                warn!(
                    "executable segment at 0x{:x} reaches past the end of the \
                     file; skipping it",
                    ph.p_vaddr
                );
                continue;
            }
            xsegs.push(Phdr {
                vaddr: ph.p_vaddr,
                filesz: ph.p_filesz,
                offset: ph.p_offset,
            });
        }
        xsegs.sort_by_key(|ph| ph.vaddr);

        let intervals = merge_extents(&xsegs);
        debug!("executable data intervals: {intervals:x?}");
        if intervals.is_empty() {
            warn!(
                "no executable data to search for instructions; if this is a \
                 normal elf file then this is probably a bug"
            );
        }

        let symbols = elf
            .syms
            .iter()
            .map(|sym| Symbol {
                name: elf.strtab.get_at(sym.st_name).unwrap_or("").to_owned(),
                value: sym.st_value,
                size: sym.st_size,
            })
            .collect();

        let num_sections = elf.section_headers.len();
        let num_segments = elf.program_headers.len();
        Ok(Image {
            data,
            arch,
            num_sections,
            num_segments,
            xsegs,
            intervals,
            symbols,
        })
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn num_sections(&self) -> usize {
        self.num_sections
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    /// Number of maximal executable extents.
    pub fn segment_count(&self) -> usize {
        self.intervals.len()
    }

    /// Projects the `index`th executable extent into a load-time buffer.
    ///
    /// Contributing file segments are spliced in ascending virtual-address
    /// order; where a later segment overlaps an earlier one (malformed, but
    /// tolerated) the last writer wins.
    pub fn segment(&self, index: usize) -> Option<Segment> {
        let &(lo, hi) = self.intervals.get(index)?;
        let size = (hi - lo) as usize;
        let mut bytes: Vec<u8> = Vec::with_capacity(size);
        for ph in &self.xsegs {
            if ph.vaddr < lo {
                continue;
            }
            if ph.vaddr >= hi {
                break;
            }
            let file = &self.data[ph.offset as usize..(ph.offset + ph.filesz) as usize];
            let start = (ph.vaddr - lo) as usize;
            if start == bytes.len() {
                bytes.extend_from_slice(file);
            } else {
                let end = start + file.len();
                if end > bytes.len() {
                    bytes.resize(end, 0);
                }
                bytes[start..end].copy_from_slice(file);
            }
        }
        assert_eq!(bytes.len(), size, "projected extent has the wrong size");
        Some(Segment {
            bytes,
            base_addr: lo,
        })
    }

    /// All executable extents, lowest base address first, projected lazily.
    pub fn executable_segments(&self) -> impl Iterator<Item = Segment> + '_ {
        (0..self.segment_count()).filter_map(|index| self.segment(index))
    }

    /// Symbols from `.symtab`, in table order.
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    /// Symbols whose value falls inside the executable map.
    pub fn executable_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter().filter(|sym| {
            self.intervals
                .iter()
                .any(|&(lo, hi)| lo <= sym.value && sym.value < hi)
        })
    }
}

/// The pyelftools-style machine string for an `e_machine` value.
fn machine_arch(e_machine: u16) -> String {
    use goblin::elf::header::{EM_386, EM_ARM, EM_MIPS, EM_X86_64};

    match e_machine {
        EM_386 => "x86".to_owned(),
        EM_X86_64 => "x64".to_owned(),
        EM_ARM => "ARM".to_owned(),
        EM_MIPS => "mips".to_owned(),
        other => format!("EM#{other}"),
    }
}

/// Unions the half-open extents `[vaddr, vaddr + filesz)`, merging intervals
/// that touch so adjacent segments project into one buffer.
fn merge_extents(xsegs: &[Phdr]) -> Vec<(u64, u64)> {
    let mut merged: Vec<(u64, u64)> = Vec::new();
    for ph in xsegs {
        let (lo, hi) = (ph.vaddr, ph.vaddr + ph.filesz);
        if lo == hi {
            continue;
        }
        match merged.last_mut() {
            Some((_, end)) if lo <= *end => *end = hi.max(*end),
            _ => merged.push((lo, hi)),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phdr(vaddr: u64, filesz: u64) -> Phdr {
        Phdr {
            vaddr,
            filesz,
            offset: 0,
        }
    }

    #[test]
    fn touching_extents_merge() {
        let merged = merge_extents(&[phdr(0x1000, 0x100), phdr(0x1100, 0x100)]);
        assert_eq!(merged, vec![(0x1000, 0x1200)]);
    }

    #[test]
    fn disjoint_extents_stay_apart() {
        let merged = merge_extents(&[phdr(0x1000, 0x100), phdr(0x2000, 0x100)]);
        assert_eq!(merged, vec![(0x1000, 0x1100), (0x2000, 0x2100)]);
    }

    #[test]
    fn overlapping_extents_union() {
        let merged = merge_extents(&[phdr(0x1000, 0x200), phdr(0x1100, 0x80)]);
        assert_eq!(merged, vec![(0x1000, 0x1200)]);
    }

    #[test]
    fn empty_extents_are_ignored() {
        assert!(merge_extents(&[phdr(0x1000, 0)]).is_empty());
    }

    #[test]
    fn machine_strings() {
        use goblin::elf::header::{EM_386, EM_ARM, EM_X86_64};
        assert_eq!(machine_arch(EM_X86_64), "x64");
        assert_eq!(machine_arch(EM_386), "x86");
        assert_eq!(machine_arch(EM_ARM), "ARM");
        assert!(Arch::from_elf_machine_arch(&machine_arch(183)).is_err());
    }
}
