//! Crate-wide error and result types.

use std::io;

use thiserror::Error;

use crate::arch::Arch;

/// A convenience alias for a Result over [`enum@Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures that abort an invocation.
///
/// Per-candidate problems inside the search (undecodable bytes, rejected
/// gadget bodies, decode desync at one window) are not errors; they discard
/// the affected candidate and the scan continues.
#[derive(Debug, Error)]
pub enum Error {
    /// The ELF machine field does not map to a registered architecture.
    #[error("unknown elf arch {0:?}")]
    UnknownElfArch(String),

    /// No backend in the registry can decode the requested architecture.
    #[error("no disassembler for {arch} (tried: {tried:?})")]
    ArchNotSupported {
        arch: Arch,
        tried: Vec<&'static str>,
    },

    /// A backend's underlying decoder library failed to initialise.
    ///
    /// During discovery this demotes the backend instead of failing the
    /// invocation; it surfaces only when every backend is unusable.
    #[error("disassembler library unavailable: {0}")]
    LibNotFound(String),

    /// The input is not a well-formed ELF image.
    #[error("malformed elf: {0}")]
    Elf(#[from] goblin::error::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// A user-supplied matcher pattern failed to compile.
    #[error("bad matcher pattern: {0}")]
    BadPattern(#[from] regex::Error),
}
