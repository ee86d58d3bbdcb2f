use std::fs::File;
use std::io::{stdout, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, LevelFilter};

use ropscan::{
    search_elf_for_call_reg_gadgets, search_elf_for_jmp_reg_gadgets, search_elf_for_regex_gadgets,
    search_elf_for_ret_gadgets, Gadget, Image, DEFAULT_DEPTH,
};

/// Search an ELF executable for ROP gadgets.
#[derive(Parser)]
#[command(version, about)]
struct Opt {
    /// The ELF file to search
    elf: PathBuf,

    /// Search for gadgets ending in an unconditional register-indirect jump
    #[arg(short, long, conflicts_with_all = ["call_reg", "regex", "syms"])]
    jmp_reg: bool,

    /// Search for gadgets ending in a register call
    #[arg(short, long, conflicts_with_all = ["regex", "syms"])]
    call_reg: bool,

    /// Search for gadgets whose terminator matches a regular expression
    #[arg(short, long, value_name = "PATTERN", conflicts_with = "syms")]
    regex: Option<String>,

    /// Maximum number of bytes to walk back from each terminator
    #[arg(short = 'n', long, default_value_t = DEFAULT_DEPTH)]
    depth: usize,

    /// List executable symbols instead of searching for gadgets
    #[arg(long)]
    syms: bool,

    /// Log progress; repeat for decode-level detail
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    let level = if opt.quiet {
        LevelFilter::Error
    } else {
        match opt.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            _ => LevelFilter::Debug,
        }
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();

    let mut file =
        File::open(&opt.elf).with_context(|| format!("open {}", opt.elf.display()))?;

    if opt.syms {
        return list_symbols(&mut file);
    }

    let gadgets: Box<dyn Iterator<Item = Gadget>> = if let Some(pattern) = &opt.regex {
        Box::new(search_elf_for_regex_gadgets(&mut file, opt.depth, pattern)?)
    } else if opt.jmp_reg {
        Box::new(search_elf_for_jmp_reg_gadgets(&mut file, opt.depth)?)
    } else if opt.call_reg {
        Box::new(search_elf_for_call_reg_gadgets(&mut file, opt.depth)?)
    } else {
        Box::new(search_elf_for_ret_gadgets(&mut file, opt.depth)?)
    };

    let mut out = BufWriter::new(stdout().lock());
    let mut count = 0usize;
    for gadget in gadgets {
        writeln!(out, "{gadget}\n")?;
        count += 1;
    }
    out.flush()?;
    info!("found {count} gadgets");
    Ok(())
}

fn list_symbols(file: &mut File) -> Result<()> {
    let image = Image::parse(file)?;
    let mut out = BufWriter::new(stdout().lock());
    for sym in image.executable_symbols() {
        writeln!(out, "{:016x} {:>8} {}", sym.value, sym.size, sym.name)?;
    }
    out.flush()?;
    Ok(())
}
