//! Page table introspection
//!
//! One line per mapped page below the declared size:
//!
//! ```text
//! START PAGE TABLE
//! <page index> <P|-> <U|-> <W|-> <frame index>
//! END PAGE TABLE
//! ```
//!
//! Indices are lowercase hex. Field order is stable; tests and tooling
//! parse it back with [`PageReport::from_str`](core::str::FromStr).

use alloc::vec::Vec;
use core::fmt::{self, Write};
use core::str::FromStr;

use super::address::{PhysFrame, VirtAddr, PAGE_SHIFT};
use super::paging::PteFlags;
use super::space::AddressSpace;

pub const DUMP_START: &str = "START PAGE TABLE";
pub const DUMP_END: &str = "END PAGE TABLE";

/// One line of a page table dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageReport {
    pub index: usize,
    pub flags: PteFlags,
    pub frame: PhysFrame,
}

impl fmt::Display for PageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |flag: PteFlags, c: char| if self.flags.contains(flag) { c } else { '-' };
        write!(
            f,
            "{:x} {} {} {} {:x}",
            self.index,
            bit(PteFlags::PRESENT, 'P'),
            bit(PteFlags::USER, 'U'),
            bit(PteFlags::WRITABLE, 'W'),
            self.frame.index()
        )
    }
}

/// Error parsing a dump line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseReportError;

impl fmt::Display for ParseReportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed page table dump line")
    }
}

impl FromStr for PageReport {
    type Err = ParseReportError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut fields = line.split_ascii_whitespace();
        let mut next = || fields.next().ok_or(ParseReportError);

        let index = usize::from_str_radix(next()?, 16).map_err(|_| ParseReportError)?;
        let mut flags = PteFlags::empty();
        for (flag, c) in [
            (PteFlags::PRESENT, "P"),
            (PteFlags::USER, "U"),
            (PteFlags::WRITABLE, "W"),
        ] {
            match next()? {
                s if s == c => flags |= flag,
                "-" => {}
                _ => return Err(ParseReportError),
            }
        }
        let frame = usize::from_str_radix(next()?, 16).map_err(|_| ParseReportError)?;
        if fields.next().is_some() {
            return Err(ParseReportError);
        }

        Ok(Self {
            index,
            flags,
            frame: PhysFrame::new(frame),
        })
    }
}

/// Every page below the declared size that has an entry.
pub fn report(space: &AddressSpace) -> Vec<PageReport> {
    (0..space.size() >> PAGE_SHIFT)
        .filter_map(|index| {
            space
                .translate(VirtAddr::from_page_index(index))
                .map(|entry| PageReport {
                    index,
                    flags: entry.flags(),
                    frame: entry.frame(),
                })
        })
        .collect()
}

/// Write the textual dump of `space` to `out`.
pub fn dump<W: Write + ?Sized>(space: &AddressSpace, out: &mut W) -> fmt::Result {
    writeln!(out, "{}", DUMP_START)?;
    for line in report(space) {
        writeln!(out, "{}", line)?;
    }
    writeln!(out, "{}", DUMP_END)
}
