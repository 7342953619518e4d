//! Netpbm output for scanned lines.

use std::io::Write;

use anyhow::{bail, Result};
use scan_driver::ScanLine;

/// Write `lines` as PBM, PGM or PPM depending on depth and channels.
///
/// 16-bit samples come out of the driver little-endian; netpbm wants them
/// big-endian.
pub fn write_pnm<W: Write>(
    out: &mut W,
    lines: &[ScanLine],
    pixels: u32,
    channels: u8,
    depth: u8,
) -> Result<()> {
    let magic = match (depth, channels) {
        (1, 1) => "P4",
        (8 | 16, 1) => "P5",
        (8 | 16, 3) => "P6",
        _ => bail!("no netpbm format for {channels} channel(s) at depth {depth}"),
    };
    write!(out, "{magic}\n{pixels} {}\n", lines.len())?;
    if depth != 1 {
        let max = if depth == 16 { 65535 } else { 255 };
        writeln!(out, "{max}")?;
    }
    for line in lines {
        if depth == 16 {
            let swapped: Vec<u8> = line
                .data
                .chunks_exact(2)
                .flat_map(|pair| [pair[1], pair[0]])
                .collect();
            out.write_all(&swapped)?;
        } else {
            out.write_all(&line.data)?;
        }
    }
    out.flush()?;
    Ok(())
}
