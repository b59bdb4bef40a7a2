//! Driver embedding
//!
//! Turns a driver file into Rust source holding its bytes as a constant array,
//! so a loader can be built with the image compiled in, and reads such source
//! back.

use std::fmt::Write as _;

use anyhow::{anyhow, bail, Context, Result};

const BYTES_PER_ROW: usize = 16;

/// Renders `bytes` as a `DRIVER_BYTES` array. `source` is recorded in the
/// header comment.
pub fn render(bytes: &[u8], source: &str) -> Result<String> {
    if bytes.is_empty() {
        bail!("{} is empty", source);
    }

    let mut out = String::with_capacity(bytes.len() * 6 + 256);
    writeln!(out, "// Generated from {}", source)?;
    writeln!(out, "// Size: {} bytes", bytes.len())?;
    writeln!(out)?;
    writeln!(out, "pub const DRIVER_SIZE: usize = {};", bytes.len())?;
    writeln!(out)?;
    writeln!(out, "pub static DRIVER_BYTES: [u8; {}] = [", bytes.len())?;

    let last = bytes.len() - 1;
    for (row, chunk) in bytes.chunks(BYTES_PER_ROW).enumerate() {
        out.push_str("    ");
        for (col, byte) in chunk.iter().enumerate() {
            let index = row * BYTES_PER_ROW + col;
            write!(out, "0x{:02x}", byte)?;
            if index != last {
                out.push(',');
                if col + 1 != chunk.len() {
                    out.push(' ');
                }
            }
        }
        out.push('\n');
    }
    out.push_str("];\n");

    log::debug!("[Embed] rendered {} bytes from {}", bytes.len(), source);
    Ok(out)
}

/// Recovers the bytes from source produced by [`render`].
pub fn parse(text: &str) -> Result<Vec<u8>> {
    let start = text
        .find("DRIVER_BYTES")
        .and_then(|at| text[at..].find('[').map(|open| at + open))
        .ok_or_else(|| anyhow!("no DRIVER_BYTES array found"))?;
    // Skip the `[u8; N]` type, the body starts at the next bracket.
    let body_start = text[start + 1..]
        .find('[')
        .map(|open| start + 1 + open + 1)
        .ok_or_else(|| anyhow!("DRIVER_BYTES has no initialiser"))?;
    let body_end = text[body_start..]
        .find(']')
        .map(|close| body_start + close)
        .ok_or_else(|| anyhow!("DRIVER_BYTES array is not closed"))?;

    let bytes = text[body_start..body_end]
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| {
            let hex = token
                .strip_prefix("0x")
                .ok_or_else(|| anyhow!("unexpected token {:?}", token))?;
            u8::from_str_radix(hex, 16).with_context(|| format!("bad byte {:?}", token))
        })
        .collect::<Result<Vec<u8>>>()?;

    if bytes.is_empty() {
        bail!("DRIVER_BYTES is empty");
    }
    Ok(bytes)
}
