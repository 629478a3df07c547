//! Raw memory dump.
//!
//! ```text
//! 0x1431B08A0: 48 65 6C 6C 6F 20 57 6F  72 6C 64 00 00 00 00 00  |Hello World.....|
//! ```

use std::fmt::Write;

use anyhow::Result;
use owo_colors::OwoColorize;
use scry_core::TransportExt;

use super::Target;

pub fn run(target: &Target<'_>, address: u64, size: usize, ascii: bool) -> Result<()> {
    let transport = target.attach()?;
    let bytes = transport.read_bytes(address, size)?;

    for (i, chunk) in bytes.chunks(16).enumerate() {
        println!("{}", format_line(address + (i * 16) as u64, chunk, ascii));
    }
    Ok(())
}

fn format_line(address: u64, chunk: &[u8], ascii: bool) -> String {
    let mut line = format!("{}: ", format!("{:#011X}", address).cyan());

    for j in 0..16 {
        if j == 8 {
            line.push(' ');
        }
        match chunk.get(j) {
            Some(0) => {
                let _ = write!(line, "{} ", "00".dimmed());
            }
            Some(byte) => {
                let _ = write!(line, "{:02X} ", byte);
            }
            None => line.push_str("   "),
        }
    }

    if ascii {
        line.push_str(" |");
        for j in 0..16 {
            line.push(match chunk.get(j) {
                Some(&b) if (0x20..0x7F).contains(&b) => b as char,
                Some(_) => '.',
                None => ' ',
            });
        }
        line.push('|');
    }
    line
}
