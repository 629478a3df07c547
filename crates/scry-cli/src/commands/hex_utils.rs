//! Hex address parsing.

use anyhow::Result;

/// Parse a hex address string (with or without 0x prefix).
pub fn parse_hex_address(s: &str) -> Result<u64> {
    let digits = s
        .trim()
        .strip_prefix("0x")
        .or_else(|| s.trim().strip_prefix("0X"))
        .unwrap_or(s.trim());
    u64::from_str_radix(digits, 16).map_err(|e| anyhow::anyhow!("Invalid hex address {:?}: {}", s, e))
}
