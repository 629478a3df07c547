use encoding_rs::UTF_16LE;

use crate::error::{Error, Result};
use crate::memory::layout::string;
use crate::memory::transport::{Transport, TransportExt};

/// Strings longer than this are treated as corrupt
pub const MAX_STRING_CHARS: u32 = 0x1000;

/// Read a managed UTF-16 string object.
pub fn read_utf16_string<R: Transport + ?Sized>(reader: &R, address: u64) -> Result<String> {
    if address == 0 {
        return Err(Error::InvalidAddress(address));
    }

    let len = reader.read_i32(address + string::LENGTH)?;
    if len < 0 || len as u32 > MAX_STRING_CHARS {
        return Err(Error::CountOutOfRange {
            count: len.max(0) as u32,
            max: MAX_STRING_CHARS,
        });
    }
    if len == 0 {
        return Ok(String::new());
    }

    let bytes = reader.read_bytes(address + string::CHARS, len as usize * 2)?;
    let (decoded, _) = UTF_16LE.decode_without_bom_handling(&bytes);
    Ok(decoded.into_owned())
}
