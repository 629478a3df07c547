//! Code cave discovery.

use memchr::memchr;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::memory::{Transport, TransportExt};

/// Bytes read per scan step
const SCAN_CHUNK: usize = 0x10000;

/// Caves start on this boundary
const CAVE_ALIGN: u64 = 16;

/// Find `size` bytes of `filler` in `[start, start + len)`, starting on a
/// 16-byte boundary.
///
/// Unreadable chunks are skipped and break any run in progress.
pub fn find_code_cave<R: Transport + ?Sized>(
    reader: &R,
    start: u64,
    len: usize,
    filler: u8,
    size: usize,
) -> Result<u64> {
    if size == 0 {
        return Err(Error::CaveNotFound { size });
    }

    let mut run_start = 0u64;
    let mut run_len = 0usize;
    let mut offset = 0usize;

    while offset < len {
        let chunk_len = SCAN_CHUNK.min(len - offset);
        let base = start + offset as u64;
        offset += chunk_len;

        let chunk = match reader.read_bytes(base, chunk_len) {
            Ok(chunk) => chunk,
            Err(e) => {
                trace!("Skipping unreadable chunk at {:#x}: {}", base, e);
                run_len = 0;
                continue;
            }
        };

        let mut i = 0;
        while i < chunk.len() {
            if run_len == 0 {
                match memchr(filler, &chunk[i..]) {
                    Some(pos) => {
                        i += pos;
                        run_start = base + i as u64;
                    }
                    None => break,
                }
            }

            let extent = chunk[i..]
                .iter()
                .position(|&b| b != filler)
                .unwrap_or(chunk.len() - i);
            run_len += extent;
            i += extent;

            if let Some(address) = aligned_fit(run_start, run_len, size) {
                debug!(
                    "Code cave of {} bytes at {:#x} (run of {} at {:#x})",
                    size, address, run_len, run_start
                );
                return Ok(address);
            }

            if i < chunk.len() {
                run_len = 0;
            }
        }
    }

    Err(Error::CaveNotFound { size })
}

fn aligned_fit(run_start: u64, run_len: usize, size: usize) -> Option<u64> {
    let aligned = run_start.next_multiple_of(CAVE_ALIGN);
    let skip = (aligned - run_start) as usize;
    (run_len >= skip + size).then_some(aligned)
}

/// Check that `[address, address + size)` still holds only `filler`.
pub fn is_cave_intact<R: Transport + ?Sized>(
    reader: &R,
    address: u64,
    size: usize,
    filler: u8,
) -> bool {
    reader
        .read_bytes(address, size)
        .map(|bytes| bytes.iter().all(|&b| b == filler))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MockTransportBuilder;

    const TEXT: u64 = 0x1_4000_0000;

    #[test]
    fn test_finds_aligned_run() {
        let mut text = vec![0x90u8; 0x200];
        // 0x43..0x100 is filler: first aligned start is 0x50
        text[0x43..0x100].fill(0xCC);
        let mock = MockTransportBuilder::new().bytes(TEXT, &text).build();

        let cave = find_code_cave(&mock, TEXT, text.len(), 0xCC, 0x80).unwrap();
        assert_eq!(cave, TEXT + 0x50);
    }

    #[test]
    fn test_short_runs_are_skipped() {
        let mut text = vec![0x90u8; 0x400];
        text[0x10..0x30].fill(0xCC);
        text[0x200..0x300].fill(0xCC);
        let mock = MockTransportBuilder::new().bytes(TEXT, &text).build();

        let cave = find_code_cave(&mock, TEXT, text.len(), 0xCC, 0x40).unwrap();
        assert_eq!(cave, TEXT + 0x200);
    }

    #[test]
    fn test_run_spanning_chunks() {
        let size = SCAN_CHUNK + 0x100;
        let mut text = vec![0x90u8; size];
        text[SCAN_CHUNK - 0x20..SCAN_CHUNK + 0x40].fill(0x00);
        let mock = MockTransportBuilder::new().bytes(TEXT, &text).build();

        let cave = find_code_cave(&mock, TEXT, size, 0x00, 0x50).unwrap();
        assert_eq!(cave, TEXT + SCAN_CHUNK as u64 - 0x20);
    }

    #[test]
    fn test_not_found() {
        let text = vec![0x90u8; 0x100];
        let mock = MockTransportBuilder::new().bytes(TEXT, &text).build();

        assert!(matches!(
            find_code_cave(&mock, TEXT, text.len(), 0xCC, 0x10),
            Err(Error::CaveNotFound { size: 0x10 })
        ));
    }

    #[test]
    fn test_is_cave_intact() {
        let mock = MockTransportBuilder::new()
            .bytes(TEXT, &[0xCC; 32])
            .bytes(TEXT + 8, &[0x00])
            .build();
        assert!(is_cave_intact(&mock, TEXT + 9, 16, 0xCC));
        assert!(!is_cave_intact(&mock, TEXT, 16, 0xCC));
    }
}
