//! Shared mailbox between the controller and the injected trampoline.
//!
//! Layout (little-endian, 0x40 bytes):
//!
//! | offset | field       | written by  |
//! |--------|-------------|-------------|
//! | 0x00   | function    | controller arms, trampoline zeroes when it claims the call |
//! | 0x08   | args[0..4]  | controller  |
//! | 0x28   | result      | trampoline  |
//! | 0x30   | ticket      | controller  |
//! | 0x38   | completed   | trampoline copies the claimed ticket here |

pub const FUNCTION: u64 = 0x00;
pub const ARGS: u64 = 0x08;
pub const RESULT: u64 = 0x28;
pub const TICKET: u64 = 0x30;
pub const COMPLETED: u64 = 0x38;

/// Total mailbox size in bytes
pub const MAILBOX_SIZE: usize = 0x40;

/// Decoded mailbox contents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallData {
    pub function: u64,
    pub args: [u64; 4],
    pub result: u64,
    pub ticket: u64,
    pub completed: u64,
}

impl CallData {
    pub fn new(function: u64, args: [u64; 4], ticket: u64) -> Self {
        Self {
            function,
            args,
            ticket,
            ..Default::default()
        }
    }

    pub fn to_bytes(&self) -> [u8; MAILBOX_SIZE] {
        let mut out = [0u8; MAILBOX_SIZE];
        let words = [
            self.function,
            self.args[0],
            self.args[1],
            self.args[2],
            self.args[3],
            self.result,
            self.ticket,
            self.completed,
        ];
        for (chunk, word) in out.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < MAILBOX_SIZE {
            return None;
        }
        let word = |offset: u64| {
            let start = offset as usize;
            u64::from_le_bytes(bytes[start..start + 8].try_into().unwrap_or_default())
        };
        Some(Self {
            function: word(FUNCTION),
            args: [word(ARGS), word(ARGS + 8), word(ARGS + 16), word(ARGS + 24)],
            result: word(RESULT),
            ticket: word(TICKET),
            completed: word(COMPLETED),
        })
    }

    /// Bytes from `ARGS` up to (not including) `COMPLETED`: everything the
    /// controller writes before arming the function slot.
    pub fn payload(&self) -> Vec<u8> {
        self.to_bytes()[ARGS as usize..COMPLETED as usize].to_vec()
    }
}
