//! Memory layout constants for managed runtime structures
//!
//! Offsets for the generic collection types mirrored by `crate::mirror`, and
//! for the managed string object. These match a 64-bit Mono/IL2CPP runtime.

/// Managed array object
pub mod array {
    /// Offset of the first element past the object header, bounds and length
    pub const DATA: u64 = 0x20;
}

/// `Dictionary<TKey, TValue>`
pub mod dictionary {
    /// Pointer to the `entries` array
    pub const ENTRIES: u64 = 0x18;
    /// Number of used entries (i32)
    pub const COUNT: u64 = 0x40;
}

/// `HashSet<T>`
pub mod hash_set {
    /// Pointer to the `slots` array
    pub const SLOTS: u64 = 0x18;
    /// Number of used slots (i32)
    pub const COUNT: u64 = 0x3C;
}

/// `System.String`
pub mod string {
    /// Character count (i32)
    pub const LENGTH: u64 = 0x10;
    /// First UTF-16 code unit
    pub const CHARS: u64 = 0x14;
}

/// Timing constants for polling and back-off
pub mod timing {
    /// Interval between scheduler ticks when writes are being applied (ms)
    pub const TICK_INTERVAL_MS: u64 = 10;

    /// Back-off after a failed gate check (ms)
    pub const GATE_BACKOFF_MS: u64 = 250;

    /// Back-off after an unexpected error in a worker loop (ms)
    pub const ERROR_BACKOFF_MS: u64 = 1000;

    /// Apply steps slower than this are reported (ms)
    pub const SLOW_FEATURE_MS: u64 = 5;

    /// How long shutdown waits for the worker thread (ms)
    pub const JOIN_TIMEOUT_MS: u64 = 2000;

    /// Native call timeout (ms)
    pub const CALL_TIMEOUT_MS: u64 = 2000;

    /// Mailbox polling interval (ms)
    pub const CALL_POLL_INTERVAL_MS: u64 = 1;
}
