//! Fixed-size values that can be decoded from (and encoded to) remote memory.

/// Largest value the typed wrappers, scatter entries and mirror slots handle.
pub const MAX_VALUE_SIZE: usize = 8;

/// A plain little-endian value with a fixed remote size.
///
/// Implemented for the primitive integer and float types plus `bool`.
/// Every implementation is at most [`MAX_VALUE_SIZE`] bytes wide and is
/// naturally aligned remotely, so `SIZE` doubles as its alignment.
pub trait RemoteValue: Copy + Send + Sync + 'static {
    /// Size of the value in remote memory
    const SIZE: usize;

    /// Decode from the first `SIZE` bytes of `bytes`.
    ///
    /// Callers guarantee `bytes.len() >= SIZE`.
    fn from_le(bytes: &[u8]) -> Self;

    /// Encode into an 8-byte slot; only the first `SIZE` bytes are meaningful.
    fn to_le(self) -> [u8; MAX_VALUE_SIZE];
}

macro_rules! impl_remote_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl RemoteValue for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                fn from_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(raw)
                }

                fn to_le(self) -> [u8; MAX_VALUE_SIZE] {
                    let mut out = [0u8; MAX_VALUE_SIZE];
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                    out
                }
            }
        )*
    };
}

impl_remote_value!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

impl RemoteValue for bool {
    const SIZE: usize = 1;

    fn from_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    fn to_le(self) -> [u8; MAX_VALUE_SIZE] {
        let mut out = [0u8; MAX_VALUE_SIZE];
        out[0] = self as u8;
        out
    }
}

/// Encode a value into exactly `T::SIZE` bytes.
pub(crate) fn encode<T: RemoteValue>(value: T) -> Vec<u8> {
    value.to_le()[..T::SIZE].to_vec()
}
