pub mod layout;
mod cache;
#[cfg(target_os = "windows")]
mod process;
mod string;
mod transport;
pub(crate) mod value;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use cache::ReadCache;
#[cfg(target_os = "windows")]
pub use process::{ProcessInfo, ProcessTransport};
pub use string::{MAX_STRING_CHARS, read_utf16_string};
pub use transport::{ScatterRead, ScatterWrite, Transport, TransportExt};
pub use value::RemoteValue;

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockTransport, MockTransportBuilder};
