//! CLI command implementations.

pub mod call;
pub mod dict;
pub mod hex_utils;
pub mod hexdump;
pub mod string;
pub mod watch;

use std::sync::Arc;

use anyhow::Result;
use scry_core::Transport;

/// Which process to attach to
pub struct Target<'a> {
    pub pid: Option<u32>,
    pub process: Option<&'a str>,
}

impl Target<'_> {
    #[cfg(target_os = "windows")]
    pub fn attach(&self) -> Result<Arc<dyn Transport>> {
        use scry_core::ProcessTransport;
        use tracing::info;

        let transport = match (self.pid, self.process) {
            (Some(pid), _) => ProcessTransport::open(pid)?,
            (None, Some(name)) => ProcessTransport::find_and_open(name)?,
            (None, None) => anyhow::bail!("Specify the target with --pid or --process"),
        };
        info!(
            "Attached to {} (pid {}, base {:#x})",
            transport.info.name, transport.info.pid, transport.info.base_address
        );
        Ok(Arc::new(transport))
    }

    #[cfg(not(target_os = "windows"))]
    pub fn attach(&self) -> Result<Arc<dyn Transport>> {
        anyhow::bail!("Process attachment is only supported on Windows")
    }
}
