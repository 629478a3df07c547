//! Native call bridge.
//!
//! Hooks a function the target runs every frame, sends it through a
//! trampoline in a code cave, and lets the controller post one call at a time
//! into a shared mailbox. The trampoline claims the call, runs it with up to
//! four register arguments, stores the result and acknowledges with the
//! call's ticket. From the caller's side [`NativeCallBridge::call`] is
//! synchronous with a hard timeout.

pub mod cave;
pub mod mailbox;
pub mod trampoline;

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::MemoryContext;
use crate::error::{Error, Result};
use crate::memory::layout::timing;
use crate::memory::{Transport, TransportExt};

use cave::{find_code_cave, is_cave_intact};
use mailbox::{CallData, MAILBOX_SIZE};
use trampoline::{ABS_JUMP_LEN, TrampolineBuilder, hook_patch, is_absolute_jump};

/// Where and how to install the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Absolute address of the hooked function entry
    pub hook_address: u64,
    /// Whole instructions at the hook site to relocate (>= 14)
    pub stolen_len: usize,
    /// Writable memory for the mailbox (`MAILBOX_SIZE` bytes)
    pub mailbox_address: u64,
    /// Executable range to search for a cave
    pub cave_search_start: u64,
    pub cave_search_len: usize,
    /// Byte that marks unused code (int3 padding by default)
    pub cave_filler: u8,
    pub call_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            hook_address: 0,
            stolen_len: ABS_JUMP_LEN,
            mailbox_address: 0,
            cave_search_start: 0,
            cave_search_len: 0,
            cave_filler: 0xCC,
            call_timeout_ms: timing::CALL_TIMEOUT_MS,
            poll_interval_ms: timing::CALL_POLL_INTERVAL_MS,
        }
    }
}

impl BridgeConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    fn validate(&self) -> Result<()> {
        if self.hook_address == 0 {
            return Err(Error::HookInstallFailed("hook address is null".to_string()));
        }
        if self.mailbox_address == 0 {
            return Err(Error::HookInstallFailed(
                "mailbox address is null".to_string(),
            ));
        }
        if self.stolen_len < ABS_JUMP_LEN {
            return Err(Error::HookInstallFailed(format!(
                "stolen length {} is shorter than the {}-byte jump",
                self.stolen_len, ABS_JUMP_LEN
            )));
        }
        if self.cave_search_start == 0 || self.cave_search_len == 0 {
            return Err(Error::HookInstallFailed(
                "cave search range is empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Installation {
    cave: u64,
    image_len: usize,
    original: Vec<u8>,
}

struct BridgeState {
    installation: Option<Installation>,
    next_ticket: u64,
    reported_failure: bool,
}

pub struct NativeCallBridge {
    transport: Arc<dyn Transport>,
    config: BridgeConfig,
    state: Mutex<BridgeState>,
}

impl NativeCallBridge {
    pub fn new(ctx: &MemoryContext, config: BridgeConfig) -> Self {
        Self::with_transport(ctx.transport_handle(), config)
    }

    pub fn with_transport(transport: Arc<dyn Transport>, config: BridgeConfig) -> Self {
        Self {
            transport,
            config,
            state: Mutex::new(BridgeState {
                installation: None,
                next_ticket: 1,
                reported_failure: false,
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().installation.is_some()
    }

    /// Address of the installed trampoline, if any.
    pub fn cave_address(&self) -> Option<u64> {
        self.lock().installation.as_ref().map(|i| i.cave)
    }

    /// Install the hook. Does nothing if already installed.
    ///
    /// Every check runs before the first byte is written: a failure leaves
    /// the target untouched and the bridge uninitialized.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.lock();
        if state.installation.is_some() {
            return Ok(());
        }

        match self.install() {
            Ok(installation) => {
                info!(
                    "Call bridge installed: hook={:#x} cave={:#x} ({} bytes)",
                    self.config.hook_address, installation.cave, installation.image_len
                );
                state.installation = Some(installation);
                Ok(())
            }
            Err(e) => {
                if !state.reported_failure {
                    warn!("Call bridge installation failed: {}", e);
                    state.reported_failure = true;
                } else {
                    debug!("Call bridge installation failed again: {}", e);
                }
                Err(e)
            }
        }
    }

    fn install(&self) -> Result<Installation> {
        let config = &self.config;
        config.validate()?;
        let transport = self.transport.as_ref();

        let original = transport.read_bytes(config.hook_address, config.stolen_len)?;
        if is_absolute_jump(&original) {
            return Err(Error::HookInstallFailed(format!(
                "hook site {:#x} is already patched",
                config.hook_address
            )));
        }

        let image = TrampolineBuilder::new(
            config.mailbox_address,
            config.hook_address,
            original.clone(),
        )
        .build();

        let cave = find_code_cave(
            transport,
            config.cave_search_start,
            config.cave_search_len,
            config.cave_filler,
            image.len(),
        )?;
        if !is_cave_intact(transport, cave, image.len(), config.cave_filler) {
            return Err(Error::HookInstallFailed(format!(
                "cave at {:#x} changed during installation",
                cave
            )));
        }

        transport.write_buffer(config.mailbox_address, &[0u8; MAILBOX_SIZE])?;
        transport.write_buffer(cave, &image)?;
        if transport.read_bytes(cave, image.len())? != image {
            return Err(Error::HookInstallFailed(format!(
                "trampoline at {:#x} did not verify",
                cave
            )));
        }
        // Hook last: until this write lands the trampoline is unreachable.
        transport.write_buffer(config.hook_address, &hook_patch(cave, config.stolen_len)?)?;

        Ok(Installation {
            cave,
            image_len: image.len(),
            original,
        })
    }

    /// Restore the hooked bytes and wipe the trampoline.
    pub fn uninstall(&self) -> Result<()> {
        let mut state = self.lock();
        let Some(installation) = state.installation.take() else {
            return Ok(());
        };

        let transport = self.transport.as_ref();
        if let Err(e) = transport.write_buffer(self.config.hook_address, &installation.original) {
            state.installation = Some(installation);
            return Err(e);
        }
        // Let a frame that entered the trampoline before the restore leave it.
        thread::sleep(self.config.poll_interval() * 10);
        let filler = vec![self.config.cave_filler; installation.image_len];
        transport.write_buffer(installation.cave, &filler)?;

        info!("Call bridge removed from {:#x}", self.config.hook_address);
        Ok(())
    }

    /// Run `function(args...)` inside the target on its next hooked frame.
    ///
    /// Blocks until the trampoline acknowledges the call or the timeout
    /// elapses. `Ok(None)` means no answer arrived in time; the slot is
    /// disarmed so the call will not run later unless the target already
    /// claimed it.
    pub fn call(&self, function: u64, args: &[u64]) -> Result<Option<u64>> {
        if function == 0 {
            return Err(Error::InvalidAddress(function));
        }
        if args.len() > 4 {
            return Err(Error::TooManyArguments(args.len()));
        }

        let mut state = self.lock();
        if state.installation.is_none() {
            return Err(Error::BridgeNotInitialized);
        }
        let ticket = state.next_ticket;
        state.next_ticket = state.next_ticket.wrapping_add(1).max(1);

        let mut registers = [0u64; 4];
        registers[..args.len()].copy_from_slice(args);
        let request = CallData::new(function, registers, ticket);

        let transport = self.transport.as_ref();
        let slot = self.config.mailbox_address;
        transport.write_buffer(slot + mailbox::ARGS, &request.payload())?;
        // Arm last so the trampoline never sees a half-written request.
        transport.write_value(slot + mailbox::FUNCTION, function)?;

        let started = Instant::now();
        let timeout = self.config.call_timeout();
        let poll = self.config.poll_interval();
        loop {
            let tail = match transport.read_bytes(slot + mailbox::RESULT, 0x18) {
                Ok(tail) => tail,
                Err(e) => {
                    self.disarm(slot);
                    return Err(e);
                }
            };
            let word = |i: usize| {
                u64::from_le_bytes(tail[i * 8..i * 8 + 8].try_into().unwrap_or_default())
            };
            let (result, completed) = (word(0), word(2));
            if completed == ticket {
                debug!(
                    "Native call {:#x} returned {:#x} after {:?}",
                    function,
                    result,
                    started.elapsed()
                );
                return Ok(Some(result));
            }

            if started.elapsed() >= timeout {
                break;
            }
            thread::sleep(poll.min(timeout.saturating_sub(started.elapsed())));
        }

        self.disarm(slot);
        warn!(
            "Native call {:#x} (ticket {}) timed out after {:?}",
            function, ticket, timeout
        );
        Ok(None)
    }

    fn disarm(&self, slot: u64) {
        if let Err(e) = self
            .transport
            .as_ref()
            .write_value(slot + mailbox::FUNCTION, 0u64)
        {
            debug!("Failed to disarm call mailbox: {}", e);
        }
    }
}
