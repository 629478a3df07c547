//! One-shot native call through the bridge.

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use scry_core::{NativeCallBridge, ScryConfig};

use super::Target;

pub fn run(
    target: &Target<'_>,
    config: &ScryConfig,
    function: u64,
    args: &[u64],
    uninstall: bool,
) -> Result<()> {
    let bridge = NativeCallBridge::with_transport(target.attach()?, config.bridge.clone());
    bridge
        .initialize()
        .context("Call bridge could not be installed (check the bridge section of the config)")?;

    let outcome = bridge.call(function, args);

    if uninstall {
        bridge.uninstall()?;
    }

    match outcome? {
        Some(result) => println!(
            "{:#x}({}) = {}",
            function,
            args.iter()
                .map(|a| format!("{:#x}", a))
                .collect::<Vec<_>>()
                .join(", "),
            format!("{:#x}", result).green()
        ),
        None => println!(
            "{}",
            format!(
                "No answer within {:?}; the hooked function may not be running",
                bridge.config().call_timeout()
            )
            .yellow()
        ),
    }
    Ok(())
}
