//! Remote dictionary / hash set snapshot.

use anyhow::Result;
use owo_colors::OwoColorize;
use scry_core::{MemDictionary, MemHashSet, MemoryContext, ScryConfig};

use super::Target;

pub fn run(target: &Target<'_>, config: &ScryConfig, address: u64, set: bool) -> Result<()> {
    let ctx = MemoryContext::with_layout(target.attach()?, config.mirror);

    if set {
        let snapshot = MemHashSet::<u64>::acquire(&ctx, address, false)?;
        println!(
            "HashSet at {:#x}: {} live of {} slots",
            address,
            snapshot.len().bold(),
            snapshot.capacity()
        );
        for value in snapshot.iter() {
            println!("  {:#018x}", value);
        }
    } else {
        let snapshot = MemDictionary::<u64, u64>::acquire(&ctx, address, false)?;
        println!(
            "Dictionary at {:#x}: {} live of {} entries",
            address,
            snapshot.len().bold(),
            snapshot.capacity()
        );
        for (key, value) in snapshot.iter() {
            println!("  {} => {:#018x}", format!("{:#018x}", key).cyan(), value);
        }
    }
    Ok(())
}
