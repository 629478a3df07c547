use anyhow::Result;
use scry_core::read_utf16_string;

use super::Target;

pub fn run(target: &Target<'_>, address: u64) -> Result<()> {
    let transport = target.attach()?;
    let text = read_utf16_string(transport.as_ref(), address)?;
    println!("{:?} ({} chars)", text, text.chars().count());
    Ok(())
}
