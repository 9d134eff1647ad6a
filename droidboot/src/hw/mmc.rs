//! `mmcblk` number discovery for an MMC host controller.

use std::fs;
use std::path::Path;

use log::error;

fn child_containing(dir: &Path, needle: &str) -> Option<String> {
    fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .find(|name| name.contains(needle))
}

/// Returns `N` of the `mmcblkN` device hanging off the host at `host`
/// (for example `.../mmc_host/mmc0`).
#[must_use]
pub fn block_number(host: &Path) -> Option<u8> {
    let card = child_containing(host, "mmc")?;
    let block = child_containing(&host.join(card).join("block"), "mmcblk");
    let number = block.and_then(|name| {
        let digit = name.split("mmcblk").nth(1)?.chars().next()?;
        u8::try_from(digit.to_digit(10)?).ok()
    });
    if number.is_none() {
        error!("no mmcblk device under {}", host.display());
    }
    number
}
