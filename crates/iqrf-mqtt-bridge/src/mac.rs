//! Gateway MAC address discovery

use std::path::Path;

use tracing::{debug, error};

/// MAC reported when no interface has one
pub const FALLBACK_MAC: &str = "000000000000";

/// Normalize `aa:bb:cc:dd:ee:ff` to `AABBCCDDEEFF`, rejecting all-zero addresses
fn normalize(raw: &str) -> Option<String> {
    let mac: String = raw
        .trim()
        .chars()
        .filter(|c| *c != ':')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if mac.len() != 12 || !mac.chars().all(|c| c.is_ascii_hexdigit()) || mac == FALLBACK_MAC {
        return None;
    }
    Some(mac)
}

/// First non-loopback interface MAC found under `root`
pub fn discover_in(root: &Path) -> Option<String> {
    let mut names: Vec<_> = std::fs::read_dir(root)
        .ok()?
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "lo")
        .collect();
    names.sort();

    names.into_iter().find_map(|name| {
        let raw = std::fs::read_to_string(root.join(&name).join("address")).ok()?;
        let mac = normalize(&raw)?;
        debug!(interface = %name, mac = %mac, "Found MAC address");
        Some(mac)
    })
}

/// Gateway MAC address, or [`FALLBACK_MAC`]
pub fn discover() -> String {
    discover_in(Path::new("/sys/class/net")).unwrap_or_else(|| {
        error!("Cannot find MAC address");
        FALLBACK_MAC.to_string()
    })
}
