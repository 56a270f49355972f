use std::path::Path;
use std::sync::OnceLock;

use anyhow::Result;
use log::{error, info};
use regex::Regex;
use tokio::fs;

/// Asynchronously ensures that a directory exists, creating it if it does not.
/// This function is idempotent.
pub async fn ensure_directory_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        if let Err(e) = fs::create_dir_all(path).await {
            error!("Failed to create directory at {:?}: {}", path, e);
            return Err(e.into());
        }
        info!("Created directory at: {:?}", path);
    }
    Ok(())
}

fn mac_regex() -> &'static Regex {
    static MAC: OnceLock<Regex> = OnceLock::new();
    MAC.get_or_init(|| {
        Regex::new(r"(?i)([0-9a-f]{2})[:_-]([0-9a-f]{2})[:_-]([0-9a-f]{2})[:_-]([0-9a-f]{2})[:_-]([0-9a-f]{2})[:_-]([0-9a-f]{2})")
            .unwrap_or_else(|e| panic!("invalid MAC pattern: {e}"))
    })
}

/// Pulls a MAC address out of free text such as a bus object path
/// (`/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`) and normalises it to
/// upper-case colon form.
pub fn extract_mac_address(text: &str) -> Option<String> {
    let caps = mac_regex().captures(text)?;
    let octets: Vec<String> = (1..=6).map(|i| caps[i].to_ascii_uppercase()).collect();
    Some(octets.join(":"))
}

/// True when `address` is exactly a colon separated MAC.
pub fn is_mac_address(address: &str) -> bool {
    address.len() == 17 && extract_mac_address(address).as_deref() == Some(&address.to_ascii_uppercase())
}
