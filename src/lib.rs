// SPDX-License-Identifier: MIT

pub(crate) mod bytes;

pub mod config;
pub mod control;
pub mod daemon;
pub mod dhcp;
pub mod eapol;
mod error;
pub mod ies;
pub mod iface;
pub mod nl80211;
pub mod rfkill;
pub mod scan;
pub mod sta;

pub use self::daemon::Daemon;
pub use self::error::WsuppError;

/// Control socket the `wifi` client connects to.
pub const CONTROL_PATH: &str = "/run/ctrl/wsupp";
/// On-disk PSK database, one `<hex-psk> <escaped-ssid>` line per network.
pub const CONFIG_PATH: &str = "/var/wipsk";
/// Raw SSID bytes of the last pinned AP, restored once on startup.
pub const PINNED_AP_PATH: &str = "/var/wiap";
/// Kernel rfkill event device.
pub const RFKILL_PATH: &str = "/dev/rfkill";
