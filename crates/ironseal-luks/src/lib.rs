#![forbid(unsafe_code)]

//! System backend for ironseal devices.
//!
//! Integrates with the host via:
//! - `sfdisk`, `wipefs` and `mkfs.*` for layout
//! - `cryptsetup` for LUKS containers
//! - `nmcli`, `systemctl` and `systemd-detect-virt` for host control

mod command;
mod host;
mod system;
mod tail;

pub use command::SystemRunner;
pub use host::SystemHost;
pub use system::SystemDeviceBackend;
