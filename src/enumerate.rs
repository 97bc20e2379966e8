// cancapture/src/enumerate.rs
//
// Implements support for enumerating available SocketCAN network interfaces.
//
// This file is part of the Rust 'cancapture' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! SocketCAN interface enumeration.
//!
//! With the `enumerate` feature the CAN interfaces are found through udev.
//! Otherwise every network interface is checked by binding a raw CAN socket
//! to it, which only succeeds for CAN devices.

use crate::Result;
use itertools::Itertools;
use nix::{ifaddrs::getifaddrs, net::if_::InterfaceFlags};
use std::{collections::HashSet, io};

/// A CAN network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanInterfaceInfo {
    /// The interface name, like "can0"
    pub name: String,
    /// Whether the interface is administratively up
    pub up: bool,
}

/// Scans the system for available SocketCAN network interfaces and returns a
/// list of them, sorted by name.
pub fn available_interfaces() -> Result<Vec<CanInterfaceInfo>> {
    let up = up_interfaces()?;
    let interfaces = can_interface_names()?
        .into_iter()
        .sorted()
        .dedup()
        .map(|name| {
            let up = up.contains(&name);
            CanInterfaceInfo { name, up }
        })
        .collect();
    Ok(interfaces)
}

// Names of the interfaces with the IFF_UP flag set.
fn up_interfaces() -> Result<HashSet<String>> {
    let addrs = getifaddrs().map_err(io::Error::from)?;
    Ok(addrs
        .filter(|ifa| ifa.flags.contains(InterfaceFlags::IFF_UP))
        .map(|ifa| ifa.interface_name)
        .collect())
}

#[cfg(feature = "enumerate")]
fn can_interface_names() -> Result<Vec<String>> {
    use libc::ARPHRD_CAN;
    use libudev::{Context, Enumerator};

    fn udev_err(err: libudev::Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, err.to_string())
    }

    let mut interfaces = Vec::new();
    if let Ok(context) = Context::new() {
        let mut enumerator = Enumerator::new(&context).map_err(udev_err)?;
        enumerator.match_subsystem("net").map_err(udev_err)?;
        enumerator
            .match_attribute("type", ARPHRD_CAN.to_string())
            .map_err(udev_err)?;
        let devices = enumerator.scan_devices().map_err(udev_err)?;
        for d in devices {
            if let Some(interface) = d.property_value("INTERFACE") {
                if let Some(interface) = interface.to_str() {
                    interfaces.push(String::from(interface));
                }
            }
        }
    }
    Ok(interfaces)
}

#[cfg(not(feature = "enumerate"))]
fn can_interface_names() -> Result<Vec<String>> {
    use crate::CanSocket;
    use log::trace;

    let addrs = getifaddrs().map_err(io::Error::from)?;
    let interfaces = addrs
        .map(|ifa| ifa.interface_name)
        .unique()
        .filter(|name| match CanSocket::open(name) {
            Ok(_) => true,
            Err(err) => {
                trace!("Skipping {}: {}", name, err);
                false
            }
        })
        .collect();
    Ok(interfaces)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_is_not_can() {
        let ifaces = available_interfaces().unwrap();
        assert!(ifaces.iter().all(|i| i.name != "lo"));

        let names: Vec<_> = ifaces.iter().map(|i| i.name.clone()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(names, sorted);
    }
}
