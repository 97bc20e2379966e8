// cancapture/src/addr.rs
//
// Implements the SocketCAN address type.
//
// This file is part of the Rust 'cancapture' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! SocketCAN address type.

use crate::{Error, Result};
use libc::{sa_family_t, sockaddr_can, sockaddr_storage, socklen_t};
use nix::net::if_::if_nametoindex;
use socket2::SockAddr;
use std::{fmt, mem, mem::size_of, os::raw::c_int};

pub use libc::{AF_CAN, CAN_RAW};

/// CAN socket address.
///
/// This is the address of a SocketCAN host interface, found by looking up
/// the name of the interface, like "can0", "vcan0", etc.
///
/// This is based on, and compatible with, the `sockaddr_can` struct from
/// libc.
/// [ref](https://docs.rs/libc/latest/libc/struct.sockaddr_can.html)
#[derive(Clone, Copy)]
pub struct CanAddr(sockaddr_can);

impl CanAddr {
    /// Creates a new CAN socket address for the specified interface by index.
    pub fn new(ifindex: u32) -> Self {
        let mut addr = Self::default();
        addr.0.can_ifindex = ifindex as c_int;
        addr
    }

    /// Try to create an address from an interface name.
    ///
    /// Fails with [`Error::InterfaceNotFound`] if the kernel does not know
    /// the name.
    pub fn from_iface(ifname: &str) -> Result<Self> {
        let ifindex = if_nametoindex(ifname).map_err(|source| Error::InterfaceNotFound {
            iface: ifname.to_string(),
            source,
        })?;
        Ok(Self::new(ifindex))
    }

    /// Gets the kernel interface index of the address.
    pub fn ifindex(&self) -> u32 {
        self.0.can_ifindex as u32
    }

    /// Gets the size of the address structure.
    pub fn len() -> usize {
        size_of::<sockaddr_can>()
    }

    /// Gets the underlying address as a byte slice
    pub fn as_bytes(&self) -> &[u8] {
        crate::as_bytes(&self.0)
    }

    /// Converts the address into a `sockaddr_storage` type.
    /// The storage type is a generic socket address container with enough
    /// space to hold any address in the system (not just CAN addresses).
    pub fn into_storage(self) -> (sockaddr_storage, socklen_t) {
        let can_addr = self.as_bytes();
        let len = can_addr.len();

        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let sock_addr = crate::as_bytes_mut(&mut storage);

        sock_addr[..len].copy_from_slice(can_addr);
        (storage, len as socklen_t)
    }
}

impl Default for CanAddr {
    fn default() -> Self {
        let mut addr: sockaddr_can = unsafe { mem::zeroed() };
        addr.can_family = AF_CAN as sa_family_t;
        Self(addr)
    }
}

impl fmt::Debug for CanAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "CanAddr {{ can_family: {}, can_ifindex: {} }}",
            self.0.can_family, self.0.can_ifindex
        )
    }
}

impl From<CanAddr> for SockAddr {
    fn from(addr: CanAddr) -> Self {
        let (storage, len) = addr.into_storage();
        unsafe { SockAddr::new(storage, len) }
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::as_bytes;

    const IDX: u32 = 42;

    #[test]
    fn test_addr() {
        let addr = CanAddr::new(IDX);

        assert_eq!(size_of::<sockaddr_can>(), CanAddr::len());
        assert_eq!(IDX, addr.ifindex());
    }

    #[test]
    fn test_addr_to_storage() {
        let addr = CanAddr::new(IDX);

        let (sock_addr, len) = addr.into_storage();

        assert_eq!(CanAddr::len() as socklen_t, len);
        assert_eq!(addr.as_bytes(), &as_bytes(&sock_addr)[0..len as usize]);
    }

    #[test]
    fn test_unknown_iface() {
        match CanAddr::from_iface("nosuchcan42") {
            Err(Error::InterfaceNotFound { iface, .. }) => assert_eq!(iface, "nosuchcan42"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
