// cancapture/src/frame.rs
//
// Implements the classic CAN 2.0 wire frame for SocketCAN on Linux.
//
// This file is part of the Rust 'cancapture' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! CAN bus wire frames.
//!
//! At the lowest level, [libc](https://crates.io/crates/libc) defines the
//! classic CAN frame as a struct that is binary compatible with the C type
//! sent to and from the kernel:
//! [can_frame](https://docs.rs/libc/latest/libc/struct.can_frame.html).
//!
//! The identifier and the EFF/RTR/ERR flags share a single 32-bit word in
//! that struct. [`CanFrame`] wraps it and converts to and from the
//! [`Packet`] value that the rest of the library works with.

use crate::{ConstructionError, Direction, Packet, Timestamp};
use bitflags::bitflags;
use embedded_can::{ExtendedId, Frame as EmbeddedFrame, Id, StandardId};
use itertools::Itertools;
use libc::{can_frame, canid_t};
use std::{fmt, mem};

pub use libc::{
    CAN_EFF_FLAG, CAN_EFF_MASK, CAN_ERR_FLAG, CAN_ERR_MASK, CAN_MAX_DLEN, CAN_MTU, CAN_RTR_FLAG,
    CAN_SFF_MASK,
};

/// An error mask that will cause SocketCAN to report all errors
pub const ERR_MASK_ALL: u32 = CAN_ERR_MASK;

/// An error mask that will cause SocketCAN to silently drop all errors
pub const ERR_MASK_NONE: u32 = 0;

bitflags! {
    /// Bit flags in the composite SocketCAN ID word.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IdFlags: canid_t {
        /// Indicates frame uses a 29-bit extended ID
        const EFF = CAN_EFF_FLAG;
        /// Indicates a remote request frame.
        const RTR = CAN_RTR_FLAG;
        /// Indicates an error frame.
        const ERR = CAN_ERR_FLAG;
    }
}

/// Gets the canid_t value from an Id
/// If it's an extended ID, the CAN_EFF_FLAG bit is also set.
pub fn id_to_canid_t(id: impl Into<Id>) -> canid_t {
    match id.into() {
        Id::Standard(id) => id.as_raw() as canid_t,
        Id::Extended(id) => id.as_raw() | CAN_EFF_FLAG,
    }
}

/// Creates a default C `can_frame`.
/// This initializes the entire structure to zeros.
#[inline(always)]
pub fn can_frame_default() -> can_frame {
    unsafe { mem::zeroed() }
}

// ===== CanFrame =====

/// A classic CAN 2.0 frame as exchanged with the kernel.
///
/// This is highly compatible with the `can_frame` from libc.
/// ([ref](https://docs.rs/libc/latest/libc/struct.can_frame.html))
#[derive(Clone, Copy)]
pub struct CanFrame(can_frame);

impl CanFrame {
    /// Initializes a frame from the raw ID word (identifier plus flags)
    /// and a data slice.
    pub fn init(can_id: canid_t, data: &[u8]) -> Result<Self, ConstructionError> {
        match data.len() {
            n if n <= CAN_MAX_DLEN => {
                let mut frame = can_frame_default();
                frame.can_id = can_id;
                frame.can_dlc = n as u8;
                frame.data[..n].copy_from_slice(data);
                Ok(Self(frame))
            }
            _ => Err(ConstructionError::TooMuchData),
        }
    }

    /// Builds the wire frame for a packet.
    ///
    /// The identifier, extended-frame and remote-request flags are folded
    /// into the ID word. For a remote frame only the DLC is carried.
    pub fn from_packet(packet: &Packet) -> Result<Self, ConstructionError> {
        packet.validate()?;

        let mask = if packet.extended {
            CAN_EFF_MASK
        } else {
            CAN_SFF_MASK
        };
        let mut can_id = packet.identifier & mask;
        if packet.extended {
            can_id |= CAN_EFF_FLAG;
        }

        if packet.rtr {
            let mut frame = Self::init(can_id | CAN_RTR_FLAG, &[])?;
            frame.0.can_dlc = packet.dlc;
            Ok(frame)
        } else {
            Self::init(can_id, packet.data())
        }
    }

    /// Decodes the frame into a packet with the given direction and time.
    pub fn to_packet(&self, direction: Direction, timestamp: Timestamp) -> Packet {
        let flags = self.id_flags();
        let dlc = self.0.can_dlc.min(CAN_MAX_DLEN as u8);

        let mut packet = Packet {
            direction,
            identifier: self.raw_id(),
            rtr: flags.contains(IdFlags::RTR),
            extended: flags.contains(IdFlags::EFF),
            error: flags.contains(IdFlags::ERR),
            dlc,
            timestamp,
            ..Packet::default()
        };
        packet.data = self.0.data;
        packet
    }

    /// Get the composite SocketCAN ID word, with EFF/RTR/ERR flags
    pub fn id_word(&self) -> canid_t {
        self.0.can_id
    }

    /// Returns the EFF/RTR/ERR flags from the ID word
    pub fn id_flags(&self) -> IdFlags {
        IdFlags::from_bits_truncate(self.id_word())
    }

    /// Return the actual raw CAN ID (without EFF/RTR/ERR flags)
    ///
    /// For an error frame this is the error class bit field.
    pub fn raw_id(&self) -> canid_t {
        let flags = self.id_flags();
        let mask = if flags.contains(IdFlags::ERR) {
            CAN_ERR_MASK
        } else if flags.contains(IdFlags::EFF) {
            CAN_EFF_MASK
        } else {
            CAN_SFF_MASK
        };
        self.id_word() & mask
    }

    /// Check if frame is an error message
    pub fn is_error_frame(&self) -> bool {
        self.id_flags().contains(IdFlags::ERR)
    }

    /// Gets the frame as the byte image written to the socket.
    pub fn as_bytes(&self) -> &[u8] {
        crate::as_bytes(&self.0)
    }

    /// Gets the frame as a mutable byte image to read into.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        crate::as_bytes_mut(&mut self.0)
    }
}

impl EmbeddedFrame for CanFrame {
    /// Create a new CAN 2.0 data frame
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        Self::init(id_to_canid_t(id), data).ok()
    }

    /// Create a new remote transmission request frame.
    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc <= CAN_MAX_DLEN {
            let mut frame = Self::init(id_to_canid_t(id) | CAN_RTR_FLAG, &[]).ok()?;
            frame.0.can_dlc = dlc as u8;
            Some(frame)
        } else {
            None
        }
    }

    /// Check if frame uses 29-bit extended ID format.
    fn is_extended(&self) -> bool {
        self.id_flags().contains(IdFlags::EFF)
    }

    /// Check if frame is a remote transmission request.
    fn is_remote_frame(&self) -> bool {
        self.id_flags().contains(IdFlags::RTR)
    }

    /// Return the frame identifier.
    fn id(&self) -> Id {
        if self.is_extended() {
            ExtendedId::new(self.id_word() & CAN_EFF_MASK)
                .map(Id::from)
                .unwrap_or(Id::Extended(ExtendedId::ZERO))
        } else {
            StandardId::new((self.id_word() & CAN_SFF_MASK) as u16)
                .map(Id::from)
                .unwrap_or(Id::Standard(StandardId::ZERO))
        }
    }

    /// Data length code
    fn dlc(&self) -> usize {
        usize::from(self.0.can_dlc)
    }

    /// A slice into the actual data. Empty for remote frames.
    fn data(&self) -> &[u8] {
        if self.is_remote_frame() {
            &[]
        } else {
            &self.0.data[..self.dlc().min(CAN_MAX_DLEN)]
        }
    }
}

impl Default for CanFrame {
    fn default() -> Self {
        Self(can_frame_default())
    }
}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CanFrame {{ ")?;
        fmt::UpperHex::fmt(self, f)?;
        write!(f, " }}")
    }
}

impl fmt::UpperHex for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(f, "{:X}#", self.0.can_id)?;
        let mut parts = self.data().iter().map(|v| format!("{:02X}", v));
        write!(f, "{}", parts.join(" "))
    }
}

impl From<can_frame> for CanFrame {
    fn from(frame: can_frame) -> Self {
        Self(frame)
    }
}

impl AsRef<can_frame> for CanFrame {
    fn as_ref(&self) -> &can_frame {
        &self.0
    }
}

/////////////////////////////////////////////////////////////////////////////
