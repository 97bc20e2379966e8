// cancapture/src/lib.rs
//
// The main lib file for the Rust CAN capture library.
//
// This file is part of the Rust 'cancapture' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! CAN bus capture, logging and replay over Linux SocketCAN.
//!
//! The Linux kernel supports using CAN-devices through a network-like API
//! (see <https://www.kernel.org/doc/Documentation/networking/can.txt>). This
//! crate builds a capture tool on top of that API:
//!
//! - A [`CanChannel`] binds a raw CAN socket to an interface, programs the
//!   kernel filters from textual specs, and runs a poll-driven receive loop
//!   on a dedicated thread. Every received or transmitted frame is published
//!   as a timestamped [`Packet`] together with live traffic counters.
//!
//! - A [`LogStore`] keeps captured packets as a sparse table of text cells
//!   and can load and save it in a compact binary log format.
//!
//! - A [`PeriodicSender`] re-injects frames on a fixed interval, for any
//!   number of independent jobs.
//!
//! # Example
//!
//! ```no_run
//! use cancapture::{CanChannel, ChannelEvent, LogStore};
//!
//! let channel = CanChannel::new();
//! channel.set_filters(&["123:7FF", "#000000FF"])?;
//!
//! let rx = channel.subscribe();
//! channel.start("vcan0")?;
//!
//! let mut log = LogStore::new();
//! for event in rx.iter().take(10) {
//!     if let ChannelEvent::PacketArrived(packet) = event {
//!         log.append(&packet);
//!     }
//! }
//! channel.stop();
//! log.save("capture.clf")?;
//! # Ok::<(), cancapture::Error>(())
//! ```

#![deny(
    missing_docs,
    missing_debug_implementations,
    unstable_features,
    unused_import_braces
)]

use std::{mem::size_of, slice};

pub mod errors;
pub use errors::{ConstructionError, Error, Result};

pub mod addr;
pub use addr::CanAddr;

pub mod events;
pub use events::Subscribers;

pub mod packet;
pub use packet::{Direction, Packet, Timestamp};

pub mod frame;
pub use frame::{CanFrame, IdFlags};

pub mod filter;
pub use filter::{CanFilter, FilterRule, FilterSet, FilterSpec, MAX_FILTER_RULES};

pub mod socket;
pub use socket::{CanSocket, ShouldRetry, SocketOptions};

pub mod status;
pub use status::{StatusCounter, ThreadStatus};

pub mod channel;
pub use channel::{CanChannel, ChannelEvent, ChannelState, Transmit, POLL_INTERVAL};

pub mod logfile;
pub use logfile::{Column, LogEvent, LogStore, Row, MAGIC};

pub mod periodic;
pub use periodic::{JobId, JobSpec, JobValidity, PeriodicSender};

pub mod bitrate;
pub use bitrate::{Bitrate, BITRATES};

pub mod enumerate;
pub use enumerate::{available_interfaces, CanInterfaceInfo};

#[cfg(feature = "config")]
pub mod config;
#[cfg(feature = "config")]
pub use config::CaptureConfig;

// ===== Helper functions =====

/// Gets a byte slice for any sized variable.
///
/// Note that this should normally be unsafe, but since we're only
/// using it internally for types sent to/from the OS, it's OK.
pub(crate) fn as_bytes<T: Sized>(val: &T) -> &[u8] {
    let sz = size_of::<T>();
    unsafe { slice::from_raw_parts::<'_, u8>(val as *const _ as *const u8, sz) }
}

/// Gets a mutable byte slice for any sized variable.
pub(crate) fn as_bytes_mut<T: Sized>(val: &mut T) -> &mut [u8] {
    let sz = size_of::<T>();
    unsafe { slice::from_raw_parts_mut(val as *mut _ as *mut u8, sz) }
}
