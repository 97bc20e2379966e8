// cancapture/src/packet.rs
//
// Implements the captured CAN packet.
//
// This file is part of the Rust 'cancapture' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Captured CAN packets.
//!
//! A [`Packet`] is a single classic CAN frame together with the direction
//! it travelled and the time it was received or sent. Packets are plain
//! values: once published they are copied to every consumer.

use crate::ConstructionError;
use chrono::{DateTime, Local, TimeZone};
use itertools::Itertools;
use libc::{timeval, CAN_EFF_MASK, CAN_MAX_DLEN, CAN_SFF_MASK};
use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Whether a packet was received from or sent to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    /// The packet came in from the bus
    #[default]
    Received,
    /// The packet was written to the bus by us
    Sent,
}

impl Direction {
    /// The single-character marker used in the log table.
    pub fn marker(&self) -> &'static str {
        match self {
            Direction::Received => "<",
            Direction::Sent => ">",
        }
    }

    /// Parses a log table direction marker.
    pub fn from_marker(s: &str) -> Option<Self> {
        match s {
            "<" => Some(Direction::Received),
            ">" => Some(Direction::Sent),
            _ => None,
        }
    }
}

/// A wall-clock timestamp with microsecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    /// Seconds since the Unix epoch
    pub secs: i64,
    /// Sub-second part, in microseconds (0..1_000_000)
    pub micros: u32,
}

impl Timestamp {
    /// Creates a timestamp from seconds and microseconds.
    pub fn new(secs: i64, micros: u32) -> Self {
        Self {
            secs: secs + i64::from(micros / 1_000_000),
            micros: micros % 1_000_000,
        }
    }

    /// The current wall-clock time.
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    /// Total microseconds since the epoch.
    pub fn as_micros(&self) -> i64 {
        self.secs * 1_000_000 + i64::from(self.micros)
    }

    /// The (non-negative) time elapsed from `earlier` to this timestamp.
    pub fn saturating_since(&self, earlier: &Timestamp) -> Duration {
        let us = self.as_micros() - earlier.as_micros();
        Duration::from_micros(us.max(0) as u64)
    }

    /// Converts the timestamp to a local date/time.
    pub fn to_local(&self) -> Option<DateTime<Local>> {
        Local
            .timestamp_opt(self.secs, self.micros * 1_000)
            .single()
    }
}

impl From<timeval> for Timestamp {
    fn from(tv: timeval) -> Self {
        Self::new(tv.tv_sec as i64, tv.tv_usec as u32)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Self::new(d.as_secs() as i64, d.subsec_micros()),
            Err(_) => Self::default(),
        }
    }
}

impl<Tz: TimeZone> From<DateTime<Tz>> for Timestamp {
    fn from(t: DateTime<Tz>) -> Self {
        Self::new(t.timestamp(), t.timestamp_subsec_micros())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs, self.micros)
    }
}

/// A CAN frame plus its direction and timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Packet {
    /// Whether the packet was received or sent
    pub direction: Direction,
    /// The CAN identifier, without any flags
    pub identifier: u32,
    /// Remote transmission request
    pub rtr: bool,
    /// 29-bit extended identifier
    pub extended: bool,
    /// The packet is an error frame; `identifier` holds the error class bits
    pub error: bool,
    /// Data length code, 0-8
    pub dlc: u8,
    /// Data storage; only the first `dlc` bytes are meaningful
    pub data: [u8; CAN_MAX_DLEN],
    /// When the packet was received or sent
    pub timestamp: Timestamp,
}

impl Packet {
    /// Creates a data packet, checking the identifier width and data length.
    ///
    /// The packet is marked as received with a zero timestamp; the channel
    /// stamps both when the packet is actually sent.
    pub fn new(identifier: u32, extended: bool, data: &[u8]) -> Result<Self, ConstructionError> {
        let max_id = if extended { CAN_EFF_MASK } else { CAN_SFF_MASK };
        if identifier > max_id {
            return Err(ConstructionError::IdTooLarge);
        }
        let n = data.len();
        if n > CAN_MAX_DLEN {
            return Err(ConstructionError::TooMuchData);
        }
        let mut packet = Self {
            identifier,
            extended,
            dlc: n as u8,
            ..Self::default()
        };
        packet.data[..n].copy_from_slice(data);
        Ok(packet)
    }

    /// Creates a remote transmission request packet.
    pub fn new_remote(identifier: u32, extended: bool, dlc: u8) -> Result<Self, ConstructionError> {
        if usize::from(dlc) > CAN_MAX_DLEN {
            return Err(ConstructionError::TooMuchData);
        }
        let mut packet = Self::new(identifier, extended, &[])?;
        packet.rtr = true;
        packet.dlc = dlc;
        Ok(packet)
    }

    /// The meaningful part of the data.
    ///
    /// An out-of-range `dlc` is clamped to the storage size.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len()]
    }

    /// The number of meaningful data bytes.
    pub fn len(&self) -> usize {
        usize::from(self.dlc).min(CAN_MAX_DLEN)
    }

    /// Determines if the packet carries no data.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The data as space-separated, two-digit lower-case hex bytes.
    pub fn data_hex(&self) -> String {
        self.data().iter().map(|b| format!("{:02x}", b)).join(" ")
    }

    /// Checks the packet invariants.
    pub fn validate(&self) -> Result<(), ConstructionError> {
        if usize::from(self.dlc) > CAN_MAX_DLEN {
            return Err(ConstructionError::TooMuchData);
        }
        let max_id = if self.extended {
            CAN_EFF_MASK
        } else {
            CAN_SFF_MASK
        };
        if !self.error && self.identifier > max_id {
            return Err(ConstructionError::IdTooLarge);
        }
        Ok(())
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}) {} ", self.timestamp, self.direction.marker())?;
        if self.extended {
            write!(f, "{:08X}", self.identifier)?;
        } else {
            write!(f, "{:03X}", self.identifier)?;
        }
        if self.error {
            write!(f, " ERR")?;
        }
        if self.rtr {
            write!(f, " [{}] RTR", self.dlc)
        } else {
            write!(f, " [{}] {}", self.dlc, self.data_hex())
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
