// cancapture/src/bitrate.rs
//
// Table of standard CAN bus bit rates.
//
// This file is part of the Rust 'cancapture' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Standard CAN bus bit rates.
//!
//! Each rate carries the BTR0/BTR1 bit timing register pair used by PEAK
//! (SJA1000-based) adapters, with BTR0 in the high byte.

use std::fmt;

/// A standard bit rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bitrate {
    /// Bits per second
    pub bps: u32,
    /// BTR0 (high byte) and BTR1 (low byte)
    pub code: u16,
    /// Human-readable label
    pub label: &'static str,
}

/// All of the known bit rates, slowest first.
pub const BITRATES: [Bitrate; 11] = [
    Bitrate::new(5_000, 0x7F7F, "5 kBit/s"),
    Bitrate::new(10_000, 0x672F, "10 kBit/s"),
    Bitrate::new(20_000, 0x532F, "20 kBit/s"),
    Bitrate::new(33_333, 0x2F11, "33.33 kBit/s"),
    Bitrate::new(50_000, 0x472F, "50 kBit/s"),
    Bitrate::new(95_238, 0x0D12, "95.2 kBit/s"),
    Bitrate::new(100_000, 0x432F, "100 kBit/s"),
    Bitrate::new(125_000, 0x031C, "125 kBit/s"),
    Bitrate::new(250_000, 0x011C, "250 kBit/s"),
    Bitrate::new(500_000, 0x001C, "500 kBit/s"),
    Bitrate::new(1_000_000, 0x0014, "1 MBit/s"),
];

impl Bitrate {
    const fn new(bps: u32, code: u16, label: &'static str) -> Self {
        Self { bps, code, label }
    }

    /// Looks up a rate by its BTR0/BTR1 code.
    pub fn from_code(code: u16) -> Option<Self> {
        BITRATES.iter().find(|b| b.code == code).copied()
    }

    /// Looks up a rate by its label.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim();
        BITRATES
            .iter()
            .find(|b| b.label.eq_ignore_ascii_case(label))
            .copied()
    }

    /// Looks up a rate by bits per second.
    pub fn from_bps(bps: u32) -> Option<Self> {
        BITRATES.iter().find(|b| b.bps == bps).copied()
    }

    /// The BTR0 register value
    pub fn btr0(&self) -> u8 {
        (self.code >> 8) as u8
    }

    /// The BTR1 register value
    pub fn btr1(&self) -> u8 {
        self.code as u8
    }
}

impl fmt::Display for Bitrate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.label)
    }
}
