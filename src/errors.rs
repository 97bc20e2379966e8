// cancapture/src/errors.rs
//
// Implements errors for the Rust CAN capture library on Linux.
//
// This file is part of the Rust 'cancapture' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Library errors.
//!
//! Socket, bind and file failures are returned to the caller. Transient
//! poll errors and malformed filter rules are also represented here, but
//! the channel and the filter parser recover from them locally: they are
//! logged and the capture session carries on.

use crate::channel::ChannelState;
use std::io;
use thiserror::Error;

/// A result type for the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Error that occurs when creating a CAN frame or packet.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConstructionError {
    /// CAN ID was outside the range of valid IDs
    #[error("CAN ID too large")]
    IdTooLarge,
    /// More than 8 bytes of payload data were passed in
    #[error("Payload is larger than CAN maximum of 8 bytes")]
    TooMuchData,
}

/// The library error type.
#[derive(Error, Debug)]
pub enum Error {
    /// The interface name did not resolve to a kernel interface index.
    #[error("CAN interface '{iface}' not found: {source}")]
    InterfaceNotFound {
        /// The name that was looked up
        iface: String,
        /// The lookup failure
        #[source]
        source: nix::Error,
    },
    /// The kernel refused to bind a raw CAN socket to the interface.
    #[error("Unable to bind a CAN socket to '{iface}': {source}")]
    BindFailed {
        /// The interface name
        iface: String,
        /// The bind failure
        #[source]
        source: io::Error,
    },
    /// Waiting for socket readiness failed. The receive loop recovers.
    #[error("Poll error: {0}")]
    Poll(#[source] nix::Error),
    /// A frame could not be written completely. Counters are unchanged.
    #[error("Failed to send CAN frame: {0}")]
    SendFailed(#[source] io::Error),
    /// A textual filter rule could not be parsed.
    #[error("Invalid CAN filter '{spec}'")]
    FilterParse {
        /// The offending rule text
        spec: String,
    },
    /// The log file does not start with the expected marker.
    #[error("Not a CAN log file or the version does not match (magic {0:#010X})")]
    BadMagic(u32),
    /// A log file record was readable but malformed.
    #[error("Invalid log record: {0}")]
    InvalidRecord(String),
    /// A start was requested while the channel was not stopped.
    #[error("CAN channel is busy ({0:?})")]
    ChannelBusy(ChannelState),
    /// A packet or frame could not be created.
    #[error(transparent)]
    Construction(#[from] ConstructionError),
    /// The capture configuration could not be read.
    #[cfg(feature = "config")]
    #[error("Configuration error: {0}")]
    Config(String),
    /// A low-level I/O error
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Determines if the error is transient, i.e. the operation that
    /// produced it may simply be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Poll(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_magic_display() {
        let err = Error::BadMagic(0x12345678);
        assert_eq!(
            err.to_string(),
            "Not a CAN log file or the version does not match (magic 0x12345678)"
        );
    }

    #[test]
    fn test_transient() {
        assert!(Error::Poll(nix::Error::EINTR).is_transient());
        assert!(!Error::BadMagic(0).is_transient());
        assert!(!Error::from(ConstructionError::TooMuchData).is_transient());
    }
}
