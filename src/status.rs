// cancapture/src/status.rs
//
// Implements the live traffic counters of a CAN channel.
//
// This file is part of the Rust 'cancapture' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Traffic counters.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// A point-in-time copy of the channel traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStatus {
    /// Frames received
    pub packets_in: u64,
    /// Frames sent
    pub packets_out: u64,
    /// Data bytes received
    pub bytes_in: u64,
    /// Data bytes sent
    pub bytes_out: u64,
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "in: {} packets / {} bytes, out: {} packets / {} bytes",
            self.packets_in, self.bytes_in, self.packets_out, self.bytes_out
        )
    }
}

/// The live counters, updated by the receive loop and the send path.
///
/// Each counter is an independent atomic, so a snapshot taken while
/// traffic flows may mix values from adjacent frames.
#[derive(Debug, Default)]
pub struct StatusCounter {
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl StatusCounter {
    /// Creates a zeroed set of counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets every counter back to zero.
    pub fn reset(&self) {
        self.packets_in.store(0, Ordering::Relaxed);
        self.packets_out.store(0, Ordering::Relaxed);
        self.bytes_in.store(0, Ordering::Relaxed);
        self.bytes_out.store(0, Ordering::Relaxed);
    }

    /// Counts one received frame with `nbytes` of data.
    pub fn record_in(&self, nbytes: usize) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.bytes_in.fetch_add(nbytes as u64, Ordering::Relaxed);
    }

    /// Counts one sent frame with `nbytes` of data.
    pub fn record_out(&self, nbytes: usize) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(nbytes as u64, Ordering::Relaxed);
    }

    /// Reads the current counter values.
    pub fn snapshot(&self) -> ThreadStatus {
        ThreadStatus {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn test_counters() {
        let counter = StatusCounter::new();
        assert_eq!(counter.snapshot(), ThreadStatus::default());

        counter.record_in(8);
        counter.record_in(3);
        counter.record_out(0);

        let status = counter.snapshot();
        assert_eq!(status.packets_in, 2);
        assert_eq!(status.bytes_in, 11);
        assert_eq!(status.packets_out, 1);
        assert_eq!(status.bytes_out, 0);

        counter.reset();
        assert_eq!(counter.snapshot(), ThreadStatus::default());
    }

    #[test]
    fn test_concurrent_updates() {
        let counter = Arc::new(StatusCounter::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.record_in(2);
                        counter.record_out(1);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let status = counter.snapshot();
        assert_eq!(status.packets_in, 4000);
        assert_eq!(status.bytes_in, 8000);
        assert_eq!(status.packets_out, 4000);
        assert_eq!(status.bytes_out, 4000);
    }

    #[test]
    fn test_display() {
        let status = ThreadStatus {
            packets_in: 1,
            packets_out: 2,
            bytes_in: 3,
            bytes_out: 4,
        };
        assert_eq!(
            status.to_string(),
            "in: 1 packets / 3 bytes, out: 2 packets / 4 bytes"
        );
    }
}
