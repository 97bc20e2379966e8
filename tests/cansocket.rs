// cancapture/tests/cansocket.rs
//
// Integration tests for the raw CAN socket.
//
// This file is part of the Rust 'cancapture' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

use cancapture::{CanSocket, Error};

#[cfg(feature = "vcan_tests")]
use cancapture::{
    frame::ERR_MASK_ALL, CanFilter, CanFrame, Direction, FilterSet, Packet, ShouldRetry,
    SocketOptions,
};
#[cfg(feature = "vcan_tests")]
use serial_test::serial;
#[cfg(feature = "vcan_tests")]
use std::time::Duration;

// The virtual CAN interface to use for tests.
#[cfg(feature = "vcan_tests")]
const VCAN: &str = "vcan0";

#[test]
fn test_nonexistant_device() {
    assert!(matches!(
        CanSocket::open("invalid"),
        Err(Error::InterfaceNotFound { .. })
    ));
}

#[cfg(feature = "vcan_tests")]
#[test]
#[serial]
fn vcan_poll_timeout() {
    let sock = CanSocket::open(VCAN).unwrap();
    // Filter out _any_ traffic
    sock.set_filters::<CanFilter>(&[]).unwrap();

    assert!(!sock.poll_readable(Duration::from_millis(50)).unwrap());
}

#[cfg(feature = "vcan_tests")]
#[test]
#[serial]
fn vcan_test_nonblocking() {
    let sock = CanSocket::open(VCAN).unwrap();
    sock.set_filters::<CanFilter>(&[]).unwrap();
    sock.set_nonblocking(true).unwrap();

    // no timeout set, but should return immediately
    assert!(sock.read_frame().should_retry());
}

#[cfg(feature = "vcan_tests")]
#[test]
#[serial]
fn vcan_set_filters() {
    let sock = CanSocket::open(VCAN).unwrap();
    sock.set_error_filter(ERR_MASK_ALL).unwrap();
    sock.set_filter_accept_all().unwrap();
    sock.apply_filter_set(&FilterSet::from_specs(&["123:7FF", "400~700", "#FF"]))
        .unwrap();
}

#[cfg(feature = "vcan_tests")]
#[test]
#[serial]
fn vcan_write_and_read_with_timestamp() {
    let rx = CanSocket::open(VCAN).unwrap();
    let tx = CanSocket::open(VCAN).unwrap();

    let packet = Packet::new(0x1A5, false, &[1, 2, 3]).unwrap();
    tx.write_frame(&CanFrame::from_packet(&packet).unwrap())
        .unwrap();

    assert!(rx.poll_readable(Duration::from_millis(500)).unwrap());
    let (frame, ts) = rx.read_frame_with_timestamp().unwrap();
    let got = frame.to_packet(Direction::Received, ts);

    assert_eq!(got.identifier, 0x1A5);
    assert_eq!(got.data(), &[1, 2, 3]);
    assert!(ts.secs > 0);
}

#[cfg(feature = "vcan_tests")]
#[test]
#[serial]
fn vcan_kernel_filter_drops() {
    let rx = CanSocket::open(VCAN).unwrap();
    let tx = CanSocket::open(VCAN).unwrap();
    rx.apply_filter_set(&FilterSet::from_specs(&["100:7FF"]))
        .unwrap();

    for id in [0x200, 0x100] {
        let packet = Packet::new(id, false, &[]).unwrap();
        tx.write_frame(&CanFrame::from_packet(&packet).unwrap())
            .unwrap();
    }

    assert!(rx.poll_readable(Duration::from_millis(500)).unwrap());
    let frame = rx.read_frame().unwrap();
    assert_eq!(frame.raw_id(), 0x100);
}
