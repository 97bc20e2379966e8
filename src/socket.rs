// cancapture/src/socket.rs
//
// Implements the raw SocketCAN socket on Linux.
//
// This file is part of the Rust 'cancapture' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Implementation of a raw socket for classic CAN 2.0 on Linux.

use crate::{
    frame::{CanFrame, CAN_MTU},
    CanAddr, CanFilter, Error, FilterSet, Result, Timestamp,
};
use libc::{socklen_t, timeval, AF_CAN, EINPROGRESS};
use nix::poll::{poll, PollFd, PollFlags};
use socket2::SockAddr;
use std::{
    io::{self, Read, Write},
    mem,
    os::{
        raw::{c_int, c_ulong, c_void},
        unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd},
    },
    ptr,
    time::Duration,
};

pub use libc::{CAN_RAW, CAN_RAW_ERR_FILTER, CAN_RAW_FILTER, CAN_RAW_LOOPBACK, SOL_CAN_RAW};

/// ioctl to get the kernel receive timestamp of the last frame as a `timeval`
const SIOCGSTAMP: c_ulong = 0x8906;

/// Check an error return value for timeouts.
///
/// A read on a socket that is not ready reports the condition as an error.
/// This trait adds a `should_retry` method to `Error` and `Result` to check
/// for this condition.
pub trait ShouldRetry {
    /// Check for timeout
    ///
    /// If `true`, the error is probably due to a timeout.
    fn should_retry(&self) -> bool;
}

impl ShouldRetry for io::Error {
    fn should_retry(&self) -> bool {
        // EAGAIN, EINPROGRESS and EWOULDBLOCK are the three possible codes
        // returned when a timeout occurs. the stdlib already maps EAGAIN
        // and EWOULDBLOCK to WouldBlock
        if self.raw_os_error() == Some(EINPROGRESS) {
            return true;
        }
        matches!(
            self.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
        )
    }
}

impl<E: std::fmt::Debug> ShouldRetry for io::Result<E> {
    fn should_retry(&self) -> bool {
        match *self {
            Err(ref e) => e.should_retry(),
            _ => false,
        }
    }
}

// ===== Socket options =====

/// Traits for setting CAN socket options.
pub trait SocketOptions: AsRawFd {
    /// Sets an option on the socket.
    ///
    /// The libc `setsockopt` function is set to set various options on a
    /// socket. `set_socket_option` offers a somewhat type-safe wrapper that
    /// does not require messing around with `*const c_void`s.
    ///
    /// Note that the `val` parameter must be specified correctly; if an option
    /// expects an integer, it is advisable to pass in a `c_int`, not the default
    /// of `i32`.
    fn set_socket_option<T>(&self, level: c_int, name: c_int, val: &T) -> io::Result<()> {
        let ret = unsafe {
            libc::setsockopt(
                self.as_raw_fd(),
                level,
                name,
                val as *const _ as *const c_void,
                mem::size_of::<T>() as socklen_t,
            )
        };

        match ret {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    /// Sets a collection of multiple socket options with one call.
    fn set_socket_option_mult<T>(&self, level: c_int, name: c_int, values: &[T]) -> io::Result<()> {
        let ret = if values.is_empty() {
            // can't pass in a ptr to a 0-len slice, pass a null ptr instead
            unsafe { libc::setsockopt(self.as_raw_fd(), level, name, ptr::null(), 0) }
        } else {
            unsafe {
                libc::setsockopt(
                    self.as_raw_fd(),
                    level,
                    name,
                    values.as_ptr().cast(),
                    mem::size_of_val(values) as socklen_t,
                )
            }
        };

        match ret {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    /// Sets CAN ID filters on the socket.
    ///
    /// CAN packages received by SocketCAN are matched against these filters,
    /// only matching packets are returned by the interface.
    fn set_filters<F>(&self, filters: &[F]) -> io::Result<()>
    where
        F: Into<CanFilter> + Copy,
    {
        let filters: Vec<CanFilter> = filters.iter().map(|f| (*f).into()).collect();
        self.set_socket_option_mult(SOL_CAN_RAW, CAN_RAW_FILTER, &filters)
    }

    /// Accept all frames, disabling any kind of filtering.
    fn set_filter_accept_all(&self) -> io::Result<()> {
        self.set_filters(&[(0, 0)])
    }

    /// Sets the error mask on the socket.
    ///
    /// With a zero mask no error conditions are reported as error frames.
    /// A non-empty mask causes the socket to receive notification about the
    /// specified error classes.
    fn set_error_filter(&self, mask: u32) -> io::Result<()> {
        self.set_socket_option(SOL_CAN_RAW, CAN_RAW_ERR_FILTER, &mask)
    }

    /// Installs a complete filter set: the ID rules and the error mask.
    fn apply_filter_set(&self, set: &FilterSet) -> io::Result<()> {
        self.set_filters(&set.kernel_filters())?;
        self.set_error_filter(set.error_mask())
    }

    /// Enable or disable loopback.
    ///
    /// By default, loopback is enabled, causing other applications that open
    /// the same CAN bus to see frames emitted by different applications on
    /// the same system.
    fn set_loopback(&self, enabled: bool) -> io::Result<()> {
        let loopback = c_int::from(enabled);
        self.set_socket_option(SOL_CAN_RAW, CAN_RAW_LOOPBACK, &loopback)
    }
}

// What a poll result means to a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Idle,
    Readable,
    Failed,
}

impl Readiness {
    // Error conditions win over pending data; they must be collected before
    // the socket reports quiet again.
    fn from_revents(revents: Option<PollFlags>) -> Self {
        let failed = PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL;
        match revents {
            Some(ev) if ev.intersects(failed) => Readiness::Failed,
            Some(ev) if ev.intersects(PollFlags::POLLIN) => Readiness::Readable,
            _ => Readiness::Idle,
        }
    }
}

// ===== CanSocket =====

/// A raw socket for classic CAN 2.0 devices.
///
/// The socket is bound to a single interface when it is opened and is
/// closed when the object is dropped.
///
/// All I/O goes through shared references, so one thread can read while
/// others write a whole frame at a time.
#[derive(Debug)]
pub struct CanSocket(socket2::Socket);

impl CanSocket {
    /// Open a named CAN device, such as "can0" or "vcan0".
    pub fn open(ifname: &str) -> Result<Self> {
        let addr = CanAddr::from_iface(ifname)?;
        Self::open_addr(&addr).map_err(|err| match err {
            Error::BindFailed { source, .. } => Error::BindFailed {
                iface: ifname.to_string(),
                source,
            },
            err => err,
        })
    }

    /// Open a CAN socket by address.
    pub fn open_addr(addr: &CanAddr) -> Result<Self> {
        let af_can = socket2::Domain::from(AF_CAN);
        let can_raw = socket2::Protocol::from(CAN_RAW);

        let sock = socket2::Socket::new_raw(af_can, socket2::Type::RAW, Some(can_raw))?;
        sock.bind(&SockAddr::from(*addr))
            .map_err(|source| Error::BindFailed {
                iface: format!("#{}", addr.ifindex()),
                source,
            })?;
        Ok(Self(sock))
    }

    /// Gets a shared reference to the underlying socket object
    pub fn as_raw_socket(&self) -> &socket2::Socket {
        &self.0
    }

    /// Waits up to `timeout` for a frame to become readable.
    ///
    /// A pending socket error (like `ENETDOWN` after the interface went
    /// down) is returned as an error and cleared, so the next poll waits
    /// again instead of returning at once.
    pub fn poll_readable(&self, timeout: Duration) -> Result<bool> {
        let ms = timeout.as_millis().min(u128::from(u16::MAX)) as u16;
        let mut fds = [PollFd::new(self.as_fd(), PollFlags::POLLIN)];

        let n = poll(&mut fds, ms).map_err(Error::Poll)?;
        if n == 0 {
            return Ok(false);
        }
        match Readiness::from_revents(fds[0].revents()) {
            Readiness::Idle => Ok(false),
            Readiness::Readable => Ok(true),
            Readiness::Failed => {
                let err = self
                    .0
                    .take_error()?
                    .unwrap_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe));
                Err(Error::Io(err))
            }
        }
    }

    /// Blocking read a single CAN frame.
    pub fn read_frame(&self) -> io::Result<CanFrame> {
        let mut frame = CanFrame::default();
        match (&self.0).read(frame.as_bytes_mut())? {
            CAN_MTU => Ok(frame),
            n => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("incomplete CAN frame: {} bytes", n),
            )),
        }
    }

    /// Blocking read a single CAN frame with its kernel receive timestamp.
    ///
    /// The timestamp is queried with `SIOCGSTAMP` right after the read, so
    /// only one thread should read from the socket.
    pub fn read_frame_with_timestamp(&self) -> io::Result<(CanFrame, Timestamp)> {
        let frame = self.read_frame()?;

        let mut tv = timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let ret = unsafe {
            libc::ioctl(self.as_raw_fd(), SIOCGSTAMP as _, &mut tv as *mut timeval)
        };

        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok((frame, Timestamp::from(tv)))
    }

    /// Writes a single CAN frame with one `write` call.
    ///
    /// A short write is reported as an error; nothing is retried.
    pub fn write_frame(&self, frame: &CanFrame) -> io::Result<()> {
        match (&self.0).write(frame.as_bytes())? {
            CAN_MTU => Ok(()),
            n => Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short CAN frame write: {} of {} bytes", n, CAN_MTU),
            )),
        }
    }

    /// Change socket to non-blocking mode or back to blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.0.set_nonblocking(nonblocking)
    }
}

impl SocketOptions for CanSocket {}

impl AsRawFd for CanSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl AsFd for CanSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_retry() {
        let err = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(err.should_retry());

        let err = io::Error::from_raw_os_error(EINPROGRESS);
        assert!(err.should_retry());

        let res: io::Result<()> = Err(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(!res.should_retry());
        assert!(!Ok::<_, io::Error>(()).should_retry());
    }

    #[test]
    fn test_poll_readiness() {
        assert_eq!(Readiness::from_revents(None), Readiness::Idle);
        assert_eq!(
            Readiness::from_revents(Some(PollFlags::empty())),
            Readiness::Idle
        );
        assert_eq!(
            Readiness::from_revents(Some(PollFlags::POLLIN)),
            Readiness::Readable
        );
        // A downed interface reports POLLERR without POLLIN
        assert_eq!(
            Readiness::from_revents(Some(PollFlags::POLLERR)),
            Readiness::Failed
        );
        assert_eq!(
            Readiness::from_revents(Some(PollFlags::POLLERR | PollFlags::POLLIN)),
            Readiness::Failed
        );
        assert_eq!(
            Readiness::from_revents(Some(PollFlags::POLLHUP)),
            Readiness::Failed
        );
    }

    #[test]
    fn test_open_unknown_iface() {
        match CanSocket::open("nosuchcan7") {
            Err(Error::InterfaceNotFound { iface, .. }) => assert_eq!(iface, "nosuchcan7"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
