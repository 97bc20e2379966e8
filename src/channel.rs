// cancapture/src/channel.rs
//
// Implements the CAN channel: a capture session on one interface.
//
// This file is part of the Rust 'cancapture' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! The CAN channel engine.
//!
//! A [`CanChannel`] binds a raw CAN socket to an interface and runs a
//! receive loop on its own thread. The loop polls the socket in short
//! cycles so that a stop request is noticed within [`POLL_INTERVAL`].
//!
//! Every received frame is turned into a [`Packet`] and published to the
//! channel listeners as [`ChannelEvent::PacketArrived`], followed by the
//! updated counters as [`ChannelEvent::StatusChanged`]. Frames sent through
//! the channel are echoed to the listeners the same way, marked as
//! [`Direction::Sent`].
//!
//! Listeners are called on the thread that produced the event: the receive
//! thread for incoming traffic, or the caller of [`CanChannel::send`].

use crate::{
    socket::ShouldRetry, CanFrame, CanSocket, Direction, Error, FilterSet, Packet, Result,
    SocketOptions, StatusCounter, Subscribers, ThreadStatus, Timestamp,
};
use log::{debug, info, trace, warn};
use std::{
    fmt, io,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        mpsc, Arc, Mutex, MutexGuard, RwLock,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// The longest time the receive loop waits before checking for a stop
/// request.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The life cycle of a channel.
///
/// `Stopped -> Starting -> Running -> Stopping -> Stopped`. A failed start
/// goes straight back to `Stopped`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// No socket is open
    Stopped = 0,
    /// The socket is being opened and configured
    Starting = 1,
    /// The receive loop is running
    Running = 2,
    /// A stop was requested and the loop is winding down
    Stopping = 3,
}

impl From<u8> for ChannelState {
    fn from(val: u8) -> Self {
        match val {
            1 => ChannelState::Starting,
            2 => ChannelState::Running,
            3 => ChannelState::Stopping,
            _ => ChannelState::Stopped,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ChannelState::Stopped => "stopped",
            ChannelState::Starting => "starting",
            ChannelState::Running => "running",
            ChannelState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Events published by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A frame was received or sent
    PacketArrived(Packet),
    /// The traffic counters changed
    StatusChanged(ThreadStatus),
}

/// Something that can put a packet on the bus.
pub trait Transmit: Send + Sync {
    /// Sends a packet.
    ///
    /// Returns the packet as sent (stamped with its direction and time), or
    /// `None` if the transmitter is not currently able to send.
    fn transmit(&self, packet: &Packet) -> Result<Option<Packet>>;
}

// State shared between the channel handle and its receive thread.
struct Shared {
    state: AtomicU8,
    stop: AtomicBool,
    socket: RwLock<Option<Arc<CanSocket>>>,
    filters: Mutex<FilterSet>,
    iface: Mutex<Option<String>>,
    counter: StatusCounter,
    subscribers: Subscribers<ChannelEvent>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ChannelState::Stopped as u8),
            stop: AtomicBool::new(false),
            socket: RwLock::new(None),
            filters: Mutex::new(FilterSet::new()),
            iface: Mutex::new(None),
            counter: StatusCounter::new(),
            subscribers: Subscribers::new(),
        }
    }

    fn state(&self) -> ChannelState {
        ChannelState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn socket(&self) -> Option<Arc<CanSocket>> {
        self.socket
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(Arc::clone)
    }

    fn set_socket(&self, sock: Option<Arc<CanSocket>>) {
        *self.socket.write().unwrap_or_else(|e| e.into_inner()) = sock;
    }

    fn filters(&self) -> MutexGuard<'_, FilterSet> {
        self.filters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn iface(&self) -> MutexGuard<'_, Option<String>> {
        self.iface.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_status(&self) {
        let status = self.counter.snapshot();
        self.subscribers.publish(&ChannelEvent::StatusChanged(status));
    }

    // Accounts for a frame write. Only a complete write touches the
    // counters and is echoed to the listeners.
    fn complete_send(&self, packet: Packet, written: io::Result<()>) -> Result<Packet> {
        written.map_err(Error::SendFailed)?;
        trace!("{}", packet);

        self.counter.record_out(packet.len());
        self.publish_status();
        self.subscribers.publish(&ChannelEvent::PacketArrived(packet));
        Ok(packet)
    }

    // Closes the socket and marks the channel stopped.
    fn shut(&self) {
        self.set_socket(None);
        self.set_state(ChannelState::Stopped);
    }
}

/// A capture session on a single CAN interface.
///
/// All methods take `&self`, so a channel can be shared between threads
/// (for example with a [`PeriodicSender`](crate::PeriodicSender)) behind an
/// `Arc`. Dropping the channel stops it.
pub struct CanChannel {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CanChannel {
    /// Creates a stopped channel with an accept-all filter set.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            worker: Mutex::new(None),
        }
    }

    /// The current life cycle state.
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Determines if the receive loop is running.
    pub fn is_running(&self) -> bool {
        self.state() == ChannelState::Running
    }

    /// The name of the interface of the current (or last) session.
    pub fn interface(&self) -> Option<String> {
        self.shared.iface().clone()
    }

    /// A snapshot of the traffic counters.
    pub fn status(&self) -> ThreadStatus {
        self.shared.counter.snapshot()
    }

    /// The stored filter set.
    pub fn filters(&self) -> FilterSet {
        self.shared.filters().clone()
    }

    /// Registers a listener closure for channel events.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.shared.subscribers.add(listener);
    }

    /// Gets a receiver that gets a copy of every channel event.
    pub fn subscribe(&self) -> mpsc::Receiver<ChannelEvent> {
        self.shared.subscribers.channel()
    }

    /// Sets the receive filters from textual slots.
    ///
    /// See [`FilterSet::from_specs`] for the syntax and for how bad slots
    /// are handled. The set is applied on every start, and right away if
    /// the channel is running.
    pub fn set_filters<S: AsRef<str>>(&self, specs: &[S]) -> Result<()> {
        self.set_filter_set(FilterSet::from_specs(specs))
    }

    /// Sets the receive filters.
    pub fn set_filter_set(&self, set: FilterSet) -> Result<()> {
        *self.shared.filters() = set.clone();

        if self.is_running() {
            if let Some(sock) = self.shared.socket() {
                debug!("Updating the filters of the running channel");
                sock.apply_filter_set(&set)?;
            }
        }
        Ok(())
    }

    /// Opens the interface and starts the receive loop.
    ///
    /// The socket is opened and configured on the calling thread, so any
    /// failure is returned here and leaves the channel stopped. Starting a
    /// channel that is not stopped fails with [`Error::ChannelBusy`].
    pub fn start(&self, iface: &str) -> Result<()> {
        self.shared
            .state
            .compare_exchange(
                ChannelState::Stopped as u8,
                ChannelState::Starting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|state| Error::ChannelBusy(ChannelState::from(state)))?;

        match self.launch(iface) {
            Ok(()) => {
                info!("CAN channel started on {}", iface);
                Ok(())
            }
            Err(err) => {
                self.shared.shut();
                Err(err)
            }
        }
    }

    fn launch(&self, iface: &str) -> Result<()> {
        let sock = CanSocket::open(iface)?;
        sock.apply_filter_set(&self.shared.filters())?;
        let sock = Arc::new(sock);

        *self.shared.iface() = Some(iface.to_string());
        self.shared.counter.reset();
        self.shared.stop.store(false, Ordering::Release);
        self.shared.set_socket(Some(Arc::clone(&sock)));
        self.shared.publish_status();

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("can-rx-{}", iface))
            .spawn(move || run(shared, sock))?;

        // A stop that sees `Running` must find the handle. A stop that got
        // in first has already moved the state on.
        *self.worker() = Some(handle);
        let _ = self.shared.state.compare_exchange(
            ChannelState::Starting as u8,
            ChannelState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        Ok(())
    }

    /// Stops the receive loop and closes the socket.
    ///
    /// Blocks until the receive thread has exited, which takes at most one
    /// poll cycle. Stopping a stopped channel does nothing.
    pub fn stop(&self) {
        let handle = match self.worker().take() {
            Some(handle) => handle,
            None => return,
        };

        self.shared.set_state(ChannelState::Stopping);
        self.shared.stop.store(true, Ordering::Release);

        // A listener may stop the channel from the receive thread itself.
        if handle.thread().id() == thread::current().id() {
            debug!("Stop requested from the receive thread");
            return;
        }

        if handle.join().is_err() {
            warn!("CAN receive thread panicked");
            self.shared.shut();
        }
        info!("CAN channel stopped");
    }

    /// Sends a packet on the bus.
    ///
    /// Returns `Ok(None)` without sending if the channel is not running.
    /// Otherwise the frame is written with a single `write`; if that fails
    /// the counters are left alone and [`Error::SendFailed`] is returned.
    /// On success the counters are updated, the sent packet is echoed to
    /// the listeners, and returned.
    pub fn send(&self, packet: &Packet) -> Result<Option<Packet>> {
        if !self.is_running() {
            return Ok(None);
        }
        let sock = match self.shared.socket() {
            Some(sock) => sock,
            None => return Ok(None),
        };

        let frame = CanFrame::from_packet(packet)?;

        let mut packet = *packet;
        packet.direction = Direction::Sent;
        packet.timestamp = Timestamp::now();

        let written = sock.write_frame(&frame);
        self.shared.complete_send(packet, written).map(Some)
    }

    fn worker(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for CanChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CanChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Transmit for CanChannel {
    fn transmit(&self, packet: &Packet) -> Result<Option<Packet>> {
        self.send(packet)
    }
}

impl fmt::Debug for CanChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CanChannel")
            .field("state", &self.state())
            .field("interface", &self.interface())
            .field("status", &self.status())
            .finish()
    }
}

// The receive loop.
fn run(shared: Arc<Shared>, sock: Arc<CanSocket>) {
    debug!("CAN receive loop running");

    while !shared.stop.load(Ordering::Acquire) {
        match sock.poll_readable(POLL_INTERVAL) {
            Ok(false) => continue,
            Ok(true) => (),
            Err(err) => {
                warn!("CAN poll error: {}", err);
                // A downed interface keeps failing; don't spin on it
                thread::sleep(POLL_INTERVAL);
                continue;
            }
        }

        match sock.read_frame_with_timestamp() {
            Ok((frame, ts)) => {
                let packet = frame.to_packet(Direction::Received, ts);
                trace!("{}", packet);

                shared.counter.record_in(packet.len());
                shared
                    .subscribers
                    .publish(&ChannelEvent::PacketArrived(packet));
                shared.publish_status();
            }
            Err(err) if err.should_retry() => (),
            Err(err) => {
                warn!("CAN read error: {}", err);
                // Errors like a downed interface come back on every poll
                thread::sleep(POLL_INTERVAL);
            }
        }
    }

    drop(sock);
    shared.shut();
    debug!("CAN receive loop exited");
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_u8() {
        for state in [
            ChannelState::Stopped,
            ChannelState::Starting,
            ChannelState::Running,
            ChannelState::Stopping,
        ] {
            assert_eq!(ChannelState::from(state as u8), state);
        }
        assert_eq!(ChannelState::from(99), ChannelState::Stopped);
    }

    #[test]
    fn test_new_channel() {
        let chan = CanChannel::new();
        assert_eq!(chan.state(), ChannelState::Stopped);
        assert!(!chan.is_running());
        assert_eq!(chan.status(), ThreadStatus::default());
        assert!(chan.filters().is_accept_all());
        assert_eq!(chan.interface(), None);
        chan.stop();
        assert_eq!(chan.state(), ChannelState::Stopped);
    }

    #[test]
    fn test_send_when_stopped() {
        let chan = CanChannel::new();
        let rx = chan.subscribe();

        let packet = Packet::new(0x123, false, &[1, 2]).unwrap();
        assert_eq!(chan.send(&packet).unwrap(), None);
        assert_eq!(chan.transmit(&packet).unwrap(), None);
        assert_eq!(chan.status(), ThreadStatus::default());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_start_unknown_iface() {
        let chan = CanChannel::new();
        let rx = chan.subscribe();

        match chan.start("nosuchcan3") {
            Err(Error::InterfaceNotFound { iface, .. }) => assert_eq!(iface, "nosuchcan3"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(chan.state(), ChannelState::Stopped);
        assert!(rx.try_recv().is_err());

        // The channel can be started again after a failure
        assert!(chan.start("nosuchcan3").is_err());
        assert_eq!(chan.state(), ChannelState::Stopped);
    }

    #[test]
    fn test_failed_send_leaves_counters() {
        let shared = Shared::new();
        let rx = shared.subscribers.channel();

        let mut packet = Packet::new(0x321, false, &[1, 2, 3]).unwrap();
        packet.direction = Direction::Sent;

        let down = io::Error::from_raw_os_error(libc::ENETDOWN);
        let res = shared.complete_send(packet, Err(down));
        assert!(matches!(res, Err(Error::SendFailed(_))));
        let res = shared.complete_send(
            packet,
            Err(io::Error::new(io::ErrorKind::WriteZero, "short write")),
        );
        assert!(matches!(res, Err(Error::SendFailed(_))));
        assert_eq!(shared.counter.snapshot(), ThreadStatus::default());
        assert!(rx.try_recv().is_err());

        assert_eq!(shared.complete_send(packet, Ok(())).unwrap(), packet);
        let status = shared.counter.snapshot();
        assert_eq!((status.packets_out, status.bytes_out), (1, 3));
        assert_eq!(
            rx.try_iter().collect::<Vec<_>>(),
            vec![
                ChannelEvent::StatusChanged(status),
                ChannelEvent::PacketArrived(packet)
            ]
        );
    }

    #[test]
    fn test_failed_start_releases_socket() {
        let chan = CanChannel::new();
        assert!(chan.start("nosuchcan5").is_err());
        assert!(chan.shared.socket().is_none());
        assert!(chan.worker().is_none());
    }

    #[cfg(feature = "vcan_tests")]
    #[test]
    #[serial_test::serial]
    fn vcan_stop_releases_socket() {
        let chan = CanChannel::new();
        chan.start("vcan0").unwrap();
        assert!(chan.is_running());
        assert!(chan.worker().is_some());

        let sock = Arc::downgrade(&chan.shared.socket().unwrap());

        chan.stop();
        assert_eq!(chan.state(), ChannelState::Stopped);
        assert!(chan.shared.socket().is_none());
        assert!(chan.worker().is_none());

        // Every handle to the socket is gone, so it has been closed
        assert!(sock.upgrade().is_none());
    }

    #[cfg(feature = "vcan_tests")]
    #[test]
    #[serial_test::serial]
    fn vcan_stop_while_starting() {
        for _ in 0..20 {
            let chan = Arc::new(CanChannel::new());
            let stopper = {
                let chan = Arc::clone(&chan);
                thread::spawn(move || {
                    while chan.state() != ChannelState::Running {
                        thread::yield_now();
                    }
                    chan.stop();
                })
            };
            chan.start("vcan0").unwrap();
            stopper.join().unwrap();
            assert_eq!(chan.state(), ChannelState::Stopped);
        }
    }

    #[test]
    fn test_stored_filters() {
        let chan = CanChannel::new();
        chan.set_filters(&["123:7FF", "zz", "#FF", ""]).unwrap();

        let set = chan.filters();
        assert_eq!(set.rules().len(), 1);
        assert_eq!(set.error_mask(), 0xFF);
    }
}
