// cancapture/src/periodic.rs
//
// Implements periodic transmission of CAN frames.
//
// This file is part of the Rust 'cancapture' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Periodic transmit jobs.
//!
//! A [`PeriodicSender`] owns any number of jobs, each of which sends one
//! frame at a fixed interval. Jobs are described with text fields, as they
//! would be typed into a send table:
//!
//! | field        | accepted                                   |
//! |--------------|--------------------------------------------|
//! | `interval`   | decimal milliseconds, 1 to 3600000         |
//! | `identifier` | hex, up to 7FF (or 1FFFFFFF if extended)   |
//! | `extended`   | "0" or "1"                                 |
//! | `dlc`        | decimal, 0 to 8                            |
//! | `data`       | hex bytes, up to 8, spaces allowed         |
//!
//! A job with any invalid field never runs. All jobs share one scheduler
//! thread.

use crate::{Packet, Result, Transmit};
use libc::{CAN_EFF_MASK, CAN_MAX_DLEN, CAN_SFF_MASK};
use log::{debug, trace, warn};
use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

#[cfg(feature = "config")]
use serde::{Deserialize, Serialize};

/// The longest allowed interval, in milliseconds (one hour).
pub const MAX_INTERVAL_MS: u64 = 3_600_000;

/// Identifies a job within a sender.
pub type JobId = usize;

/// The textual description of a periodic job.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "config", serde(default))]
pub struct JobSpec {
    /// Interval in milliseconds
    pub interval: String,
    /// CAN identifier in hex
    pub identifier: String,
    /// "1" for an extended identifier, "0" for standard
    pub extended: String,
    /// Data length code
    pub dlc: String,
    /// Data bytes in hex
    pub data: String,
    /// Whether the job should run
    pub active: bool,
}

impl Default for JobSpec {
    fn default() -> Self {
        Self {
            interval: "0".into(),
            identifier: "0".into(),
            extended: "0".into(),
            dlc: "0".into(),
            data: "0".into(),
            active: false,
        }
    }
}

/// Which fields of a [`JobSpec`] are valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobValidity {
    /// The interval is in range
    pub interval: bool,
    /// The identifier is hex and fits the frame format
    pub identifier: bool,
    /// The extended flag is "0" or "1"
    pub extended: bool,
    /// The DLC is in range
    pub dlc: bool,
    /// The data is at most eight hex bytes
    pub data: bool,
}

impl JobValidity {
    /// Determines if every field is valid.
    pub fn is_valid(&self) -> bool {
        self.interval && self.identifier && self.extended && self.dlc && self.data
    }
}

impl JobSpec {
    /// Checks every field.
    pub fn validate(&self) -> JobValidity {
        self.parse().0
    }

    /// Builds the interval and packet, if every field is valid.
    ///
    /// The data is zero-padded or cut to the DLC.
    pub fn to_packet(&self) -> Option<(Duration, Packet)> {
        self.parse().1
    }

    fn parse(&self) -> (JobValidity, Option<(Duration, Packet)>) {
        let interval = self
            .interval
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|ms| (1..=MAX_INTERVAL_MS).contains(ms));

        let extended = match self.extended.trim() {
            "0" => Some(false),
            "1" => Some(true),
            _ => None,
        };

        let max_id = match extended {
            Some(false) => CAN_SFF_MASK,
            _ => CAN_EFF_MASK,
        };
        let identifier = parse_hex_u32(&self.identifier).filter(|id| *id <= max_id);

        let dlc = self
            .dlc
            .trim()
            .parse::<u8>()
            .ok()
            .filter(|n| usize::from(*n) <= CAN_MAX_DLEN);

        let data = parse_data(&self.data);

        let validity = JobValidity {
            interval: interval.is_some(),
            identifier: identifier.is_some(),
            extended: extended.is_some(),
            dlc: dlc.is_some(),
            data: data.is_some(),
        };

        let job = match (interval, identifier, extended, dlc, data) {
            (Some(ms), Some(id), Some(ext), Some(dlc), Some(bytes)) => {
                let mut buf = [0u8; CAN_MAX_DLEN];
                buf[..bytes.len()].copy_from_slice(&bytes);
                Packet::new(id, ext, &buf[..usize::from(dlc)])
                    .ok()
                    .map(|packet| (Duration::from_millis(ms), packet))
            }
            _ => None,
        };
        (validity, job)
    }
}

fn parse_hex_u32(s: &str) -> Option<u32> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(s, 16).ok()
}

// Data is hex bytes, with optional spaces between them. An odd number of
// digits gets a leading zero, so "0" is a single zero byte.
fn parse_data(s: &str) -> Option<Vec<u8>> {
    let mut digits: String = s.split_whitespace().collect();
    if let Some(rest) = digits.strip_prefix("0x") {
        digits = rest.to_string();
    }
    if digits.len() % 2 != 0 {
        digits.insert(0, '0');
    }
    hex::decode(&digits)
        .ok()
        .filter(|bytes| bytes.len() <= CAN_MAX_DLEN)
}

// ===== Scheduler =====

#[derive(Debug)]
struct Job {
    spec: JobSpec,
    validity: JobValidity,
    frame: Option<(Duration, Packet)>,
    active: bool,
    next_due: Option<Instant>,
}

impl Job {
    fn new(spec: JobSpec) -> Self {
        let (validity, frame) = spec.parse();
        let mut job = Self {
            spec,
            validity,
            frame,
            active: false,
            next_due: None,
        };
        job.set_active(job.spec.active);
        job
    }

    fn set_active(&mut self, active: bool) -> bool {
        self.active = active && self.frame.is_some();
        self.next_due = match (self.active, &self.frame) {
            (true, Some((interval, _))) => Some(Instant::now() + *interval),
            _ => None,
        };
        self.active
    }
}

#[derive(Debug, Default)]
struct Schedule {
    jobs: BTreeMap<JobId, Job>,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Shared {
    schedule: Mutex<Schedule>,
    wakeup: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Schedule> {
        self.schedule.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Sends frames periodically through a transmitter.
pub struct PeriodicSender {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl PeriodicSender {
    /// Creates a sender with no jobs, and starts its scheduler thread.
    pub fn new<T>(transmitter: Arc<T>) -> Result<Self>
    where
        T: Transmit + ?Sized + 'static,
    {
        let shared = Arc::new(Shared::default());
        let thr_shared = Arc::clone(&shared);

        let worker = thread::Builder::new()
            .name("can-periodic".into())
            .spawn(move || run(thr_shared, transmitter))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Adds or replaces a job.
    ///
    /// The job runs if `spec.active` is set and every field is valid; the
    /// first frame goes out one interval from now. Returns the validity of
    /// the fields.
    pub fn set_job(&self, id: JobId, spec: JobSpec) -> JobValidity {
        let job = Job::new(spec);
        let validity = job.validity;
        if !validity.is_valid() {
            debug!("Periodic job {} is invalid: {:?}", id, validity);
        }

        self.shared.lock().jobs.insert(id, job);
        self.shared.wakeup.notify_all();
        validity
    }

    /// Starts or stops a job, returning whether it is now running.
    ///
    /// An invalid job can't be started.
    pub fn set_active(&self, id: JobId, active: bool) -> bool {
        let running = match self.shared.lock().jobs.get_mut(&id) {
            Some(job) => {
                job.spec.active = active;
                job.set_active(active)
            }
            None => false,
        };
        self.shared.wakeup.notify_all();
        running
    }

    /// Removes a job, returning its description.
    pub fn remove_job(&self, id: JobId) -> Option<JobSpec> {
        let job = self.shared.lock().jobs.remove(&id);
        self.shared.wakeup.notify_all();
        job.map(|job| job.spec)
    }

    /// The ids of all jobs, in ascending order.
    pub fn job_ids(&self) -> Vec<JobId> {
        self.shared.lock().jobs.keys().copied().collect()
    }

    /// The field validity of a job.
    pub fn validity(&self, id: JobId) -> Option<JobValidity> {
        self.shared.lock().jobs.get(&id).map(|job| job.validity)
    }

    /// Determines if a job is running.
    pub fn is_active(&self, id: JobId) -> bool {
        self.shared
            .lock()
            .jobs
            .get(&id)
            .map(|job| job.active)
            .unwrap_or(false)
    }

    /// Stops the scheduler thread. All jobs stop sending.
    pub fn shutdown(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.wakeup.notify_all();

        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("Periodic sender thread panicked");
            }
        }
    }
}

impl Drop for PeriodicSender {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for PeriodicSender {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PeriodicSender")
            .field("jobs", &self.job_ids())
            .finish()
    }
}

// The scheduler loop.
fn run<T>(shared: Arc<Shared>, transmitter: Arc<T>)
where
    T: Transmit + ?Sized,
{
    let mut sched = shared.lock();

    while !sched.shutdown {
        let now = Instant::now();

        let mut due = Vec::new();
        for (id, job) in sched.jobs.iter_mut() {
            if let (true, Some(t), Some((interval, packet))) = (job.active, job.next_due, &job.frame)
            {
                if t <= now {
                    // Skip missed periods rather than sending a burst
                    let mut next = t + *interval;
                    if next <= now {
                        next = now + *interval;
                    }
                    job.next_due = Some(next);
                    due.push((*id, *packet));
                }
            }
        }

        if !due.is_empty() {
            drop(sched);
            for (id, packet) in due {
                match transmitter.transmit(&packet) {
                    Ok(Some(_)) => trace!("Periodic job {} sent", id),
                    Ok(None) => trace!("Periodic job {}: transmitter not ready", id),
                    Err(err) => warn!("Periodic job {} failed: {}", id, err),
                }
            }
            sched = shared.lock();
            continue;
        }

        let next_due = sched
            .jobs
            .values()
            .filter(|job| job.active)
            .filter_map(|job| job.next_due)
            .min();

        sched = match next_due {
            Some(t) => {
                let timeout = t.saturating_duration_since(now);
                shared
                    .wakeup
                    .wait_timeout(sched, timeout)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|e| e.into_inner().0)
            }
            None => shared
                .wakeup
                .wait(sched)
                .unwrap_or_else(|e| e.into_inner()),
        };
    }
    debug!("Periodic sender exited");
}

/////////////////////////////////////////////////////////////////////////////
