// cancapture/src/config.rs
//
// Implements the capture configuration file.
//
// This file is part of the Rust 'cancapture' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! Capture configuration.
//!
//! A capture session can be described in a TOML file:
//!
//! ```toml
//! interface = "can0"
//! bitrate = "500 kBit/s"
//! filters = ["123:7FF", "400~700", "#FF"]
//! log_file = "capture.clf"
//!
//! [[jobs]]
//! interval = "100"
//! identifier = "123"
//! extended = "0"
//! dlc = "2"
//! data = "de ad"
//! active = true
//! ```
//!
//! Jobs are numbered in the order they appear.

use crate::{Bitrate, CanChannel, Error, FilterSet, JobSpec, PeriodicSender, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf, str::FromStr};

/// The interface used when none is configured.
pub const DEFAULT_INTERFACE: &str = "can0";

/// A capture session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// The CAN interface name
    pub interface: String,
    /// The bus bit rate label, informational only
    pub bitrate: Option<String>,
    /// Receive filter slots
    pub filters: Vec<String>,
    /// Where to save the capture
    pub log_file: Option<PathBuf>,
    /// Periodic transmit jobs
    pub jobs: Vec<JobSpec>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interface: DEFAULT_INTERFACE.into(),
            bitrate: None,
            // The one default slot accepts everything
            filters: vec!["0:0".into()],
            log_file: None,
            jobs: Vec::new(),
        }
    }
}

impl CaptureConfig {
    /// Reads a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("{}: {}", path.display(), err)))?;
        text.parse()
    }

    /// The configured bit rate, if it is a known one.
    pub fn bitrate(&self) -> Option<Bitrate> {
        self.bitrate.as_deref().and_then(Bitrate::from_label)
    }

    /// The receive filters.
    pub fn filter_set(&self) -> FilterSet {
        FilterSet::from_specs(&self.filters)
    }

    /// Applies the filters to a channel.
    pub fn apply_filters(&self, channel: &CanChannel) -> Result<()> {
        channel.set_filter_set(self.filter_set())
    }

    /// Loads the jobs into a periodic sender, numbered from zero.
    pub fn apply_jobs(&self, sender: &PeriodicSender) {
        for (id, spec) in self.jobs.iter().enumerate() {
            let validity = sender.set_job(id, spec.clone());
            if !validity.is_valid() {
                warn!("Periodic job {} is invalid: {:?}", id, validity);
            }
        }
    }

    /// Writes the configuration as TOML text.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).map_err(|err| Error::Config(err.to_string()))
    }
}

impl FromStr for CaptureConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(s).map_err(|err| Error::Config(err.to_string()))?;
        if let Some(label) = &cfg.bitrate {
            if cfg.bitrate().is_none() {
                return Err(Error::Config(format!("unknown bit rate '{}'", label)));
            }
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CFG: &str = r##"
        interface = "vcan0"
        bitrate = "500 kBit/s"
        filters = ["123:7FF", "zz", "#FF"]
        log_file = "out.clf"

        [[jobs]]
        interval = "100"
        identifier = "123"
        dlc = "2"
        data = "de ad"
        active = true

        [[jobs]]
        interval = "0"
    "##;

    #[test]
    fn test_parse_config() {
        let cfg: CaptureConfig = CFG.parse().unwrap();
        assert_eq!(cfg.interface, "vcan0");
        assert_eq!(cfg.bitrate().unwrap().code, 0x001C);
        assert_eq!(cfg.log_file, Some(PathBuf::from("out.clf")));

        let set = cfg.filter_set();
        assert_eq!(set.rules().len(), 1);
        assert_eq!(set.error_mask(), 0xFF);

        assert_eq!(cfg.jobs.len(), 2);
        assert!(cfg.jobs[0].validate().is_valid());
        assert_eq!(cfg.jobs[0].extended, "0");
        assert!(!cfg.jobs[1].validate().interval);
    }

    #[test]
    fn test_defaults() {
        let cfg: CaptureConfig = "".parse().unwrap();
        assert_eq!(cfg, CaptureConfig::default());
        assert_eq!(cfg.interface, DEFAULT_INTERFACE);
        assert!(cfg.filter_set().matches(0x7FF));

        let text = cfg.to_toml().unwrap();
        assert_eq!(text.parse::<CaptureConfig>().unwrap(), cfg);
    }

    #[test]
    fn test_bad_config() {
        assert!(matches!(
            "bitrate = \"3 kBit/s\"".parse::<CaptureConfig>(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            "interface = 5".parse::<CaptureConfig>(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            CaptureConfig::from_file("/nonexistent/cancap.toml"),
            Err(Error::Config(_))
        ));
    }
}
