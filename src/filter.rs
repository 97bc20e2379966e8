// cancapture/src/filter.rs
//
// Implements textual CAN filter specs and the kernel filter set.
//
// This file is part of the Rust 'cancapture' library.
//
// Licensed under the MIT license:
//   <LICENSE or http://opensource.org/licenses/MIT>
// This file may not be copied, modified, or distributed except according
// to those terms.

//! CAN receive filters.
//!
//! A capture is configured with up to [`MAX_FILTER_RULES`] textual filter
//! slots. Each slot is one of:
//!
//! - `ID:MASK` - accept frames where `received & MASK == ID & MASK`
//! - `ID~MASK` - the same rule, inverted
//! - `#MASK`   - the error class mask for error frames
//!
//! All numbers are hexadecimal, with an optional `0x` prefix. An empty slot
//! is ignored. A slot that doesn't parse is skipped with a warning and the
//! others still apply.
//!
//! Filtering is done by the kernel. See
//! <https://docs.kernel.org/networking/can.html#raw-protocol-sockets-with-can-filters-sock-raw>

use crate::{Error, Result};
use libc::{canid_t, CAN_ERR_FLAG, CAN_INV_FILTER};
use log::{debug, warn};
use std::{fmt, str::FromStr};

/// The number of filter slots a channel accepts.
pub const MAX_FILTER_RULES: usize = 4;

/// A single identifier/mask acceptance rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterRule {
    /// The identifier to compare against
    pub id: canid_t,
    /// The bits of the identifier that are compared
    pub mask: canid_t,
    /// Accept frames that do *not* match
    pub invert: bool,
}

impl FilterRule {
    /// Creates a positive match rule.
    pub fn new(id: canid_t, mask: canid_t) -> Self {
        Self {
            id,
            mask,
            invert: false,
        }
    }

    /// Creates an inverted rule.
    pub fn new_inverted(id: canid_t, mask: canid_t) -> Self {
        Self {
            id,
            mask,
            invert: true,
        }
    }

    /// The mask as installed in the kernel.
    ///
    /// The error flag is never part of a rule mask; error frames are
    /// selected by the error mask only.
    pub fn kernel_mask(&self) -> canid_t {
        self.mask & !CAN_ERR_FLAG
    }

    /// Determines if the rule accepts a frame, given the composite ID word
    /// of the frame (identifier plus EFF/RTR flags).
    pub fn matches(&self, id_word: canid_t) -> bool {
        let mask = self.kernel_mask();
        ((id_word & mask) == (self.id & mask)) != self.invert
    }

    /// Converts the rule to the kernel representation.
    pub fn to_kernel(&self) -> CanFilter {
        if self.invert {
            CanFilter::new_inverted(self.id, self.kernel_mask())
        } else {
            CanFilter::new(self.id, self.kernel_mask())
        }
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let sep = if self.invert { '~' } else { ':' };
        write!(f, "{:X}{}{:X}", self.id, sep, self.mask)
    }
}

/// One parsed filter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSpec {
    /// An identifier rule, `ID:MASK` or `ID~MASK`
    Rule(FilterRule),
    /// The error class mask, `#MASK`
    ErrorMask(u32),
}

impl FilterSpec {
    /// Parses a textual filter slot.
    ///
    /// Returns `Ok(None)` for an empty (or blank) slot.
    pub fn parse(spec: &str) -> Result<Option<Self>> {
        let s = spec.trim();
        if s.is_empty() {
            return Ok(None);
        }

        let err = || Error::FilterParse {
            spec: spec.to_string(),
        };

        let parsed = if let Some((id, mask)) = s.split_once(':') {
            FilterSpec::Rule(FilterRule::new(
                parse_hex(id).ok_or_else(err)?,
                parse_hex(mask).ok_or_else(err)?,
            ))
        } else if let Some((id, mask)) = s.split_once('~') {
            FilterSpec::Rule(FilterRule::new_inverted(
                parse_hex(id).ok_or_else(err)?,
                parse_hex(mask).ok_or_else(err)?,
            ))
        } else if let Some(mask) = s.strip_prefix('#') {
            FilterSpec::ErrorMask(parse_hex(mask).ok_or_else(err)?)
        } else {
            return Err(err());
        };
        Ok(Some(parsed))
    }
}

impl FromStr for FilterSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)?.ok_or_else(|| Error::FilterParse {
            spec: s.to_string(),
        })
    }
}

impl fmt::Display for FilterSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FilterSpec::Rule(rule) => rule.fmt(f),
            FilterSpec::ErrorMask(mask) => write!(f, "#{:08X}", mask),
        }
    }
}

/// Parses a hex number with an optional `0x` prefix.
fn parse_hex(s: &str) -> Option<u32> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if s.is_empty() {
        return None;
    }
    u32::from_str_radix(s, 16).ok()
}

/// The complete set of receive filters for a channel.
///
/// With no rules every frame is accepted. With a zero error mask no error
/// frames are reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    rules: Vec<FilterRule>,
    error_mask: u32,
}

impl FilterSet {
    /// Creates an accept-all filter set that reports no errors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a filter set from textual slots.
    ///
    /// Each slot is parsed on its own. Bad slots are logged and skipped, as
    /// is anything past the first [`MAX_FILTER_RULES`] slots. If more than
    /// one error mask is given, the last one wins.
    pub fn from_specs<S: AsRef<str>>(specs: &[S]) -> Self {
        if specs.len() > MAX_FILTER_RULES {
            warn!(
                "Only {} CAN filters are supported; ignoring {} more",
                MAX_FILTER_RULES,
                specs.len() - MAX_FILTER_RULES
            );
        }

        let mut set = Self::new();
        for (i, spec) in specs.iter().take(MAX_FILTER_RULES).enumerate() {
            match FilterSpec::parse(spec.as_ref()) {
                Ok(Some(FilterSpec::Rule(rule))) => set.rules.push(rule),
                Ok(Some(FilterSpec::ErrorMask(mask))) => set.error_mask = mask,
                Ok(None) => (),
                Err(err) => warn!("Skipping CAN filter {}: {}", i, err),
            }
        }
        debug!(
            "Got {} ID filters and error mask {:#X}",
            set.rules.len(),
            set.error_mask
        );
        set
    }

    /// Adds a rule, if there is room for it.
    pub fn push(&mut self, rule: FilterRule) -> bool {
        if self.rules.len() < MAX_FILTER_RULES {
            self.rules.push(rule);
            true
        } else {
            false
        }
    }

    /// Sets the error class mask.
    pub fn set_error_mask(&mut self, mask: u32) {
        self.error_mask = mask;
    }

    /// The identifier rules.
    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    /// The error class mask.
    pub fn error_mask(&self) -> u32 {
        self.error_mask
    }

    /// Determines if the set accepts every data frame.
    pub fn is_accept_all(&self) -> bool {
        self.rules.is_empty()
    }

    /// Determines if a frame with the given ID word passes the rules.
    pub fn matches(&self, id_word: canid_t) -> bool {
        self.is_accept_all() || self.rules.iter().any(|r| r.matches(id_word))
    }

    /// The filters to install in the kernel.
    ///
    /// An empty rule list becomes a single accept-all `(0, 0)` filter.
    pub fn kernel_filters(&self) -> Vec<CanFilter> {
        if self.rules.is_empty() {
            vec![CanFilter::new(0, 0)]
        } else {
            self.rules.iter().map(FilterRule::to_kernel).collect()
        }
    }
}

// ===== CanFilter =====

/// The CAN filter defines which ID's can be accepted on a socket.
///
/// Each filter contains an internal id and mask. Packets are considered to
/// be matched by a filter if `received_id & mask == filter_id & mask` holds
/// true.
///
/// This is binary compatible with the kernel's `can_filter` struct.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
pub struct CanFilter(libc::can_filter);

impl CanFilter {
    /// Construct a new CAN filter.
    pub fn new(id: canid_t, mask: canid_t) -> Self {
        Self(libc::can_filter {
            can_id: id,
            can_mask: mask,
        })
    }

    /// Construct a new inverted CAN filter.
    pub fn new_inverted(id: canid_t, mask: canid_t) -> Self {
        Self::new(id | CAN_INV_FILTER, mask)
    }

    /// The filter ID, possibly including the inversion flag
    pub fn id(&self) -> canid_t {
        self.0.can_id
    }

    /// The filter mask
    pub fn mask(&self) -> canid_t {
        self.0.can_mask
    }

    /// Determines if this is an inverted filter
    pub fn is_inverted(&self) -> bool {
        self.0.can_id & CAN_INV_FILTER != 0
    }
}

impl From<libc::can_filter> for CanFilter {
    fn from(filt: libc::can_filter) -> Self {
        Self(filt)
    }
}

impl From<(u32, u32)> for CanFilter {
    fn from(filt: (u32, u32)) -> Self {
        CanFilter::new(filt.0, filt.1)
    }
}

impl From<FilterRule> for CanFilter {
    fn from(rule: FilterRule) -> Self {
        rule.to_kernel()
    }
}

impl AsRef<libc::can_filter> for CanFilter {
    fn as_ref(&self) -> &libc::can_filter {
        &self.0
    }
}

/////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use libc::{CAN_EFF_FLAG, CAN_RTR_FLAG};

    #[test]
    fn test_parse_rules() {
        assert_eq!(
            FilterSpec::parse("123:7FF").unwrap(),
            Some(FilterSpec::Rule(FilterRule::new(0x123, 0x7FF)))
        );
        assert_eq!(
            FilterSpec::parse("400~700").unwrap(),
            Some(FilterSpec::Rule(FilterRule::new_inverted(0x400, 0x700)))
        );
        assert_eq!(
            FilterSpec::parse("#000000FF").unwrap(),
            Some(FilterSpec::ErrorMask(0xFF))
        );
        assert_eq!(
            FilterSpec::parse(" 0x1F:0x7f0 ").unwrap(),
            Some(FilterSpec::Rule(FilterRule::new(0x1F, 0x7F0)))
        );
    }

    #[test]
    fn test_parse_empty_and_bad() {
        assert_eq!(FilterSpec::parse("").unwrap(), None);
        assert_eq!(FilterSpec::parse("   ").unwrap(), None);

        for bad in ["zz", "123", "12:", ":7FF", "#", "#xyz", "1:2:3", "123456789:0"] {
            match FilterSpec::parse(bad) {
                Err(Error::FilterParse { spec }) => assert_eq!(spec, bad),
                other => panic!("'{}' parsed as {:?}", bad, other),
            }
        }
        assert!("".parse::<FilterSpec>().is_err());
    }

    #[test]
    fn test_filter_set_skips_bad_slots() {
        let set = FilterSet::from_specs(&["123:7FF", "zz", "", "400~700"]);
        assert_eq!(
            set.rules(),
            &[
                FilterRule::new(0x123, 0x7FF),
                FilterRule::new_inverted(0x400, 0x700)
            ]
        );
        assert_eq!(set.error_mask(), 0);

        let set = FilterSet::from_specs(&["#4", "zz", "", ""]);
        assert!(set.is_accept_all());
        assert_eq!(set.error_mask(), 0x4);
    }

    #[test]
    fn test_filter_set_extra_slots() {
        let set = FilterSet::from_specs(&["1:7FF", "2:7FF", "3:7FF", "4:7FF", "5:7FF"]);
        assert_eq!(set.rules().len(), MAX_FILTER_RULES);
        assert!(!set.matches(0x5));
        assert!(set.matches(0x4));

        let mut set = set;
        assert!(!set.push(FilterRule::new(6, 0x7FF)));
    }

    #[test]
    fn test_rule_matches() {
        let rule = FilterRule::new(0x123, 0x7FF);
        assert!(rule.matches(0x123));
        assert!(!rule.matches(0x124));
        // The EFF flag is not in the mask, so an extended 0x123 matches too
        assert!(rule.matches(0x123 | CAN_EFF_FLAG));

        let rule = FilterRule::new(0x123, 0x7FF | CAN_EFF_FLAG | CAN_RTR_FLAG);
        assert!(rule.matches(0x123));
        assert!(!rule.matches(0x123 | CAN_EFF_FLAG));
        assert!(!rule.matches(0x123 | CAN_RTR_FLAG));

        let rule = FilterRule::new_inverted(0x400, 0x700);
        assert!(!rule.matches(0x400));
        assert!(!rule.matches(0x4FF));
        assert!(rule.matches(0x500));
        assert!(rule.matches(0x0));
    }

    #[test]
    fn test_kernel_filters() {
        let set = FilterSet::new();
        assert_eq!(set.kernel_filters(), vec![CanFilter::new(0, 0)]);
        assert!(set.matches(0x7FF));

        let set = FilterSet::from_specs(&["400~700", "123:FFFFFFFF"]);
        let filters = set.kernel_filters();
        assert_eq!(filters.len(), 2);

        assert!(filters[0].is_inverted());
        assert_eq!(filters[0].id(), 0x400 | CAN_INV_FILTER);
        assert_eq!(filters[0].mask(), 0x700);

        assert!(!filters[1].is_inverted());
        assert_eq!(filters[1].mask(), !CAN_ERR_FLAG);
    }

    #[test]
    fn test_display() {
        assert_eq!(FilterRule::new(0x123, 0x7FF).to_string(), "123:7FF");
        assert_eq!(FilterRule::new_inverted(0x400, 0x700).to_string(), "400~700");
        assert_eq!(FilterSpec::ErrorMask(0xFF).to_string(), "#000000FF");

        let spec: FilterSpec = "400~700".parse().unwrap();
        assert_eq!(spec.to_string().parse::<FilterSpec>().unwrap(), spec);
    }
}
