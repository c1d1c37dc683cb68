//! Per-subscription alert throttling.
//!
//! Each subscription carries an interval spec such as `15m`, `2h` or `1d`.
//! An alert may fire when the subscription has never been alerted, or when its
//! most recent alert is not after `now - interval`. Allowed alerts are recorded
//! immediately so the next evaluation sees them.
//!
//! Read, compare and record happen under a lock keyed by subscription id, so
//! two pipelines reporting on the same stream cannot both slip past the gate.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::catalog::Catalog;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
    /// Anything else. Always suppresses.
    Unknown(String),
}

impl IntervalUnit {
    fn from_code(code: &str) -> Self {
        match code {
            "m" => Self::Minutes,
            "h" => Self::Hours,
            "d" => Self::Days,
            other => Self::Unknown(other.to_string()),
        }
    }

    fn seconds(&self) -> Option<i64> {
        match self {
            Self::Minutes => Some(60),
            Self::Hours => Some(60 * 60),
            Self::Days => Some(24 * 60 * 60),
            Self::Unknown(_) => None,
        }
    }
}

/// Parsed `"{magnitude}{unit}"` interval spec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlertInterval {
    pub magnitude: i64,
    pub unit: IntervalUnit,
}

impl AlertInterval {
    /// Parse a spec like `15m`. Never fails: a spec without a leading integer
    /// or with an unrecognised unit yields `IntervalUnit::Unknown`.
    pub fn parse(spec: &str) -> Self {
        let spec = spec.trim();
        let digits_end = spec
            .char_indices()
            .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
            .map(|(i, _)| i)
            .unwrap_or(spec.len());

        let Ok(magnitude) = spec[..digits_end].parse::<i64>() else {
            return Self {
                magnitude: 0,
                unit: IntervalUnit::Unknown(spec.to_string()),
            };
        };

        let code = spec[digits_end..].split_whitespace().next().unwrap_or("");
        Self {
            magnitude,
            unit: IntervalUnit::from_code(code),
        }
    }

    /// Window length in seconds, `None` for unknown units.
    pub fn window_secs(&self) -> Option<i64> {
        self.unit
            .seconds()
            .map(|unit| unit.saturating_mul(self.magnitude))
    }
}

impl fmt::Display for AlertInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.unit {
            IntervalUnit::Minutes => write!(f, "{}m", self.magnitude),
            IntervalUnit::Hours => write!(f, "{}h", self.magnitude),
            IntervalUnit::Days => write!(f, "{}d", self.magnitude),
            IntervalUnit::Unknown(raw) => write!(f, "{}{}", self.magnitude, raw),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrottleDecision {
    Allow,
    Suppress,
}

/// Pure throttle decision. Timestamps are epoch seconds.
///
/// A subscription that was never alerted is always open. Once alerted, an
/// unknown unit keeps it closed.
pub fn decide(interval: &AlertInterval, last_alert: Option<i64>, now: i64) -> ThrottleDecision {
    let Some(prev) = last_alert else {
        return ThrottleDecision::Allow;
    };
    match interval.window_secs() {
        Some(window) if prev <= now.saturating_sub(window) => ThrottleDecision::Allow,
        _ => ThrottleDecision::Suppress,
    }
}

/// Serialised check-then-record gate over the catalog's alert history.
#[derive(Default)]
pub struct AlertThrottle {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl AlertThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscription_lock(&self, subscription_id: i64) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| anyhow!("throttle lock table poisoned"))?;
        Ok(locks.entry(subscription_id).or_default().clone())
    }

    /// Decide for one subscription and record the alert when allowed.
    pub fn evaluate(
        &self,
        catalog: &dyn Catalog,
        subscription_id: i64,
        interval_spec: &str,
        event_id: i64,
        now: i64,
    ) -> Result<ThrottleDecision> {
        let interval = AlertInterval::parse(interval_spec);
        let lock = self.subscription_lock(subscription_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| anyhow!("throttle lock for subscription {} poisoned", subscription_id))?;

        let last = catalog.last_alert_time(subscription_id)?;
        let decision = decide(&interval, last, now);
        if decision == ThrottleDecision::Allow {
            catalog.record_alert(subscription_id, event_id, now)?;
        }
        log::debug!(
            "throttle: subscription {} interval {} last {:?} -> {:?}",
            subscription_id,
            interval,
            last,
            decision
        );
        Ok(decision)
    }
}
