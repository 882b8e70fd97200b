//! Per-outlet daily energy accounting derived from lifetime counters.
//! Today's and yesterday's usage are computed from counter snapshots taken at
//! the first reading of each local day.

use crate::error::Result;
use crate::store::{PendingWrite, write_atomic};
use chrono::NaiveDate;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct CounterSnapshot {
    day: NaiveDate,
    last_kwh: f64,
    today_start_kwh: f64,
    yesterday_start_kwh: Option<f64>,
    yesterday_end_kwh: Option<f64>,
}

/// Derived usage for one outlet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyUsage {
    pub total_kwh: f64,
    pub today_kwh: f64,
    pub yesterday_kwh: Option<f64>,
}

#[derive(Debug, Default)]
pub struct EnergyTracker {
    outlets: BTreeMap<usize, CounterSnapshot>,
    path: Option<PathBuf>,
    dirty: bool,
}

impl EnergyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker backed by a JSON file. A missing or unreadable file starts empty.
    pub fn with_state_file<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let outlets = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(outlets) => {
                    debug!("Loaded energy state from {}", path.display());
                    outlets
                }
                Err(e) => {
                    warn!("Ignoring corrupt energy state {}: {}", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            outlets,
            path: Some(path),
            dirty: false,
        }
    }

    pub fn state_file(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Feeds one lifetime counter reading taken on `day`.
    pub fn update_at(&mut self, index: usize, total_kwh: f64, day: NaiveDate) -> EnergyUsage {
        let previous = self.outlets.get(&index).copied();
        let snapshot = self.outlets.entry(index).or_insert(CounterSnapshot {
            day,
            last_kwh: total_kwh,
            today_start_kwh: total_kwh,
            yesterday_start_kwh: None,
            yesterday_end_kwh: None,
        });

        if day > snapshot.day {
            let consecutive = snapshot.day.succ_opt() == Some(day);
            info!(
                "Energy day rollover for outlet {}: {} -> {}",
                index, snapshot.day, day
            );
            if consecutive {
                snapshot.yesterday_start_kwh = Some(snapshot.today_start_kwh);
                snapshot.yesterday_end_kwh = Some(snapshot.last_kwh);
            } else {
                snapshot.yesterday_start_kwh = None;
                snapshot.yesterday_end_kwh = None;
            }
            snapshot.day = day;
            snapshot.today_start_kwh = snapshot.last_kwh;
        }

        if total_kwh < snapshot.today_start_kwh {
            // Counter was reset on the device
            warn!(
                "Energy counter of outlet {} went backwards ({} < {})",
                index, total_kwh, snapshot.today_start_kwh
            );
            snapshot.today_start_kwh = total_kwh;
        }
        snapshot.last_kwh = total_kwh;
        self.dirty |= previous != Some(*snapshot);

        let yesterday_kwh = match (snapshot.yesterday_start_kwh, snapshot.yesterday_end_kwh) {
            (Some(start), Some(end)) => Some(round3((end - start).max(0.0))),
            _ => None,
        };
        EnergyUsage {
            total_kwh,
            today_kwh: round3((total_kwh - snapshot.today_start_kwh).max(0.0)),
            yesterday_kwh,
        }
    }

    pub fn forget(&mut self, index: usize) {
        self.dirty |= self.outlets.remove(&index).is_some();
    }

    pub fn is_empty(&self) -> bool {
        self.outlets.is_empty()
    }

    /// Writes the state file, if one is configured.
    pub fn save(&mut self) -> Result<()> {
        if let Some(path) = &self.path {
            write_atomic(path, &serde_json::to_string_pretty(&self.outlets)?)?;
        }
        self.dirty = false;
        Ok(())
    }

    /// Serialized counters if they changed since the last flush and a file is configured.
    pub fn take_pending(&mut self) -> Option<PendingWrite> {
        let path = self.path.as_ref()?;
        if !self.dirty {
            return None;
        }
        match serde_json::to_string_pretty(&self.outlets) {
            Ok(contents) => {
                self.dirty = false;
                Some(PendingWrite::new(path.clone(), contents))
            }
            Err(e) => {
                warn!("Could not serialize energy state: {}", e);
                None
            }
        }
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn first_reading_starts_at_zero() {
        let mut tracker = EnergyTracker::new();
        let usage = tracker.update_at(1, 120.5, day(1));
        assert_eq!(usage.today_kwh, 0.0);
        assert_eq!(usage.yesterday_kwh, None);

        let usage = tracker.update_at(1, 121.75, day(1));
        assert_eq!(usage.today_kwh, 1.25);
    }

    #[test]
    fn midnight_rollover_moves_today_to_yesterday() {
        let mut tracker = EnergyTracker::new();
        tracker.update_at(3, 10.0, day(1));
        tracker.update_at(3, 12.5, day(1));

        let usage = tracker.update_at(3, 13.0, day(2));
        assert_eq!(usage.yesterday_kwh, Some(2.5));
        assert_eq!(usage.today_kwh, 0.5);
    }

    #[test]
    fn gap_of_several_days_drops_yesterday() {
        let mut tracker = EnergyTracker::new();
        tracker.update_at(1, 10.0, day(1));
        tracker.update_at(1, 11.0, day(1));
        let usage = tracker.update_at(1, 20.0, day(4));
        assert_eq!(usage.yesterday_kwh, None);
        assert_eq!(usage.today_kwh, 9.0);
    }

    #[test]
    fn counter_reset_never_goes_negative() {
        let mut tracker = EnergyTracker::new();
        tracker.update_at(1, 50.0, day(1));
        let usage = tracker.update_at(1, 0.2, day(1));
        assert_eq!(usage.today_kwh, 0.0);
        let usage = tracker.update_at(1, 0.7, day(1));
        assert_eq!(usage.today_kwh, 0.5);
    }

    #[test]
    fn outlets_are_independent() {
        let mut tracker = EnergyTracker::new();
        tracker.update_at(1, 1.0, day(1));
        tracker.update_at(2, 100.0, day(1));
        assert_eq!(tracker.update_at(1, 2.0, day(1)).today_kwh, 1.0);
        assert_eq!(tracker.update_at(2, 100.0, day(1)).today_kwh, 0.0);
        tracker.forget(2);
        assert_eq!(tracker.update_at(2, 150.0, day(1)).today_kwh, 0.0);
    }
}
