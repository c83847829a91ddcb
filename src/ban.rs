// zerolink-coordinator
// Copyright (C) 2026  ZeroLink Coordinator contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Anti-Sybil bans. Outpoints whose owners damaged a round are refused
//! re-entry for a while. The store is in-memory; persistence, where wanted,
//! is an external adapter replaying [`BanStore::ban`] calls.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use bitcoin::OutPoint;

/// How badly the owner misbehaved. Stored for operators and future policy;
/// the ban length is currently the same for every level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Severity(pub u8);

impl Severity {
    /// Participated in a round and dropped out after the point of no return.
    pub const DROPPED_MID_ROUND: Severity = Severity(1);
}

#[derive(Debug, Clone, Copy)]
struct BanEntry {
    until: SystemTime,
    severity: Severity,
}

/// Tracks banned outpoints with their expiry. Expired entries are evicted
/// lazily by the lookup that finds them stale.
#[derive(Debug)]
pub struct BanStore {
    duration: Duration,
    entries: Mutex<HashMap<OutPoint, BanEntry>>,
}

impl BanStore {
    pub fn new(duration: Duration) -> Self {
        Self { duration, entries: Mutex::new(HashMap::new()) }
    }

    /// Bans a set of outpoints until `now` plus the configured duration.
    pub fn ban(&self, outpoints: &[OutPoint], severity: Severity, now: SystemTime) {
        let until = now + self.duration;
        let mut entries = lock(&self.entries);
        for outpoint in outpoints {
            log::warn!("banned {} at severity {} until {:?}", outpoint, severity.0, until);
            entries.insert(*outpoint, BanEntry { until, severity });
        }
    }

    /// Returns the minutes left on an active ban, rounded up, or `None` if
    /// the outpoint is not banned. A ban found expired is removed.
    pub fn is_banned(&self, outpoint: &OutPoint, now: SystemTime) -> Option<u64> {
        let mut entries = lock(&self.entries);
        let entry = entries.get(outpoint)?;
        match entry.until.duration_since(now) {
            Ok(left) if !left.is_zero() => Some((left.as_secs() + 59) / 60),
            _ => {
                entries.remove(outpoint);
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn severity_of(&self, outpoint: &OutPoint) -> Option<Severity> {
        lock(&self.entries).get(outpoint).map(|entry| entry.severity)
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
