//! Persisted per-day usage ledger.
//!
//! File shape (`<runs_dir>/usage.json`):
//!
//! ```text
//! {"days": {"2026-10-16": {"tokens": 1234, "cost_usd": 0.01, "calls": 3}}}
//! ```
//!
//! Writes go through a sibling temp file and a rename so a crash mid-write
//! never leaves a truncated ledger behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Usage totals for one calendar day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DayUsage {
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub calls: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageLedger {
    #[serde(default)]
    pub days: BTreeMap<String, DayUsage>,
}

impl UsageLedger {
    /// Key format for a day entry.
    pub fn day_key(date: NaiveDate) -> String {
        date.format("%Y-%m-%d").to_string()
    }

    /// Load a ledger. A missing or empty file is an empty ledger.
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(LedgerError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&text).map_err(|source| LedgerError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), LedgerError> {
        let io_err = |source: std::io::Error| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let body = serde_json::to_string_pretty(self).map_err(|source| LedgerError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    pub fn day(&self, date: NaiveDate) -> Option<DayUsage> {
        self.days.get(&Self::day_key(date)).copied()
    }

    pub fn set_day(&mut self, date: NaiveDate, usage: DayUsage) {
        self.days.insert(Self::day_key(date), usage);
    }

    /// Day entries newest first, optionally limited to the most recent `limit`.
    pub fn recent(&self, limit: Option<usize>) -> Vec<(String, DayUsage)> {
        let iter = self.days.iter().rev().map(|(k, v)| (k.clone(), *v));
        match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = UsageLedger::load(&dir.path().join("usage.json")).unwrap();
        assert!(ledger.days.is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("usage.json");
        let mut ledger = UsageLedger::default();
        ledger.set_day(
            day(2026, 10, 16),
            DayUsage {
                tokens: 500,
                cost_usd: 0.25,
                calls: 2,
            },
        );
        ledger.save(&path).unwrap();

        let loaded = UsageLedger::load(&path).unwrap();
        assert_eq!(loaded, ledger);
        assert_eq!(loaded.day(day(2026, 10, 16)).unwrap().calls, 2);
        assert!(loaded.day(day(2026, 10, 15)).is_none());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            UsageLedger::load(&path),
            Err(LedgerError::Parse { .. })
        ));
    }

    #[test]
    fn test_recent_orders_newest_first() {
        let mut ledger = UsageLedger::default();
        ledger.set_day(day(2026, 10, 14), DayUsage::default());
        ledger.set_day(day(2026, 10, 16), DayUsage::default());
        ledger.set_day(day(2026, 10, 15), DayUsage::default());
        let recent = ledger.recent(Some(2));
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].0, "2026-10-16");
        assert_eq!(recent[1].0, "2026-10-15");
        assert_eq!(ledger.recent(None).len(), 3);
    }
}
