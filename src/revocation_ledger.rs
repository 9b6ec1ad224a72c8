//! Revocation ledger: the durable set of revoked serial numbers.
//!
//! On disk the ledger is a newline-delimited text file, one decimal serial
//! per line, sorted numerically, each optionally followed by a space and the
//! RFC 3339 UTC time of revocation:
//!
//! ```text
//! 4183209581029384756
//! 90210 2026-03-01T09:30:00Z
//! ```
//!
//! Serials are never removed. A missing file is an empty ledger; a file that
//! exists but does not parse is a fatal error.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};
use tracing::debug;

use crate::error::{LifecycleError, Result};
use crate::serial::Serial;
use crate::storage::{read_optional, write_atomic, Visibility};

/// One revoked serial with the time it was revoked, when known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationEntry {
    pub serial: Serial,
    /// `None` for entries carried over from files without timestamps.
    pub revoked_at: Option<OffsetDateTime>,
}

#[derive(Debug)]
pub struct RevocationLedger {
    path: PathBuf,
    entries: BTreeMap<Serial, Option<OffsetDateTime>>,
}

impl RevocationLedger {
    /// Load the ledger persisted at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = match read_optional(path)? {
            None => BTreeMap::new(),
            Some(bytes) => parse_ledger(path, &bytes)?,
        };
        debug!(path = %path.display(), entries = entries.len(), "Loaded revocation ledger");
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    /// Record `serial` as revoked at `at` and persist the ledger.
    ///
    /// Returns `false` without touching the file when the serial is already
    /// present; its original revocation time is kept.
    pub fn add(&mut self, serial: &Serial, at: OffsetDateTime) -> Result<bool> {
        if self.entries.contains_key(serial) {
            return Ok(false);
        }
        self.entries.insert(serial.clone(), Some(normalize(at)));
        if let Err(e) = self.persist() {
            self.entries.remove(serial);
            return Err(e);
        }
        Ok(true)
    }

    pub fn contains(&self, serial: &Serial) -> bool {
        self.entries.contains_key(serial)
    }

    /// Snapshot of every revoked serial.
    pub fn all(&self) -> BTreeSet<Serial> {
        self.entries.keys().cloned().collect()
    }

    /// Entries in ascending serial order.
    pub fn entries(&self) -> Vec<RevocationEntry> {
        self.entries
            .iter()
            .map(|(serial, revoked_at)| RevocationEntry {
                serial: serial.clone(),
                revoked_at: *revoked_at,
            })
            .collect()
    }

    /// `Some(time)` if `serial` is revoked; the inner option is `None` for
    /// entries without a recorded time.
    pub fn revoked_at(&self, serial: &Serial) -> Option<Option<OffsetDateTime>> {
        self.entries.get(serial).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self) -> Result<()> {
        let mut out = String::new();
        for (serial, revoked_at) in &self.entries {
            out.push_str(&serial.to_decimal()?);
            if let Some(at) = revoked_at {
                out.push(' ');
                out.push_str(&format_timestamp(*at)?);
            }
            out.push('\n');
        }
        write_atomic(&self.path, out.as_bytes(), Visibility::Public)
    }
}

fn normalize(at: OffsetDateTime) -> OffsetDateTime {
    let at = at.to_offset(UtcOffset::UTC);
    at.replace_nanosecond(0).unwrap_or(at)
}

fn format_timestamp(at: OffsetDateTime) -> Result<String> {
    at.format(&Rfc3339)
        .map_err(|e| LifecycleError::Encoding(format!("formatting revocation time: {}", e)))
}

fn parse_ledger(path: &Path, bytes: &[u8]) -> Result<BTreeMap<Serial, Option<OffsetDateTime>>> {
    let corrupt = |line_no: usize, what: &str| {
        LifecycleError::FatalConfig(format!(
            "revocation ledger {} is corrupt at line {}: {}",
            path.display(),
            line_no,
            what
        ))
    };

    let text = std::str::from_utf8(bytes).map_err(|_| corrupt(0, "not valid UTF-8"))?;
    let mut entries = BTreeMap::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let (serial_str, stamp) = match line.split_once(' ') {
            Some((s, t)) => (s, Some(t.trim())),
            None => (line, None),
        };
        let serial: Serial = serial_str
            .parse()
            .map_err(|_| corrupt(idx + 1, "expected a decimal serial number"))?;
        let revoked_at = match stamp {
            Some(t) => Some(
                OffsetDateTime::parse(t, &Rfc3339)
                    .map_err(|_| corrupt(idx + 1, "expected an RFC 3339 timestamp"))?,
            ),
            None => None,
        };
        // a duplicate line keeps the earliest recorded time
        entries
            .entry(serial)
            .and_modify(|existing: &mut Option<OffsetDateTime>| {
                if let (Some(old), Some(new)) = (*existing, revoked_at) {
                    if new < old {
                        *existing = Some(new);
                    }
                }
            })
            .or_insert(revoked_at);
    }
    Ok(entries)
}
