//! Collection identity: which remote dataset a snapshot was built from.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::CatalogError;

/// Inclusive date range used to filter granules by acquisition time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalRange {
    /// First day of the range.
    pub start: NaiveDate,
    /// Last day of the range (inclusive).
    pub end: NaiveDate,
}

impl TemporalRange {
    /// Formats the range as a CMR `temporal` query value.
    #[must_use]
    pub fn to_cmr_param(&self) -> String {
        format!(
            "{}T00:00:00Z,{}T23:59:59Z",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}

impl fmt::Display for TemporalRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{}",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}

impl FromStr for TemporalRange {
    type Err = CatalogError;

    /// Parses `YYYY-MM-DD,YYYY-MM-DD`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CatalogError::InvalidTemporal {
            value: s.to_string(),
        };
        let (start, end) = s.split_once(',').ok_or_else(invalid)?;
        let start = NaiveDate::parse_from_str(start.trim(), "%Y-%m-%d").map_err(|_| invalid())?;
        let end = NaiveDate::parse_from_str(end.trim(), "%Y-%m-%d").map_err(|_| invalid())?;
        if end < start {
            return Err(invalid());
        }
        Ok(Self { start, end })
    }
}

/// Identifies one logical catalog snapshot.
///
/// Two keys with the same fields always produce the same
/// [`fingerprint`](Self::fingerprint), which is stored in the snapshot so an
/// existing snapshot can be matched to a new request without re-querying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionKey {
    /// Collection short name, e.g. `GEDI02_B`.
    pub shortname: String,
    /// Collection version, e.g. `002`.
    pub version: String,
    /// Optional acquisition-time filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporal: Option<TemporalRange>,
    /// Optional cap on the number of granules catalogued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl CollectionKey {
    /// Creates a key without temporal filter or limit.
    #[must_use]
    pub fn new(shortname: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            shortname: shortname.into(),
            version: version.into(),
            temporal: None,
            limit: None,
        }
    }

    /// Sets the temporal filter.
    #[must_use]
    pub fn with_temporal(mut self, temporal: Option<TemporalRange>) -> Self {
        self.temporal = temporal;
        self
    }

    /// Sets the granule limit.
    #[must_use]
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Stable hex digest of every field of the key.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let temporal = self.temporal.map(|t| t.to_string()).unwrap_or_default();
        let limit = self.limit.map(|l| l.to_string()).unwrap_or_default();
        let canonical = format!(
            "shortname={}\nversion={}\ntemporal={temporal}\nlimit={limit}",
            self.shortname, self.version
        );
        format!("{:x}", Sha256::digest(canonical.as_bytes()))
    }

    /// Filesystem-safe prefix shared by every state file of this collection.
    #[must_use]
    pub fn file_stem(&self) -> String {
        let safe = |value: &str| -> String {
            value
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                        c
                    } else {
                        '_'
                    }
                })
                .collect()
        };
        format!("{}_v{}", safe(&self.shortname), safe(&self.version))
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.shortname, self.version)?;
        if let Some(temporal) = &self.temporal {
            write!(f, " [{temporal}]")?;
        }
        if let Some(limit) = self.limit {
            write!(f, " (limit {limit})")?;
        }
        Ok(())
    }
}
