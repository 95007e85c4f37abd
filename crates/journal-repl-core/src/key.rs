//! Journal identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Partitioning strategy of a journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionBy {
    /// Single partition
    None,
    /// One partition per day
    Day,
    /// One partition per month
    Month,
    /// One partition per year
    Year,
    /// Defer to whatever the journal was created with
    #[default]
    Default,
}

impl PartitionBy {
    /// Wire tag for this strategy.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Day => 1,
            Self::Month => 2,
            Self::Year => 3,
            Self::Default => 4,
        }
    }

    /// Parse a wire tag.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::None),
            1 => Some(Self::Day),
            2 => Some(Self::Month),
            3 => Some(Self::Year),
            4 => Some(Self::Default),
            _ => None,
        }
    }
}

/// Identity of a journal on one side of a replication link.
///
/// Remote and local keys of a subscription may differ in location, which lets
/// a subscriber re-root replicated data under a different local path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalKey {
    /// Logical type tag of the journal's records
    pub class: String,
    /// Storage location (defaults to the class tag when absent)
    pub location: Option<String>,
    /// Partitioning strategy
    pub partition_by: PartitionBy,
    /// Expected record count hint, zero when unknown
    pub record_hint: i32,
}

impl JournalKey {
    /// Key for a journal stored at its default location.
    #[must_use]
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            location: None,
            partition_by: PartitionBy::Default,
            record_hint: 0,
        }
    }

    /// Key for a journal stored at an explicit location.
    #[must_use]
    pub fn with_location(class: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            location: Some(location.into()),
            ..Self::new(class)
        }
    }

    /// Set the partitioning strategy and record hint.
    #[must_use]
    pub fn partitioned(mut self, partition_by: PartitionBy, record_hint: i32) -> Self {
        self.partition_by = partition_by;
        self.record_hint = record_hint;
        self
    }

    /// Location the journal actually lives at.
    #[must_use]
    pub fn derived_location(&self) -> &str {
        self.location.as_deref().unwrap_or(&self.class)
    }
}

impl fmt::Display for JournalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.class, self.derived_location())
    }
}
