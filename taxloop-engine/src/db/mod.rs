//! Database operations
//!
//! One module per table. All timestamps are RFC3339 TEXT, ids are UUID TEXT,
//! structured payloads are JSON TEXT columns (see taxloop-common schema).

pub mod assignments;
pub mod batches;
pub mod benchmarks;
pub mod canary_state;
pub mod catalog;
pub mod changes;
pub mod corrections;
pub mod harness_runs;
pub mod proposals;
pub mod runs;

use chrono::{DateTime, Utc};
use taxloop_common::{Error, Result};
use uuid::Uuid;

/// Parse a stored RFC3339 timestamp column.
pub(crate) fn parse_ts(raw: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}

/// Parse a stored UUID column.
pub(crate) fn parse_uuid(raw: &str, column: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| Error::Internal(format!("Failed to parse {}: {}", column, e)))
}
