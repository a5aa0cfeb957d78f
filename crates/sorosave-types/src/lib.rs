//! Shared projection types for the SoroSave group indexer.
//!
//! This crate holds the materialized row types produced by the projection
//! engine (`Group`, `Member`, `Contribution`), the group lifecycle status, and
//! the timestamp normalization used everywhere a ledger or payload time is
//! persisted.
//!
//! Every other crate in the workspace depends on `sorosave-types` for these
//! definitions; it depends on nothing internal itself.

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a savings group.
///
/// Legal transitions are `Forming -> Active -> Completed` and
/// `Forming -> Cancelled`. `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    /// Accepting members; the savings cycle has not started.
    Forming,
    /// Rounds are in progress.
    Active,
    /// All rounds paid out.
    Completed,
    /// Abandoned before the cycle started.
    Cancelled,
}

impl GroupStatus {
    /// Returns the label stored in the `groups.status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forming => "forming",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether moving from `self` to `next` is an edge of the lifecycle.
    ///
    /// Re-applying the current status is allowed so that status handlers stay
    /// idempotent.
    pub fn can_transition_to(self, next: GroupStatus) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Self::Forming, Self::Active)
                | (Self::Active, Self::Completed)
                | (Self::Forming, Self::Cancelled)
        )
    }

    /// `Completed` and `Cancelled` accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl std::fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GroupStatus {
    type Err = ParseGroupStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "forming" => Ok(Self::Forming),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(ParseGroupStatusError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown group status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseGroupStatusError(pub String);

impl std::fmt::Display for ParseGroupStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown group status: {}", self.0)
    }
}

impl std::error::Error for ParseGroupStatusError {}

/// A savings group as materialized from the contract event stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Contract-assigned group identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Free-form description (empty when the contract did not supply one).
    pub description: String,
    /// Address of the group administrator.
    pub admin: String,
    /// Address of the token contract contributions are made in.
    pub token: String,
    /// Amount every member contributes per round.
    pub contribution_amount: i64,
    /// Optional savings target for the whole cycle.
    pub target_amount: Option<i64>,
    /// Length of one round, in seconds.
    pub cycle_length: i64,
    /// Maximum number of members.
    pub max_members: i64,
    /// Round currently being collected.
    pub current_round: i64,
    /// Lifecycle status.
    pub status: GroupStatus,
    /// Number of member rows for this group.
    pub member_count: i64,
    /// Sum of all contributions recorded for this group.
    pub total_saved: i64,
    /// Creation time (RFC 3339, UTC).
    pub created_at: String,
    /// Ledger sequence of the last event applied to this row.
    pub ledger_sequence: i64,
}

/// Membership of one address in one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub group_id: String,
    pub address: String,
    /// Join time (RFC 3339, UTC).
    pub joined_at: String,
    pub is_admin: bool,
    /// Sum of this member's contributions to the group.
    pub total_contributed: i64,
    /// Ledger sequence of the last event applied to this row.
    pub ledger_sequence: i64,
}

/// A single contribution made by a member for a round. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    pub id: String,
    pub group_id: String,
    pub member_address: String,
    pub amount: i64,
    pub round: i64,
    pub ledger_sequence: i64,
    pub timestamp: String,
}

/// Normalizes a timestamp to RFC 3339 UTC with second precision.
///
/// Accepts RFC 3339 strings with any offset, plain integer strings, and JSON
/// numbers. Integers are Unix seconds, or Unix milliseconds when their
/// magnitude reaches [`UNIX_MILLIS_THRESHOLD`]. Anything else, including
/// times outside years 0 to 9999, is rejected with `None`.
///
/// Normalized strings order lexicographically in time order, which is what
/// the `ORDER BY created_at` / `joined_at` queries rely on.
pub fn normalize_timestamp(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => normalize_timestamp_str(s),
        serde_json::Value::Number(n) => n.as_i64().and_then(from_unix),
        _ => None,
    }
}

/// String form of [`normalize_timestamp`].
pub fn normalize_timestamp_str(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if let Ok(secs) = trimmed.parse::<i64>() {
        return from_unix(secs);
    }
    DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .and_then(|dt| format_utc(dt.with_timezone(&Utc)))
}

/// Integers at or above this magnitude are read as milliseconds. As seconds
/// it would be past the year 5000.
pub const UNIX_MILLIS_THRESHOLD: i64 = 100_000_000_000;

fn from_unix(value: i64) -> Option<String> {
    let dt = if value.unsigned_abs() >= UNIX_MILLIS_THRESHOLD as u64 {
        DateTime::<Utc>::from_timestamp_millis(value)
    } else {
        DateTime::<Utc>::from_timestamp(value, 0)
    };
    dt.and_then(format_utc)
}

/// Only four-digit years keep the lexicographic order of the output.
fn format_utc(dt: DateTime<Utc>) -> Option<String> {
    (0..=9999)
        .contains(&dt.year())
        .then(|| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_transitions_follow_lifecycle() {
        use GroupStatus::*;

        assert!(Forming.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(Forming.can_transition_to(Cancelled));

        // Re-applying the same status is allowed.
        assert!(Active.can_transition_to(Active));

        assert!(!Forming.can_transition_to(Completed));
        assert!(!Active.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Cancelled.can_transition_to(Forming));
    }

    #[test]
    fn terminal_statuses_accept_only_themselves() {
        use GroupStatus::*;

        for status in [Forming, Active, Completed, Cancelled] {
            let terminal = matches!(status, Completed | Cancelled);
            assert_eq!(status.is_terminal(), terminal);
            if terminal {
                for next in [Forming, Active, Completed, Cancelled] {
                    assert_eq!(status.can_transition_to(next), next == status);
                }
            }
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            GroupStatus::Forming,
            GroupStatus::Active,
            GroupStatus::Completed,
            GroupStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<GroupStatus>(), Ok(status));
        }
        assert_eq!("ACTIVE".parse::<GroupStatus>(), Ok(GroupStatus::Active));
        assert!("paused".parse::<GroupStatus>().is_err());
    }

    #[test]
    fn timestamps_normalize_to_utc_seconds() {
        assert_eq!(
            normalize_timestamp(&json!("2024-03-01T12:00:00+02:00")).as_deref(),
            Some("2024-03-01T10:00:00Z")
        );
        assert_eq!(
            normalize_timestamp(&json!(1_700_000_000)).as_deref(),
            Some("2023-11-14T22:13:20Z")
        );
        assert_eq!(
            normalize_timestamp(&json!("1700000000")).as_deref(),
            Some("2023-11-14T22:13:20Z")
        );
        assert_eq!(
            normalize_timestamp(&json!(1_700_000_000_000i64)).as_deref(),
            Some("2023-11-14T22:13:20Z"),
            "millisecond values are recognized"
        );
        assert_eq!(normalize_timestamp(&json!(i64::MAX)), None);
        assert_eq!(normalize_timestamp(&json!("yesterday")), None);
        assert_eq!(normalize_timestamp(&json!(null)), None);
    }
}
