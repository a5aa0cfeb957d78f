//! Raw ledger events and their typed decoding.
//!
//! A [`RawEvent`] is exactly what the event source delivered: an id, a type
//! tag, an optional group reference, an untyped JSON payload, the ledger
//! sequence, and a timestamp. Projection never looks at the raw payload
//! directly; it goes through [`ContractEvent::decode`], which validates the
//! payload against the schema of its type and returns `Ok(None)` for types
//! the indexer does not model.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sorosave_types::{normalize_timestamp, normalize_timestamp_str};

use crate::error::DecodeError;

/// Contract event types the projection engine handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    GroupCreated,
    MemberJoined,
    ContributionMade,
    GroupStarted,
    GroupCompleted,
    GroupCancelled,
}

impl EventKind {
    /// Returns the type tag as it appears on the wire and in `events.type`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GroupCreated => "group_created",
            Self::MemberJoined => "member_joined",
            Self::ContributionMade => "contribution_made",
            Self::GroupStarted => "group_started",
            Self::GroupCompleted => "group_completed",
            Self::GroupCancelled => "group_cancelled",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = ParseEventKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "group_created" => Ok(Self::GroupCreated),
            "member_joined" => Ok(Self::MemberJoined),
            "contribution_made" => Ok(Self::ContributionMade),
            "group_started" => Ok(Self::GroupStarted),
            "group_completed" => Ok(Self::GroupCompleted),
            "group_cancelled" => Ok(Self::GroupCancelled),
            _ => Err(ParseEventKindError(s.to_string())),
        }
    }
}

/// Error returned when parsing an event type the indexer does not model.
#[derive(Debug, Clone)]
pub struct ParseEventKindError(pub String);

impl std::fmt::Display for ParseEventKindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown event type: {}", self.0)
    }
}

impl std::error::Error for ParseEventKindError {}

/// An event exactly as delivered by the event source. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Globally unique event id assigned by the ledger.
    pub id: String,
    /// Event type tag, e.g. `group_created`. Unknown tags are kept verbatim.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Group the event refers to, when the source exposes it separately.
    #[serde(default)]
    pub group_id: Option<String>,
    /// Untyped event body.
    #[serde(default)]
    pub payload: Value,
    /// Ledger the event was emitted in.
    pub ledger_sequence: i64,
    /// Ledger close time as reported by the source.
    pub timestamp: String,
}

impl RawEvent {
    /// The group this event refers to: the explicit `group_id` if present,
    /// otherwise the payload's `group_id` field.
    pub fn group_ref(&self) -> Option<String> {
        self.group_id
            .clone()
            .or_else(|| self.payload.get("group_id").and_then(id_from_value))
    }

    /// The event's type, if it is one the indexer models.
    pub fn kind(&self) -> Option<EventKind> {
        self.event_type.parse().ok()
    }
}

/// A `group_created` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupCreated {
    pub group_id: String,
    pub name: String,
    pub description: String,
    pub admin: String,
    pub token: String,
    pub contribution_amount: i64,
    pub target_amount: Option<i64>,
    pub cycle_length: i64,
    pub max_members: i64,
    pub current_round: i64,
    /// RFC 3339; falls back to the event timestamp.
    pub created_at: String,
}

/// A `member_joined` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberJoined {
    pub group_id: String,
    pub member_address: String,
    /// RFC 3339; falls back to the event timestamp.
    pub joined_at: String,
    pub is_admin: bool,
}

/// A `contribution_made` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContributionMade {
    pub contribution_id: String,
    pub group_id: String,
    pub member_address: String,
    pub amount: i64,
    pub round: i64,
}

/// Tagged union over every event type the projection engine handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContractEvent {
    GroupCreated(GroupCreated),
    MemberJoined(MemberJoined),
    ContributionMade(ContributionMade),
    GroupStarted { group_id: String },
    GroupCompleted { group_id: String },
    GroupCancelled { group_id: String },
}

impl ContractEvent {
    /// Decodes a raw event into its typed form.
    ///
    /// Returns `Ok(None)` for event types the indexer does not model; those
    /// are kept in the event log for audit only.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] when the type is known but the payload is
    /// missing required fields or has values of the wrong shape.
    pub fn decode(raw: &RawEvent) -> Result<Option<Self>, DecodeError> {
        let Some(kind) = raw.kind() else {
            return Ok(None);
        };

        let fail = |reason: String| DecodeError {
            event_id: raw.id.clone(),
            event_type: raw.event_type.clone(),
            reason,
        };
        // Same precedence as the log's group column: envelope, then payload.
        let group_id = || {
            raw.group_ref()
                .ok_or_else(|| fail("missing group_id".to_string()))
        };
        let event_time = || {
            normalize_timestamp_str(&raw.timestamp).unwrap_or_else(|| raw.timestamp.clone())
        };

        let decoded = match kind {
            EventKind::GroupCreated => {
                let p: GroupCreatedPayload = parse_payload(raw).map_err(fail)?;
                ContractEvent::GroupCreated(GroupCreated {
                    group_id: group_id()?,
                    name: p.name,
                    description: p.description,
                    admin: p.admin,
                    token: p.token,
                    contribution_amount: p.contribution_amount,
                    target_amount: p.target_amount,
                    cycle_length: p.cycle_length,
                    max_members: p.max_members,
                    current_round: p.current_round,
                    created_at: p.created_at.unwrap_or_else(event_time),
                })
            }
            EventKind::MemberJoined => {
                let p: MemberJoinedPayload = parse_payload(raw).map_err(fail)?;
                ContractEvent::MemberJoined(MemberJoined {
                    group_id: group_id()?,
                    member_address: p.member_address,
                    joined_at: p.joined_at.unwrap_or_else(event_time),
                    is_admin: p.is_admin,
                })
            }
            EventKind::ContributionMade => {
                let p: ContributionMadePayload = parse_payload(raw).map_err(fail)?;
                ContractEvent::ContributionMade(ContributionMade {
                    contribution_id: p.contribution_id,
                    group_id: group_id()?,
                    member_address: p.member_address,
                    amount: p.amount,
                    round: p.round,
                })
            }
            EventKind::GroupStarted => ContractEvent::GroupStarted {
                group_id: group_id()?,
            },
            EventKind::GroupCompleted => ContractEvent::GroupCompleted {
                group_id: group_id()?,
            },
            EventKind::GroupCancelled => ContractEvent::GroupCancelled {
                group_id: group_id()?,
            },
        };

        Ok(Some(decoded))
    }

    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::GroupCreated(_) => EventKind::GroupCreated,
            Self::MemberJoined(_) => EventKind::MemberJoined,
            Self::ContributionMade(_) => EventKind::ContributionMade,
            Self::GroupStarted { .. } => EventKind::GroupStarted,
            Self::GroupCompleted { .. } => EventKind::GroupCompleted,
            Self::GroupCancelled { .. } => EventKind::GroupCancelled,
        }
    }

    /// The group this event mutates.
    pub fn group_id(&self) -> &str {
        match self {
            Self::GroupCreated(e) => &e.group_id,
            Self::MemberJoined(e) => &e.group_id,
            Self::ContributionMade(e) => &e.group_id,
            Self::GroupStarted { group_id }
            | Self::GroupCompleted { group_id }
            | Self::GroupCancelled { group_id } => group_id,
        }
    }
}

fn parse_payload<T: for<'de> Deserialize<'de>>(raw: &RawEvent) -> Result<T, String> {
    T::deserialize(&raw.payload).map_err(|e| e.to_string())
}

// ── Wire payload schemas ─────────────────────────────────────────────
//
// Field aliases cover the names used by the contract itself (`creator`,
// `contribution_period`, `member`) next to the indexer's names.

#[derive(Deserialize)]
struct GroupCreatedPayload {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(alias = "creator")]
    admin: String,
    token: String,
    #[serde(deserialize_with = "amount")]
    contribution_amount: i64,
    #[serde(default, deserialize_with = "opt_amount")]
    target_amount: Option<i64>,
    #[serde(alias = "contribution_period", deserialize_with = "amount")]
    cycle_length: i64,
    #[serde(deserialize_with = "amount")]
    max_members: i64,
    #[serde(default, deserialize_with = "amount")]
    current_round: i64,
    #[serde(default, deserialize_with = "opt_timestamp")]
    created_at: Option<String>,
}

#[derive(Deserialize)]
struct MemberJoinedPayload {
    #[serde(alias = "member", alias = "address")]
    member_address: String,
    #[serde(default, deserialize_with = "opt_timestamp")]
    joined_at: Option<String>,
    #[serde(default)]
    is_admin: bool,
}

#[derive(Deserialize)]
struct ContributionMadePayload {
    #[serde(alias = "id", deserialize_with = "id")]
    contribution_id: String,
    #[serde(alias = "member")]
    member_address: String,
    #[serde(deserialize_with = "amount")]
    amount: i64,
    #[serde(deserialize_with = "amount")]
    round: i64,
}

/// Contract ids are `u64` on chain and arrive as either numbers or strings.
fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Amounts are `i128` on chain; large ones arrive as decimal strings.
fn amount_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    let value = Value::deserialize(d)?;
    id_from_value(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid id: {value}")))
}

fn amount<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(d)?;
    amount_from_value(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid integer: {value}")))
}

fn opt_amount<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        value => amount_from_value(&value)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid integer: {value}"))),
    }
}

fn opt_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        value => normalize_timestamp(&value)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {value}"))),
    }
}
