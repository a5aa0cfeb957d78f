//! Typed handlers that fold contract events into the projections.
//!
//! Each handler runs inside the caller's transaction (a savepoint nested in
//! the per-event transaction) and either mutates the projection, reports a
//! skip, or fails with a [`Violation`] which the caller rolls back.
//!
//! Rows carry the ledger sequence of the last event applied to them. Events
//! older than that high-water mark are refused for the row they would
//! overwrite. Two effects are exempt because they are correct in any order:
//! the member count is recomputed from the member set, and contribution
//! totals only move when the contribution row itself is newly inserted.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use sorosave_events::{ContractEvent, ContributionMade, GroupCreated, MemberJoined};
use sorosave_types::GroupStatus;

use crate::error::{HandlerError, Violation};
use crate::rows::status_column;

/// Why a handler left the projection unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The event references a group that has not been created.
    MissingGroup,
    /// The contribution references an address that is not a member.
    MissingMember,
    /// The row was already updated by an event from a later ledger.
    Stale,
    /// A contribution with the same id is already recorded.
    DuplicateContribution,
}

/// What a handler did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// The projection was mutated.
    Applied,
    /// A membership was inserted or re-affirmed.
    MemberRecorded { group_id: String, address: String },
    /// Nothing was mutated.
    Skipped(SkipReason),
}

/// The fields of a group row the handlers decide on.
struct GroupHead {
    admin: String,
    status: GroupStatus,
    total_saved: i64,
    ledger_sequence: i64,
}

fn group_head(conn: &Connection, group_id: &str) -> rusqlite::Result<Option<GroupHead>> {
    conn.query_row(
        "SELECT admin, status, total_saved, ledger_sequence FROM groups WHERE id = ?1",
        [group_id],
        |row| {
            Ok(GroupHead {
                admin: row.get(0)?,
                status: status_column(row, 1)?,
                total_saved: row.get(2)?,
                ledger_sequence: row.get(3)?,
            })
        },
    )
    .optional()
}

/// Applies one decoded event at the given ledger sequence.
///
/// `timestamp` is the normalized event time, recorded on contributions.
pub(crate) fn apply(
    conn: &Connection,
    event: &ContractEvent,
    ledger: i64,
    timestamp: &str,
) -> Result<Effect, HandlerError> {
    match event {
        ContractEvent::GroupCreated(e) => group_created(conn, e, ledger),
        ContractEvent::MemberJoined(e) => member_joined(conn, e, ledger),
        ContractEvent::ContributionMade(e) => contribution_made(conn, e, ledger, timestamp),
        ContractEvent::GroupStarted { group_id } => {
            set_status(conn, group_id, GroupStatus::Active, ledger)
        }
        ContractEvent::GroupCompleted { group_id } => {
            set_status(conn, group_id, GroupStatus::Completed, ledger)
        }
        ContractEvent::GroupCancelled { group_id } => {
            set_status(conn, group_id, GroupStatus::Cancelled, ledger)
        }
    }
}

fn group_created(conn: &Connection, e: &GroupCreated, ledger: i64) -> Result<Effect, HandlerError> {
    if let Some(head) = group_head(conn, &e.group_id)? {
        if ledger < head.ledger_sequence {
            tracing::debug!(group_id = %e.group_id, ledger, row_ledger = head.ledger_sequence, "stale group_created ignored");
            return Ok(Effect::Skipped(SkipReason::Stale));
        }
    }

    // Re-creation refreshes the descriptive fields only; status and
    // accumulators belong to the later events.
    conn.execute(
        "INSERT INTO groups
            (id, name, description, admin, token, contribution_amount, target_amount,
             cycle_length, max_members, current_round, status, created_at, ledger_sequence)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'forming', ?11, ?12)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            description = excluded.description,
            admin = excluded.admin,
            token = excluded.token,
            contribution_amount = excluded.contribution_amount,
            target_amount = excluded.target_amount,
            cycle_length = excluded.cycle_length,
            max_members = excluded.max_members,
            created_at = excluded.created_at,
            ledger_sequence = excluded.ledger_sequence,
            updated_at = datetime('now')",
        params![
            e.group_id,
            e.name,
            e.description,
            e.admin,
            e.token,
            e.contribution_amount,
            e.target_amount,
            e.cycle_length,
            e.max_members,
            e.current_round,
            e.created_at,
            ledger,
        ],
    )?;

    tracing::debug!(group_id = %e.group_id, name = %e.name, ledger, "group created");
    Ok(Effect::Applied)
}

fn member_joined(conn: &Connection, e: &MemberJoined, ledger: i64) -> Result<Effect, HandlerError> {
    let Some(group) = group_head(conn, &e.group_id)? else {
        tracing::warn!(group_id = %e.group_id, address = %e.member_address, "member_joined for unknown group, skipping");
        return Ok(Effect::Skipped(SkipReason::MissingGroup));
    };

    let member_ledger: Option<i64> = conn
        .query_row(
            "SELECT ledger_sequence FROM members WHERE group_id = ?1 AND address = ?2",
            params![e.group_id, e.member_address],
            |row| row.get(0),
        )
        .optional()?;
    if member_ledger.is_some_and(|row_ledger| ledger < row_ledger) {
        tracing::debug!(group_id = %e.group_id, address = %e.member_address, ledger, "stale member_joined ignored");
        return Ok(Effect::Skipped(SkipReason::Stale));
    }

    let is_admin = e.is_admin || e.member_address == group.admin;

    conn.execute(
        "INSERT INTO members (group_id, address, joined_at, is_admin, ledger_sequence)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(group_id, address) DO UPDATE SET
            is_admin = excluded.is_admin,
            ledger_sequence = excluded.ledger_sequence",
        params![e.group_id, e.member_address, e.joined_at, is_admin, ledger],
    )?;

    conn.execute(
        "UPDATE groups SET
            member_count = (SELECT COUNT(*) FROM members WHERE group_id = ?1),
            ledger_sequence = MAX(ledger_sequence, ?2),
            updated_at = datetime('now')
         WHERE id = ?1",
        params![e.group_id, ledger],
    )?;

    tracing::debug!(group_id = %e.group_id, address = %e.member_address, is_admin, "member recorded");
    Ok(Effect::MemberRecorded {
        group_id: e.group_id.clone(),
        address: e.member_address.clone(),
    })
}

fn contribution_made(
    conn: &Connection,
    e: &ContributionMade,
    ledger: i64,
    timestamp: &str,
) -> Result<Effect, HandlerError> {
    if e.amount < 0 {
        return Err(Violation::NegativeAmount {
            contribution_id: e.contribution_id.clone(),
            amount: e.amount,
        }
        .into());
    }

    let Some(group) = group_head(conn, &e.group_id)? else {
        tracing::warn!(group_id = %e.group_id, contribution_id = %e.contribution_id, "contribution for unknown group, skipping");
        return Ok(Effect::Skipped(SkipReason::MissingGroup));
    };

    let member_total: Option<i64> = conn
        .query_row(
            "SELECT total_contributed FROM members WHERE group_id = ?1 AND address = ?2",
            params![e.group_id, e.member_address],
            |row| row.get(0),
        )
        .optional()?;
    let Some(member_total) = member_total else {
        tracing::warn!(
            group_id = %e.group_id,
            address = %e.member_address,
            contribution_id = %e.contribution_id,
            "contribution from non-member, skipping"
        );
        return Ok(Effect::Skipped(SkipReason::MissingMember));
    };

    let inserted = conn.execute(
        "INSERT OR IGNORE INTO contributions
            (id, group_id, member_address, amount, round, ledger_sequence, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            e.contribution_id,
            e.group_id,
            e.member_address,
            e.amount,
            e.round,
            ledger,
            timestamp,
        ],
    )? > 0;

    if !inserted {
        tracing::debug!(contribution_id = %e.contribution_id, "contribution already recorded");
        return Ok(Effect::Skipped(SkipReason::DuplicateContribution));
    }

    let overflow = |field| Violation::Overflow {
        group_id: e.group_id.clone(),
        field,
    };
    let member_total = member_total
        .checked_add(e.amount)
        .ok_or_else(|| overflow("total_contributed"))?;
    let group_total = group
        .total_saved
        .checked_add(e.amount)
        .ok_or_else(|| overflow("total_saved"))?;

    conn.execute(
        "UPDATE members SET
            total_contributed = ?1,
            ledger_sequence = MAX(ledger_sequence, ?2)
         WHERE group_id = ?3 AND address = ?4",
        params![member_total, ledger, e.group_id, e.member_address],
    )?;
    conn.execute(
        "UPDATE groups SET
            total_saved = ?1,
            ledger_sequence = MAX(ledger_sequence, ?2),
            updated_at = datetime('now')
         WHERE id = ?3",
        params![group_total, ledger, e.group_id],
    )?;

    tracing::debug!(
        group_id = %e.group_id,
        contribution_id = %e.contribution_id,
        amount = e.amount,
        round = e.round,
        "contribution recorded"
    );
    Ok(Effect::Applied)
}

fn set_status(
    conn: &Connection,
    group_id: &str,
    next: GroupStatus,
    ledger: i64,
) -> Result<Effect, HandlerError> {
    let Some(group) = group_head(conn, group_id)? else {
        tracing::warn!(group_id, status = %next, "status change for unknown group, skipping");
        return Ok(Effect::Skipped(SkipReason::MissingGroup));
    };

    if ledger < group.ledger_sequence {
        tracing::debug!(group_id, ledger, row_ledger = group.ledger_sequence, "stale status change ignored");
        return Ok(Effect::Skipped(SkipReason::Stale));
    }

    if !group.status.can_transition_to(next) {
        return Err(Violation::IllegalTransition {
            group_id: group_id.to_string(),
            from: group.status,
            to: next,
        }
        .into());
    }

    conn.execute(
        "UPDATE groups SET status = ?1, ledger_sequence = ?2, updated_at = datetime('now')
         WHERE id = ?3",
        params![next.as_str(), ledger, group_id],
    )?;

    tracing::debug!(group_id, from = %group.status, to = %next, "group status updated");
    Ok(Effect::Applied)
}
