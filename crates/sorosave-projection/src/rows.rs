//! Row mappers for the projection tables.

use rusqlite::Row;
use sorosave_types::{Contribution, Group, GroupStatus, Member};

pub(crate) const GROUP_COLUMNS: &str = "g.id, g.name, g.description, g.admin, g.token, \
     g.contribution_amount, g.target_amount, g.cycle_length, g.max_members, g.current_round, \
     g.status, g.member_count, g.total_saved, g.created_at, g.ledger_sequence";

pub(crate) const MEMBER_COLUMNS: &str =
    "m.group_id, m.address, m.joined_at, m.is_admin, m.total_contributed, m.ledger_sequence";

pub(crate) const CONTRIBUTION_COLUMNS: &str =
    "c.id, c.group_id, c.member_address, c.amount, c.round, c.ledger_sequence, c.timestamp";

/// Number of columns in [`GROUP_COLUMNS`].
pub(crate) const GROUP_WIDTH: usize = 15;

/// Reads a `groups.status` value, rejecting labels outside the lifecycle.
pub(crate) fn status_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<GroupStatus> {
    let label: String = row.get(idx)?;
    label.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Maps [`GROUP_COLUMNS`] starting at `at`.
pub(crate) fn group_at(row: &Row<'_>, at: usize) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(at)?,
        name: row.get(at + 1)?,
        description: row.get(at + 2)?,
        admin: row.get(at + 3)?,
        token: row.get(at + 4)?,
        contribution_amount: row.get(at + 5)?,
        target_amount: row.get(at + 6)?,
        cycle_length: row.get(at + 7)?,
        max_members: row.get(at + 8)?,
        current_round: row.get(at + 9)?,
        status: status_column(row, at + 10)?,
        member_count: row.get(at + 11)?,
        total_saved: row.get(at + 12)?,
        created_at: row.get(at + 13)?,
        ledger_sequence: row.get(at + 14)?,
    })
}

/// Maps [`MEMBER_COLUMNS`] starting at `at`.
pub(crate) fn member_at(row: &Row<'_>, at: usize) -> rusqlite::Result<Member> {
    Ok(Member {
        group_id: row.get(at)?,
        address: row.get(at + 1)?,
        joined_at: row.get(at + 2)?,
        is_admin: row.get(at + 3)?,
        total_contributed: row.get(at + 4)?,
        ledger_sequence: row.get(at + 5)?,
    })
}

pub(crate) fn contribution(row: &Row<'_>) -> rusqlite::Result<Contribution> {
    Ok(Contribution {
        id: row.get(0)?,
        group_id: row.get(1)?,
        member_address: row.get(2)?,
        amount: row.get(3)?,
        round: row.get(4)?,
        ledger_sequence: row.get(5)?,
        timestamp: row.get(6)?,
    })
}
