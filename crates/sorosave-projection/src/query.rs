//! Read-only accessors over the projections.
//!
//! Every query checks out its own pooled connection. Queries that issue more
//! than one statement run inside a read transaction so all of them observe
//! the same committed snapshot, never a half-applied event.

use std::sync::Arc;

use rusqlite::types::ToSql;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use sorosave_db::DbPool;
use sorosave_types::{Contribution, Group, GroupStatus, Member};

use crate::error::QueryError;
use crate::index::MemberIndex;
use crate::rows::{
    contribution, group_at, member_at, CONTRIBUTION_COLUMNS, GROUP_COLUMNS, GROUP_WIDTH,
    MEMBER_COLUMNS,
};

/// Largest page [`QueryService::list_groups`] returns.
pub const MAX_PAGE_SIZE: i64 = 500;

/// Filter criteria for [`QueryService::list_groups`]. All fields combine
/// with AND; `None` means unconstrained.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupFilter {
    pub status: Option<GroupStatus>,
    pub token: Option<String>,
    pub admin: Option<String>,
    /// Minimum `member_count`, inclusive.
    pub min_members: Option<i64>,
    /// Maximum `member_count`, inclusive.
    pub max_members: Option<i64>,
    /// Minimum `total_saved`, inclusive.
    pub min_saved: Option<i64>,
    /// Groups created at or after this RFC 3339 time.
    pub created_after: Option<String>,
    /// Groups created at or before this RFC 3339 time.
    pub created_before: Option<String>,
}

impl GroupFilter {
    /// Builds the WHERE clause and its bind parameters.
    fn to_sql(&self) -> (String, Vec<Box<dyn ToSql>>) {
        let mut clauses = vec!["1 = 1".to_string()];
        let mut param_values: Vec<Box<dyn ToSql>> = Vec::new();
        let mut idx = 1u32;

        let mut push = |clause: &str, value: Box<dyn ToSql>| {
            clauses.push(format!("{clause} ?{idx}"));
            param_values.push(value);
            idx += 1;
        };

        if let Some(status) = self.status {
            push("g.status =", Box::new(status.as_str()));
        }
        if let Some(ref token) = self.token {
            push("g.token =", Box::new(token.clone()));
        }
        if let Some(ref admin) = self.admin {
            push("g.admin =", Box::new(admin.clone()));
        }
        if let Some(min) = self.min_members {
            push("g.member_count >=", Box::new(min));
        }
        if let Some(max) = self.max_members {
            push("g.member_count <=", Box::new(max));
        }
        if let Some(min) = self.min_saved {
            push("g.total_saved >=", Box::new(min));
        }
        if let Some(ref after) = self.created_after {
            push("g.created_at >=", Box::new(normalize_bound(after)));
        }
        if let Some(ref before) = self.created_before {
            push("g.created_at <=", Box::new(normalize_bound(before)));
        }

        (clauses.join(" AND "), param_values)
    }
}

/// Time bounds are compared against normalized timestamps, so normalize them
/// the same way; unparseable bounds are compared verbatim.
fn normalize_bound(bound: &str) -> String {
    sorosave_types::normalize_timestamp_str(bound).unwrap_or_else(|| bound.to_string())
}

/// One page of results plus the size of the full filtered set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
}

/// A group together with one member's row in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberGroup {
    pub group: Group,
    pub membership: Member,
}

/// Aggregate counters over the whole index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub group_count: i64,
    pub member_count: i64,
    pub total_saved: i64,
    pub event_count: i64,
    pub last_ledger_sequence: i64,
}

/// Projection rows whose stored aggregates disagree with the rows they
/// summarize.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    /// Groups whose `member_count` differs from their member rows.
    pub member_count: Vec<String>,
    /// Groups whose `total_saved` differs from their contribution rows.
    pub total_saved: Vec<String>,
    /// `(group_id, address)` members whose `total_contributed` differs from
    /// their contribution rows.
    pub total_contributed: Vec<(String, String)>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.member_count.is_empty()
            && self.total_saved.is_empty()
            && self.total_contributed.is_empty()
    }
}

/// Read-only queries over the group, member, and contribution projections.
#[derive(Clone)]
pub struct QueryService {
    pool: DbPool,
    index: Arc<MemberIndex>,
}

impl QueryService {
    pub fn new(pool: DbPool, index: Arc<MemberIndex>) -> Self {
        Self { pool, index }
    }

    /// Lists groups matching `filter`, newest first.
    ///
    /// `limit` is clamped to `0..=MAX_PAGE_SIZE` and `offset` to `0..`.
    /// `total` counts the whole filtered set, not just this page.
    ///
    /// # Errors
    ///
    /// Returns `QueryError` on pool or SQL failure.
    pub fn list_groups(
        &self,
        filter: &GroupFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Page<Group>, QueryError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let (where_clause, mut param_values) = filter.to_sql();
        let filter_params: Vec<&dyn ToSql> = param_values.iter().map(|p| &**p).collect();

        let total: i64 = tx.query_row(
            &format!("SELECT COUNT(*) FROM groups g WHERE {where_clause}"),
            filter_params.as_slice(),
            |row| row.get(0),
        )?;

        let next = param_values.len() + 1;
        let sql = format!(
            "SELECT {GROUP_COLUMNS} FROM groups g
             WHERE {where_clause}
             ORDER BY g.created_at DESC, g.id ASC
             LIMIT ?{next} OFFSET ?{}",
            next + 1
        );
        param_values.push(Box::new(limit.clamp(0, MAX_PAGE_SIZE)));
        param_values.push(Box::new(offset.max(0)));
        let params_refs: Vec<&dyn ToSql> = param_values.iter().map(|p| &**p).collect();

        let items = {
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params_refs.as_slice(), |row| group_at(row, 0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        Ok(Page { items, total })
    }

    /// Looks up one group by id.
    ///
    /// # Errors
    ///
    /// Returns `QueryError` on pool or SQL failure.
    pub fn get_group(&self, id: &str) -> Result<Option<Group>, QueryError> {
        let conn = self.pool.get()?;
        let group = conn
            .query_row(
                &format!("SELECT {GROUP_COLUMNS} FROM groups g WHERE g.id = ?1"),
                [id],
                |row| group_at(row, 0),
            )
            .optional()?;
        Ok(group)
    }

    /// Groups the address belongs to, most recently joined first.
    ///
    /// Candidate groups come from the member index and are hydrated from the
    /// projection together with the address's membership row.
    ///
    /// # Errors
    ///
    /// Returns `QueryError` on pool or SQL failure.
    pub fn get_groups_by_member(&self, address: &str) -> Result<Vec<MemberGroup>, QueryError> {
        let group_ids = self.index.lookup(address);
        if group_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (2..group_ids.len() + 2)
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {GROUP_COLUMNS}, {MEMBER_COLUMNS}
             FROM groups g
             JOIN members m ON m.group_id = g.id
             WHERE m.address = ?1 AND g.id IN ({placeholders})
             ORDER BY m.joined_at DESC, g.id ASC"
        );

        let mut param_values: Vec<&dyn ToSql> = vec![&address];
        param_values.extend(group_ids.iter().map(|id| id as &dyn ToSql));

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_values.as_slice(), |row| {
            Ok(MemberGroup {
                group: group_at(row, 0)?,
                membership: member_at(row, GROUP_WIDTH)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Members of a group, most recently joined first.
    ///
    /// # Errors
    ///
    /// Returns `QueryError` on pool or SQL failure.
    pub fn get_group_members(&self, group_id: &str) -> Result<Vec<Member>, QueryError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MEMBER_COLUMNS} FROM members m
             WHERE m.group_id = ?1
             ORDER BY m.joined_at DESC, m.address ASC"
        ))?;
        let rows = stmt.query_map([group_id], |row| member_at(row, 0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Contributions to a group, optionally restricted to one round, in
    /// round then ledger order.
    ///
    /// # Errors
    ///
    /// Returns `QueryError` on pool or SQL failure.
    pub fn get_group_contributions(
        &self,
        group_id: &str,
        round: Option<i64>,
    ) -> Result<Vec<Contribution>, QueryError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONTRIBUTION_COLUMNS} FROM contributions c
             WHERE c.group_id = ?1 AND (?2 IS NULL OR c.round = ?2)
             ORDER BY c.round ASC, c.ledger_sequence ASC, c.id ASC"
        ))?;
        let rows = stmt.query_map(rusqlite::params![group_id, round], contribution)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Sum of `total_saved` across all groups.
    ///
    /// # Errors
    ///
    /// Returns `QueryError` on pool or SQL failure.
    pub fn get_total_saved(&self) -> Result<i64, QueryError> {
        let conn = self.pool.get()?;
        Ok(conn.query_row(
            "SELECT COALESCE(SUM(total_saved), 0) FROM groups",
            [],
            |row| row.get(0),
        )?)
    }

    /// Recomputes every stored aggregate from the underlying rows, in one
    /// snapshot, and lists the rows that disagree.
    ///
    /// # Errors
    ///
    /// Returns `QueryError` on pool or SQL failure.
    pub fn check_consistency(&self) -> Result<ConsistencyReport, QueryError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let group_ids = |sql: &str| -> rusqlite::Result<Vec<String>> {
            let mut stmt = tx.prepare(sql)?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        };

        let member_count = group_ids(
            "SELECT g.id FROM groups g
             WHERE g.member_count != (SELECT COUNT(*) FROM members m WHERE m.group_id = g.id)
             ORDER BY g.id",
        )?;
        let total_saved = group_ids(
            "SELECT g.id FROM groups g
             WHERE g.total_saved !=
                (SELECT COALESCE(SUM(c.amount), 0) FROM contributions c WHERE c.group_id = g.id)
             ORDER BY g.id",
        )?;

        let total_contributed = {
            let mut stmt = tx.prepare(
                "SELECT m.group_id, m.address FROM members m
                 WHERE m.total_contributed !=
                    (SELECT COALESCE(SUM(c.amount), 0) FROM contributions c
                     WHERE c.group_id = m.group_id AND c.member_address = m.address)
                 ORDER BY m.group_id, m.address",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        Ok(ConsistencyReport {
            member_count,
            total_saved,
            total_contributed,
        })
    }

    /// Aggregate counters, read from one snapshot.
    ///
    /// # Errors
    ///
    /// Returns `QueryError` on pool or SQL failure.
    pub fn get_stats(&self) -> Result<Stats, QueryError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let count = |sql: &str| -> rusqlite::Result<i64> { tx.query_row(sql, [], |row| row.get(0)) };

        Ok(Stats {
            group_count: count("SELECT COUNT(*) FROM groups")?,
            member_count: count("SELECT COUNT(*) FROM members")?,
            total_saved: count("SELECT COALESCE(SUM(total_saved), 0) FROM groups")?,
            event_count: count("SELECT COUNT(*) FROM events")?,
            last_ledger_sequence: count("SELECT COALESCE(MAX(ledger_sequence), 0) FROM events")?,
        })
    }
}
