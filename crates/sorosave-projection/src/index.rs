//! In-memory secondary index from member address to group ids.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use rusqlite::Connection;
use serde::Serialize;

type Entries = HashMap<String, BTreeSet<String>>;

/// Mapping from member address to the set of groups the address belongs to.
///
/// Written only by the ingestion pipeline, after the event that created the
/// membership has committed, so readers see the state as of the last
/// completed projection step. Readers hold the lock only long enough to
/// clone one entry.
#[derive(Debug, Default)]
pub struct MemberIndex {
    entries: RwLock<Entries>,
}

/// Differences between the incremental index and a fresh rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexDrift {
    /// `(address, group_id)` pairs present in `members` but not indexed.
    pub missing: Vec<(String, String)>,
    /// `(address, group_id)` pairs indexed but absent from `members`.
    pub extra: Vec<(String, String)>,
}

impl IndexDrift {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

impl MemberIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group ids the address is a member of, in ascending order.
    pub fn lookup(&self, address: &str) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(address)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Records a membership. Recording the same pair twice is a no-op.
    pub fn record(&self, group_id: &str, address: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(address.to_string())
            .or_default()
            .insert(group_id.to_string());
    }

    /// Number of indexed addresses.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replaces the index with one built from the `members` table.
    ///
    /// Returns the number of memberships loaded.
    ///
    /// # Errors
    ///
    /// Returns the underlying SQLite error if `members` cannot be read; the
    /// current index is left untouched in that case.
    pub fn rebuild(&self, conn: &Connection) -> rusqlite::Result<usize> {
        let (fresh, memberships) = load(conn)?;
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        tracing::info!(memberships, "member index rebuilt");
        Ok(memberships)
    }

    /// Compares the index against a fresh build from the `members` table.
    ///
    /// # Errors
    ///
    /// Returns the underlying SQLite error if `members` cannot be read.
    pub fn verify(&self, conn: &Connection) -> rusqlite::Result<IndexDrift> {
        let (fresh, _) = load(conn)?;
        let current = self.entries.read().unwrap_or_else(PoisonError::into_inner);

        let drift = IndexDrift {
            missing: difference(&fresh, &current),
            extra: difference(&current, &fresh),
        };
        if !drift.is_consistent() {
            tracing::warn!(
                missing = drift.missing.len(),
                extra = drift.extra.len(),
                "member index drifted from members table"
            );
        }
        Ok(drift)
    }
}

fn load(conn: &Connection) -> rusqlite::Result<(Entries, usize)> {
    let mut stmt = conn.prepare("SELECT address, group_id FROM members")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get(1)?)))?;

    let mut entries = Entries::new();
    let mut count = 0;
    for row in rows {
        let (address, group_id) = row?;
        entries.entry(address).or_default().insert(group_id);
        count += 1;
    }
    Ok((entries, count))
}

/// Pairs in `left` that are not in `right`, sorted.
fn difference(left: &Entries, right: &Entries) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = left
        .iter()
        .flat_map(|(address, groups)| {
            groups
                .iter()
                .filter(move |group_id| {
                    !right
                        .get(address)
                        .is_some_and(|other| other.contains(*group_id))
                })
                .map(move |group_id| (address.clone(), group_id.clone()))
        })
        .collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("should open in-memory db");
        sorosave_db::run_migrations(&conn).expect("migrations should succeed");
        for id in ["g1", "g2"] {
            conn.execute(
                "INSERT INTO groups (id, name, admin, token, contribution_amount,
                                     cycle_length, max_members, created_at, ledger_sequence)
                 VALUES (?1, 'n', 'GA', 'CT', 10, 60, 5, '2024-01-01T00:00:00Z', 1)",
                [id],
            )
            .expect("should insert group");
        }
        conn
    }

    fn add_member(conn: &Connection, group_id: &str, address: &str) {
        conn.execute(
            "INSERT INTO members (group_id, address, joined_at, ledger_sequence)
             VALUES (?1, ?2, '2024-01-02T00:00:00Z', 2)",
            [group_id, address],
        )
        .expect("should insert member");
    }

    #[test]
    fn record_is_idempotent() {
        let index = MemberIndex::new();
        index.record("g1", "GA");
        index.record("g1", "GA");
        index.record("g2", "GA");

        assert_eq!(index.lookup("GA"), vec!["g1", "g2"]);
        assert!(index.lookup("GB").is_empty());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn rebuild_matches_members_table() {
        let conn = test_db();
        add_member(&conn, "g1", "GA");
        add_member(&conn, "g2", "GA");
        add_member(&conn, "g2", "GB");

        let index = MemberIndex::new();
        index.record("stale", "GZ");

        let loaded = index.rebuild(&conn).expect("rebuild should succeed");
        assert_eq!(loaded, 3);
        assert_eq!(index.lookup("GA"), vec!["g1", "g2"]);
        assert_eq!(index.lookup("GB"), vec!["g2"]);
        assert!(index.lookup("GZ").is_empty());
    }

    #[test]
    fn verify_reports_drift_both_ways() {
        let conn = test_db();
        add_member(&conn, "g1", "GA");
        add_member(&conn, "g2", "GB");

        let index = MemberIndex::new();
        index.record("g1", "GA");
        index.record("g9", "GC");

        let drift = index.verify(&conn).expect("verify should succeed");
        assert_eq!(drift.missing, vec![("GB".to_string(), "g2".to_string())]);
        assert_eq!(drift.extra, vec![("GC".to_string(), "g9".to_string())]);
        assert!(!drift.is_consistent());

        index.rebuild(&conn).expect("rebuild should succeed");
        assert!(index.verify(&conn).expect("verify").is_consistent());
    }
}
