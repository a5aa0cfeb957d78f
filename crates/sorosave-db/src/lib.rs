//! Database layer for the SoroSave group indexer.
//!
//! Provides SQLite connection pooling (via `r2d2`), WAL-mode initialization,
//! and embedded SQL migrations for the four persisted relations: the raw
//! `events` log and the `groups`, `members`, and `contributions` projections.
//!
//! # Design decisions
//!
//! - **SQLite with WAL mode**: the indexer is a single-process, single-writer
//!   system. WAL gives concurrent query connections a consistent committed
//!   snapshot while ingestion writes.
//! - **`r2d2` connection pool**: bounded connection reuse for the query side.
//! - **Embedded migrations**: SQL files are compiled into the binary via
//!   `include_str!` so the schema cannot drift from the code reading it.

mod migrations;
mod pool;

pub use migrations::{run_migrations, MigrationError};
pub use pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
