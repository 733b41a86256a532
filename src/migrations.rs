//! Embedded, versioned SQLite migrations.

use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

/// Ordered list of migrations; each script records its own version in
/// schema_migrations so re-runs are no-ops.
const MIGRATIONS: &[(i32, &str)] = &[
    (1, include_str!("../migrations/001_schema.sql")),
    (2, include_str!("../migrations/002_payment_orders.sql")),
];

pub struct Migrator;

impl Migrator {
    pub fn new() -> Self {
        Self
    }

    pub fn run(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
        )?;

        for (version, sql) in MIGRATIONS {
            let applied: bool = conn.query_row(
                "SELECT COUNT(*) FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get::<_, i64>(0).map(|c| c > 0),
            )?;

            if !applied {
                conn.execute_batch(sql)?;
                info!("Applied migration {:03}", version);
            }
        }

        Ok(())
    }
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let migrator = Migrator::new();
        migrator.run(&conn).unwrap();
        migrator.run(&conn).unwrap();

        let versions: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(versions, MIGRATIONS.len() as i64);
    }
}
