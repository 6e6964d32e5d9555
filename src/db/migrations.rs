use anyhow::{bail, Context, Result};
use rusqlite::Connection;

/// Ordered schema steps. Entry `i` moves the database to version `i + 1`.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "sessions, enrollments, codes and attendance",
        include_str!("schemas/schema_v1.sql"),
    ),
    (
        "anomaly log, account locks and presence fixes",
        include_str!("schemas/schema_v2.sql"),
    ),
];

fn target_version() -> i32 {
    MIGRATIONS.len() as i32
}

/// Brings the schema up to date inside one transaction.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let current: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read user_version pragma")?;
    let target = target_version();

    if current > target {
        bail!("database schema version {current} is newer than this build supports ({target})");
    }
    if current == target {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .context("failed to open migration transaction")?;

    for (index, (label, sql)) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let version = index as i32 + 1;
        tx.execute_batch(sql)
            .with_context(|| format!("migration {version} ({label}) failed"))?;
        log::info!("Applied schema migration {version}: {label}");
    }

    tx.pragma_update(None, "user_version", target)
        .context("failed to update user_version pragma")?;
    tx.commit().context("failed to commit migrations")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_version(conn: &Connection) -> i32 {
        conn.pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn fresh_database_reaches_latest_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap();
        assert_eq!(user_version(&conn), target_version());

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('sessions', 'one_time_codes', 'attendance', 'anomalies', 'account_locks')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }

    #[test]
    fn partially_migrated_database_resumes() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATIONS[0].1).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();

        run_migrations(&mut conn).unwrap();
        assert_eq!(user_version(&conn), target_version());
    }

    #[test]
    fn newer_database_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", target_version() + 1)
            .unwrap();
        assert!(run_migrations(&mut conn).is_err());
    }
}
