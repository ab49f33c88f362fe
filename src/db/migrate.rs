//! File-based schema migrations. Each `NNN_name.sql` under the migrations
//! directory is applied once, in version order, inside a transaction.

use rusqlite::{params, Connection};
use std::fs;
use std::path::Path;

use crate::error::{Result, TwinError};

struct Migration {
    version: u32,
    name: String,
    sql: String,
}

fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

pub fn get_applied_migrations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM schema_migrations ORDER BY version")?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()
        .map_err(TwinError::Database)?;
    Ok(names)
}

fn load_migrations(migrations_dir: &Path) -> Result<Vec<Migration>> {
    let entries = fs::read_dir(migrations_dir).map_err(TwinError::Io)?;

    let mut files: Vec<_> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();
    files.sort_by_key(|e| e.file_name());

    let mut migrations = Vec::new();
    for entry in files {
        let path = entry.path();
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| TwinError::Config("invalid migration filename".to_string()))?;

        // "001_core_tables.sql" -> 1
        let version_str = filename
            .split('_')
            .next()
            .ok_or_else(|| TwinError::Config(format!("invalid migration filename: {}", filename)))?;
        let version: u32 = version_str
            .parse()
            .map_err(|_| TwinError::Config(format!("invalid migration version: {}", version_str)))?;

        let sql = fs::read_to_string(&path).map_err(TwinError::Io)?;
        let name = filename.trim_end_matches(".sql").to_string();

        migrations.push(Migration { version, name, sql });
    }

    migrations.sort_by_key(|m| m.version);
    Ok(migrations)
}

/// Apply all pending migrations from `migrations_dir`.
pub fn run_migrations(conn: &mut Connection, migrations_dir: &Path) -> Result<()> {
    ensure_migrations_table(conn)?;

    let applied = get_applied_migrations(conn)?;
    for migration in load_migrations(migrations_dir)? {
        if applied.contains(&migration.name) {
            log::debug!("migration {} already applied", migration.name);
            continue;
        }

        log::info!(
            "applying migration {} (version {})",
            migration.name,
            migration.version
        );

        let tx = conn.transaction()?;
        tx.execute_batch(&migration.sql).map_err(|e| {
            TwinError::Config(format!("migration {} failed: {}", migration.name, e))
        })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_migration_tracking() {
        let temp_dir = TempDir::new().unwrap();
        let conn = Connection::open(temp_dir.path().join("test.db")).unwrap();

        ensure_migrations_table(&conn).unwrap();
        conn.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
            params![1, "001_test"],
        )
        .unwrap();

        let applied = get_applied_migrations(&conn).unwrap();
        assert!(applied.contains(&"001_test".to_string()));
    }

    #[test]
    fn test_load_migrations_sorted_by_version() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("migrations");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("002_later.sql"), "CREATE TABLE later (id INTEGER);").unwrap();
        fs::write(dir.join("001_first.sql"), "CREATE TABLE first (id INTEGER);").unwrap();

        let migrations = load_migrations(&dir).unwrap();
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].version, 1);
        assert_eq!(migrations[1].version, 2);
    }

    #[test]
    fn test_migrations_apply_once() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("migrations");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("001_t.sql"), "CREATE TABLE t (id INTEGER);").unwrap();

        let mut conn = Connection::open(temp_dir.path().join("test.db")).unwrap();
        run_migrations(&mut conn, &dir).unwrap();
        // A second run must not re-execute the CREATE TABLE.
        run_migrations(&mut conn, &dir).unwrap();

        let applied = get_applied_migrations(&conn).unwrap();
        assert_eq!(applied, vec!["001_t".to_string()]);
    }
}
