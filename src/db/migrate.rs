//! Numbered SQL migrations for the crawl store.
//!
//! Files in the migrations directory are named `NNN_description.sql` and applied
//! in version order, each inside its own transaction, and recorded in
//! `schema_migrations` so a restarted crawler never re-applies them.

use rusqlite::{params, Connection};
use std::fs;
use std::path::Path;
use crate::error::{Result, SwgraphError};

/// One migration file
#[derive(Debug)]
struct Migration {
    version: u32,
    name: String,
    sql: String,
}

/// Split `007_add_claims.sql` into `(7, "007_add_claims")`.
fn parse_migration_filename(filename: &str) -> Result<(u32, String)> {
    let name = filename
        .strip_suffix(".sql")
        .ok_or_else(|| SwgraphError::Config(format!("Not a migration file: {}", filename)))?;
    let (version, _) = name
        .split_once('_')
        .ok_or_else(|| SwgraphError::Config(format!("Migration name lacks a version prefix: {}", filename)))?;
    let version = version
        .parse::<u32>()
        .map_err(|_| SwgraphError::Config(format!("Invalid migration version in {}", filename)))?;
    Ok((version, name.to_string()))
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

/// Names of applied migrations in version order
pub fn get_applied_migrations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM schema_migrations ORDER BY version")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(names)
}

fn applied_versions(conn: &Connection) -> Result<Vec<u32>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations")?;
    let versions = stmt
        .query_map([], |row| row.get::<_, u32>(0))?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(versions)
}

fn load_migrations(migrations_dir: &Path) -> Result<Vec<Migration>> {
    let mut migrations = Vec::new();

    for entry in fs::read_dir(migrations_dir)? {
        let path = entry?.path();
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !filename.ends_with(".sql") {
            continue;
        }
        let (version, name) = parse_migration_filename(filename)?;
        if migrations.iter().any(|m: &Migration| m.version == version) {
            return Err(SwgraphError::Config(format!(
                "Duplicate migration version {} ({})",
                version, filename
            )));
        }
        let sql = fs::read_to_string(&path)?;
        migrations.push(Migration { version, name, sql });
    }

    migrations.sort_by_key(|m| m.version);
    Ok(migrations)
}

/// Run all pending migrations
pub fn run_migrations(conn: &mut Connection, migrations_dir: &Path) -> Result<()> {
    ensure_migrations_table(conn)?;

    let applied = applied_versions(conn)?;
    let pending: Vec<Migration> = load_migrations(migrations_dir)?
        .into_iter()
        .filter(|m| !applied.contains(&m.version))
        .collect();

    if pending.is_empty() {
        log::debug!("Schema up to date ({} migrations applied)", applied.len());
        return Ok(());
    }

    for migration in pending {
        log::info!("Applying migration: {} (version {})", migration.name, migration.version);

        let tx = conn.transaction()?;
        tx.execute_batch(&migration.sql).map_err(|e| {
            SwgraphError::Config(format!("Failed to execute migration {}: {}", migration.name, e))
        })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;
    }

    log::info!("All migrations completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_migration_filename() {
        assert_eq!(
            parse_migration_filename("001_crawl_store.sql").unwrap(),
            (1, "001_crawl_store".to_string())
        );
        assert!(parse_migration_filename("crawl_store.sql").is_err());
        assert!(parse_migration_filename("001.sql").is_err());
        assert!(parse_migration_filename("001_x.txt").is_err());
    }

    #[test]
    fn test_load_migrations_sorted_and_filtered() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::write(dir.join("010_later.sql"), "CREATE TABLE later (id INTEGER);").unwrap();
        fs::write(dir.join("002_first.sql"), "CREATE TABLE first (id INTEGER);").unwrap();
        fs::write(dir.join("README.md"), "not a migration").unwrap();

        let migrations = load_migrations(dir).unwrap();
        assert_eq!(migrations.len(), 2);
        assert_eq!(migrations[0].version, 2);
        assert_eq!(migrations[1].version, 10);
    }

    #[test]
    fn test_duplicate_versions_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::write(dir.join("001_a.sql"), "SELECT 1;").unwrap();
        fs::write(dir.join("001_b.sql"), "SELECT 1;").unwrap();
        assert!(load_migrations(dir).is_err());
    }

    #[test]
    fn test_failed_migration_is_not_recorded() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("migrations");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("001_ok.sql"), "CREATE TABLE ok (id INTEGER);").unwrap();
        fs::write(dir.join("002_broken.sql"), "CREATE TABLE;").unwrap();
        let mut conn = Connection::open(temp_dir.path().join("test.db")).unwrap();

        assert!(run_migrations(&mut conn, &dir).is_err());
        assert_eq!(get_applied_migrations(&conn).unwrap(), vec!["001_ok".to_string()]);
    }

    #[test]
    fn test_full_migration_schema() {
        let temp_dir = TempDir::new().unwrap();
        let mut conn = Connection::open(temp_dir.path().join("test.db")).unwrap();
        let migrations_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
        run_migrations(&mut conn, &migrations_dir).unwrap();

        let names = |sql: &str| -> Vec<String> {
            conn.prepare(sql)
                .unwrap()
                .query_map([], |row| row.get::<_, String>(0))
                .unwrap()
                .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()
                .unwrap()
        };

        let tables = names("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name");
        assert!(tables.contains(&"entities".to_string()));
        assert!(tables.contains(&"relationships".to_string()));
        assert!(tables.contains(&"schema_migrations".to_string()));

        let indexes = names("SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%'");
        assert!(indexes.contains(&"idx_entities_selection".to_string()));
        assert!(indexes.contains(&"idx_relationships_target".to_string()));
    }

    #[test]
    fn test_migrations_are_applied_once() {
        let temp_dir = TempDir::new().unwrap();
        let mut conn = Connection::open(temp_dir.path().join("test.db")).unwrap();
        let migrations_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");

        run_migrations(&mut conn, &migrations_dir).unwrap();
        let first = get_applied_migrations(&conn).unwrap();
        run_migrations(&mut conn, &migrations_dir).unwrap();
        let second = get_applied_migrations(&conn).unwrap();

        assert!(!first.is_empty());
        assert_eq!(first, second);
    }
}
