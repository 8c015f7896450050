//! Schema migration engine: base schema + an ordered, append-only list of
//! idempotent numbered migrations. Each migration probes table metadata
//! before mutating rather than relying on a stored "current version"
//! counter (spec.md §9: "the repository's convention is stateless
//! idempotence, which survives reversions").

use rusqlite::{Connection, OptionalExtension, Transaction};
use thiserror::Error;

use super::migrate17;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("migration 17 integrity check failed: {groups} duplicate group(s) remained after merge")]
    Integrity { groups: usize },
}

const BASE_SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS folders (
        id INTEGER PRIMARY KEY,
        parent_id INTEGER REFERENCES folders(id) ON DELETE CASCADE,
        title TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS feeds (
        id INTEGER PRIMARY KEY,
        folder_id INTEGER REFERENCES folders(id) ON DELETE SET NULL,
        title TEXT NOT NULL,
        feed_url TEXT NOT NULL UNIQUE,
        site_url TEXT,
        description TEXT,
        etag TEXT,
        last_modified TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS entries (
        id INTEGER PRIMARY KEY,
        feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
        url TEXT,
        title TEXT,
        content TEXT,
        author TEXT,
        published_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_feed_url ON entries(feed_id, url);

    CREATE VIRTUAL TABLE IF NOT EXISTS entries_fts USING fts5(
        title, content, content='entries', content_rowid='id'
    );

    CREATE TRIGGER IF NOT EXISTS entries_ai AFTER INSERT ON entries BEGIN
        INSERT INTO entries_fts(rowid, title, content) VALUES (new.id, new.title, new.content);
    END;

    CREATE TRIGGER IF NOT EXISTS entries_au AFTER UPDATE ON entries BEGIN
        INSERT INTO entries_fts(entries_fts, rowid, title, content) VALUES('delete', old.id, old.title, old.content);
        INSERT INTO entries_fts(rowid, title, content) VALUES (new.id, new.title, new.content);
    END;

    CREATE TRIGGER IF NOT EXISTS entries_ad AFTER DELETE ON entries BEGIN
        INSERT INTO entries_fts(entries_fts, rowid, title, content) VALUES('delete', old.id, old.title, old.content);
    END;
";

pub(crate) fn column_exists(tx: &Transaction, table: &str, column: &str) -> Result<bool, rusqlite::Error> {
    let mut stmt = tx.prepare(&format!("PRAGMA table_info({table})"))?;
    let found = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(Result::ok)
        .any(|name| name == column);
    Ok(found)
}

fn index_exists(tx: &Transaction, name: &str) -> Result<bool, rusqlite::Error> {
    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn trigger_exists(tx: &Transaction, name: &str) -> Result<bool, rusqlite::Error> {
    let count: i64 = tx.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn trigger_sql(tx: &Transaction, name: &str) -> Result<Option<String>, rusqlite::Error> {
    tx.query_row("SELECT sql FROM sqlite_master WHERE type = 'trigger' AND name = ?1", [name], |row| row.get(0))
        .optional()
}

fn add_column_if_missing(tx: &Transaction, table: &str, column: &str, ddl: &str) -> Result<(), rusqlite::Error> {
    if !column_exists(tx, table, column)? {
        tx.execute(&format!("ALTER TABLE {table} ADD COLUMN {ddl}"), [])?;
    }
    Ok(())
}

fn migration_01_read_starred_columns(tx: &Transaction) -> Result<(), rusqlite::Error> {
    add_column_if_missing(tx, "entries", "read", "read INTEGER NOT NULL DEFAULT 0")?;
    add_column_if_missing(tx, "entries", "starred", "starred INTEGER NOT NULL DEFAULT 0")?;
    Ok(())
}

fn migration_02_auxiliary_text_columns(tx: &Transaction) -> Result<(), rusqlite::Error> {
    add_column_if_missing(tx, "entries", "readable_content", "readable_content TEXT")?;
    add_column_if_missing(tx, "entries", "thumbnail_url", "thumbnail_url TEXT")?;
    add_column_if_missing(tx, "feeds", "icon_path", "icon_path TEXT")?;
    add_column_if_missing(tx, "feeds", "error_message", "error_message TEXT")?;
    Ok(())
}

fn migration_03_feed_type_column(tx: &Transaction) -> Result<(), rusqlite::Error> {
    add_column_if_missing(tx, "feeds", "type", "type TEXT NOT NULL DEFAULT 'article'")
}

fn migration_04_folder_type_column(tx: &Transaction) -> Result<(), rusqlite::Error> {
    add_column_if_missing(tx, "folders", "type", "type TEXT NOT NULL DEFAULT 'article'")
}

fn migration_05_drop_entries_after_update_trigger(tx: &Transaction) -> Result<(), rusqlite::Error> {
    if trigger_exists(tx, "entries_au")? {
        tx.execute("DROP TRIGGER entries_au", [])?;
    }
    Ok(())
}

fn migration_06_recreate_entries_after_delete_trigger(tx: &Transaction) -> Result<(), rusqlite::Error> {
    let already_direct = trigger_sql(tx, "entries_ad")?
        .map(|sql| sql.contains("DELETE FROM entries_fts"))
        .unwrap_or(false);
    if already_direct {
        return Ok(());
    }
    tx.execute("DROP TRIGGER IF EXISTS entries_ad", [])?;
    tx.execute(
        "CREATE TRIGGER entries_ad AFTER DELETE ON entries BEGIN DELETE FROM entries_fts WHERE rowid = old.id; END;",
        [],
    )?;
    Ok(())
}

fn migration_07_settings_table(tx: &Transaction) -> Result<(), rusqlite::Error> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )
}

fn ai_table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY,
            entry_id INTEGER NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
            mode TEXT NOT NULL,
            language TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_{table}_entry_mode_language ON {table}(entry_id, mode, language);"
    )
}

fn migration_08_ai_summaries_table(tx: &Transaction) -> Result<(), rusqlite::Error> {
    tx.execute_batch(&ai_table_ddl("ai_summaries"))
}

fn migration_09_ai_translations_table(tx: &Transaction) -> Result<(), rusqlite::Error> {
    tx.execute_batch(&ai_table_ddl("ai_translations"))
}

fn migration_10_ai_list_translations_table(tx: &Transaction) -> Result<(), rusqlite::Error> {
    tx.execute_batch(&ai_table_ddl("ai_list_translations"))
}

fn migration_11_domain_rate_limits_table(tx: &Transaction) -> Result<(), rusqlite::Error> {
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS domain_rate_limits (
            domain TEXT PRIMARY KEY,
            next_allowed_at TEXT NOT NULL,
            backoff_seconds INTEGER NOT NULL DEFAULT 0
        );",
    )
}

fn migration_17_hash_dedup(tx: &Transaction) -> Result<(), MigrationError> {
    if index_exists(tx, "idx_entries_feed_hash")? {
        return Ok(());
    }
    migrate17::run(tx)
}

/// Applies the base schema followed by the ordered migration list.
/// Migration numbers 12-16 are intentionally unused: spec.md enumerates
/// the base-schema additions and auxiliary tables as migrations 1-11
/// above, then calls out migration 17 by that exact number for the
/// hash-dedup step; no migration content was specified for 12-16.
#[derive(Default)]
pub struct MigrationEngine;

impl MigrationEngine {
    pub fn run(&self, conn: &mut Connection) -> Result<(), MigrationError> {
        conn.execute_batch(BASE_SCHEMA)?;

        let tx = conn.transaction()?;
        migration_01_read_starred_columns(&tx)?;
        migration_02_auxiliary_text_columns(&tx)?;
        migration_03_feed_type_column(&tx)?;
        migration_04_folder_type_column(&tx)?;
        migration_05_drop_entries_after_update_trigger(&tx)?;
        migration_06_recreate_entries_after_delete_trigger(&tx)?;
        migration_07_settings_table(&tx)?;
        migration_08_ai_summaries_table(&tx)?;
        migration_09_ai_translations_table(&tx)?;
        migration_10_ai_list_translations_table(&tx)?;
        migration_11_domain_rate_limits_table(&tx)?;
        tx.commit()?;

        // Migration 17 gets its own transaction: a failed integrity check
        // must roll back only the merge, not the preceding (idempotent,
        // already-committed) schema migrations.
        let tx = conn.transaction()?;
        migration_17_hash_dedup(&tx)?;
        tx.commit()?;

        Ok(())
    }
}
