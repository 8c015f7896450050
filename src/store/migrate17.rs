//! Migration 17: collapses duplicate entries that predate the content-hash
//! dedup key, then swaps the old `(feed_id, url)` uniqueness constraint for
//! a `(feed_id, hash)` one. Named to match the numbering spec.md uses when
//! describing this step, so cross-referencing the design notes against a
//! running database stays unambiguous.

use std::collections::HashMap;

use rusqlite::{params, params_from_iter, Transaction};

use super::migrate::{column_exists, MigrationError};
use crate::util::{derive_entry_hash, strip_fragment};

/// SQL variable-bind ceiling; batches of deleted ids stay under this.
const DELETE_BATCH_SIZE: usize = 500;

struct Row {
    id: i64,
    url: Option<String>,
    title: Option<String>,
    content: Option<String>,
    updated_at: String,
    read: i64,
    starred: i64,
}

/// The key duplicate entries are grouped by within a feed, before the hash
/// column existed: the fragment-stripped URL when present, else title+content,
/// else the row's own id (forcing a singleton group).
fn legacy_merge_key(row: &Row) -> String {
    if let Some(url) = row.url.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        return format!("url:{}", strip_fragment(url));
    }
    let title = row.title.as_deref().unwrap_or("").trim();
    let content = row.content.as_deref().unwrap_or("").trim();
    if !title.is_empty() || !content.is_empty() {
        return format!("content:{title}\n{content}");
    }
    format!("id:{}", row.id)
}

/// True if `candidate` should replace `current` as the surviving row:
/// more recently updated wins, ties broken by the higher id.
fn is_better(candidate: &Row, current: &Row) -> bool {
    (candidate.updated_at.as_str(), candidate.id) > (current.updated_at.as_str(), current.id)
}

const AI_CACHE_TABLES: &[&str] = &["ai_summaries", "ai_translations", "ai_list_translations"];

pub(crate) fn run(tx: &Transaction) -> Result<(), MigrationError> {
    if !column_exists(tx, "entries", "hash")? {
        tx.execute("ALTER TABLE entries ADD COLUMN hash TEXT NOT NULL DEFAULT ''", [])?;
    }

    let mut by_feed: HashMap<i64, Vec<Row>> = HashMap::new();
    {
        let mut stmt = tx.prepare(
            "SELECT id, feed_id, url, title, content, updated_at, read, starred FROM entries ORDER BY id",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, i64>(1)?,
                Row {
                    id: r.get(0)?,
                    url: r.get(2)?,
                    title: r.get(3)?,
                    content: r.get(4)?,
                    updated_at: r.get(5)?,
                    read: r.get(6)?,
                    starred: r.get(7)?,
                },
            ))
        })?;
        for row in rows {
            let (feed_id, row) = row?;
            by_feed.entry(feed_id).or_default().push(row);
        }
    }

    let mut delete_ids: Vec<i64> = Vec::new();

    for (_feed_id, rows) in by_feed {
        let mut groups: HashMap<String, Vec<Row>> = HashMap::new();
        for row in rows {
            groups.entry(legacy_merge_key(&row)).or_default().push(row);
        }

        for (_, mut group) in groups {
            if group.len() < 2 {
                let row = &group[0];
                let hash = derive_entry_hash(row.id, row.url.as_deref(), row.title.as_deref(), row.content.as_deref());
                tx.execute("UPDATE entries SET hash = ?1 WHERE id = ?2", params![hash, row.id])?;
                continue;
            }

            let mut survivor_idx = 0;
            for (idx, row) in group.iter().enumerate().skip(1) {
                if is_better(row, &group[survivor_idx]) {
                    survivor_idx = idx;
                }
            }
            let survivor = group.swap_remove(survivor_idx);
            let duplicates = group; // everything but the survivor

            let merged_read = duplicates.iter().map(|r| r.read).chain(std::iter::once(survivor.read)).max().unwrap_or(0);
            let merged_starred =
                duplicates.iter().map(|r| r.starred).chain(std::iter::once(survivor.starred)).max().unwrap_or(0);
            tx.execute(
                "UPDATE entries SET read = ?1, starred = ?2 WHERE id = ?3",
                params![merged_read, merged_starred, survivor.id],
            )?;

            for dup in &duplicates {
                relocate_ai_cache_rows(tx, dup.id, survivor.id)?;
                delete_ids.push(dup.id);
            }

            let hash = derive_entry_hash(
                survivor.id,
                survivor.url.as_deref(),
                survivor.title.as_deref(),
                survivor.content.as_deref(),
            );
            tx.execute("UPDATE entries SET hash = ?1 WHERE id = ?2", params![hash, survivor.id])?;
        }
    }

    for chunk in delete_ids.chunks(DELETE_BATCH_SIZE) {
        let placeholders = vec!["?"; chunk.len()].join(",");
        let sql = format!("DELETE FROM entries WHERE id IN ({placeholders})");
        tx.execute(&sql, params_from_iter(chunk.iter()))?;
    }

    let residual_groups: i64 = tx.query_row(
        "SELECT COUNT(*) FROM (SELECT feed_id, hash FROM entries GROUP BY feed_id, hash HAVING COUNT(*) > 1)",
        [],
        |row| row.get(0),
    )?;
    if residual_groups > 0 {
        return Err(MigrationError::Integrity { groups: residual_groups as usize });
    }

    tx.execute("DROP INDEX IF EXISTS idx_entries_feed_url", [])?;
    tx.execute("CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_feed_hash ON entries(feed_id, hash)", [])?;

    Ok(())
}

/// Moves AI-cache rows referencing `from_entry` onto `survivor_entry`.
/// `UPDATE OR IGNORE` lets a row that would collide with one the survivor
/// already has simply stay put (under its doomed `entry_id`); the
/// follow-up `DELETE` then removes whatever didn't relocate, instead of
/// leaving an orphan once `from_entry` is deleted.
fn relocate_ai_cache_rows(tx: &Transaction, from_entry: i64, survivor_entry: i64) -> Result<(), rusqlite::Error> {
    for table in AI_CACHE_TABLES {
        tx.execute(
            &format!("UPDATE OR IGNORE {table} SET entry_id = ?1 WHERE entry_id = ?2"),
            params![survivor_entry, from_entry],
        )?;
        tx.execute(&format!("DELETE FROM {table} WHERE entry_id = ?1"), params![from_entry])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::migrate::MigrationEngine;
    use rusqlite::Connection;

    fn seed_pre17_schema(conn: &mut Connection) {
        // Run the engine once on a fresh db to get the base schema plus
        // migrations 1-11, but stop short of 17 by dropping its index
        // check bypass: simplest is to run the full engine, then recreate
        // the legacy (feed_id, url) uniqueness and strip the hash index so
        // migration 17 sees an unmigrated database.
        MigrationEngine::default().run(conn).unwrap();
        conn.execute_batch(
            "DROP INDEX IF EXISTS idx_entries_feed_hash;
             CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_feed_url ON entries(feed_id, url);",
        )
        .unwrap();
    }

    #[test]
    fn scenario_c_merges_three_entries_into_survivor() {
        let mut conn = Connection::open_in_memory().unwrap();
        // Build a database already past migrations 1-11 but pre-17, with
        // duplicate rows 1/2/3 in feed 7 sharing one URL, id 2 most recent.
        conn.execute_batch(
            "CREATE TABLE folders (id INTEGER PRIMARY KEY, parent_id INTEGER, title TEXT NOT NULL, type TEXT NOT NULL DEFAULT 'article', created_at TEXT NOT NULL, updated_at TEXT NOT NULL);
             CREATE TABLE feeds (id INTEGER PRIMARY KEY, folder_id INTEGER, title TEXT NOT NULL, feed_url TEXT NOT NULL UNIQUE, site_url TEXT, description TEXT, etag TEXT, last_modified TEXT, icon_path TEXT, error_message TEXT, type TEXT NOT NULL DEFAULT 'article', created_at TEXT NOT NULL, updated_at TEXT NOT NULL);
             CREATE TABLE entries (id INTEGER PRIMARY KEY, feed_id INTEGER NOT NULL, url TEXT, title TEXT, content TEXT, author TEXT, published_at TEXT, read INTEGER NOT NULL DEFAULT 0, starred INTEGER NOT NULL DEFAULT 0, readable_content TEXT, thumbnail_url TEXT, created_at TEXT NOT NULL, updated_at TEXT NOT NULL);
             CREATE TABLE ai_summaries (id INTEGER PRIMARY KEY, entry_id INTEGER NOT NULL, mode TEXT NOT NULL, language TEXT NOT NULL DEFAULT '', content TEXT NOT NULL, created_at TEXT NOT NULL);
             CREATE UNIQUE INDEX idx_ai_summaries_entry_mode_language ON ai_summaries(entry_id, mode, language);
             CREATE TABLE ai_translations (id INTEGER PRIMARY KEY, entry_id INTEGER NOT NULL, mode TEXT NOT NULL, language TEXT NOT NULL DEFAULT '', content TEXT NOT NULL, created_at TEXT NOT NULL);
             CREATE TABLE ai_list_translations (id INTEGER PRIMARY KEY, entry_id INTEGER NOT NULL, mode TEXT NOT NULL, language TEXT NOT NULL DEFAULT '', content TEXT NOT NULL, created_at TEXT NOT NULL);
             INSERT INTO feeds (id, title, feed_url, created_at, updated_at) VALUES (7, 'Feed', 'http://f/feed.xml', 't', 't');
             INSERT INTO entries (id, feed_id, url, title, read, starred, created_at, updated_at) VALUES
                (1, 7, 'http://x/a', 'A', 0, 0, 't', '2024-01-01T00:00:00Z'),
                (2, 7, 'http://x/a', 'A', 1, 0, 't', '2024-01-03T00:00:00Z'),
                (3, 7, 'http://x/a', 'A', 0, 1, 't', '2024-01-02T00:00:00Z');
             INSERT INTO ai_summaries (entry_id, mode, language, content, created_at) VALUES (1, 'short', 'en', 'sum-1', 't');
             ",
        )
        .unwrap();

        let tx = conn.transaction().unwrap();
        super::run(&tx).unwrap();
        tx.commit().unwrap();

        let remaining: Vec<i64> = {
            let mut stmt = conn.prepare("SELECT id FROM entries ORDER BY id").unwrap();
            stmt.query_map([], |r| r.get(0)).unwrap().map(Result::unwrap).collect()
        };
        assert_eq!(remaining, vec![2]);

        let (read, starred): (i64, i64) =
            conn.query_row("SELECT read, starred FROM entries WHERE id = 2", [], |r| Ok((r.get(0)?, r.get(1)?))).unwrap();
        assert_eq!(read, 1);
        assert_eq!(starred, 1);

        let relocated: i64 =
            conn.query_row("SELECT COUNT(*) FROM ai_summaries WHERE entry_id = 2", [], |r| r.get(0)).unwrap();
        assert_eq!(relocated, 1);
    }

    #[test]
    fn running_on_already_migrated_db_is_a_no_op() {
        let mut conn = Connection::open_in_memory().unwrap();
        seed_pre17_schema(&mut conn);
        conn.execute(
            "INSERT INTO feeds (id, title, feed_url, created_at, updated_at) VALUES (1, 'F', 'http://f/feed.xml', 't', 't')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO entries (feed_id, url, title, created_at, updated_at) VALUES (1, 'http://f/a', 'A', 't', 't')",
            [],
        )
        .unwrap();

        {
            let tx = conn.transaction().unwrap();
            super::run(&tx).unwrap();
            tx.commit().unwrap();
        }
        let count_before: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |r| r.get(0)).unwrap();

        {
            let tx = conn.transaction().unwrap();
            super::run(&tx).unwrap();
            tx.commit().unwrap();
        }
        let count_after: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |r| r.get(0)).unwrap();
        assert_eq!(count_before, count_after);
    }
}
