use crate::paths::AppPaths;
use crate::Result;
use rusqlite::{Connection, OpenFlags};
use std::time::Duration;

pub fn open(paths: &AppPaths) -> Result<Connection> {
    paths.ensure_dirs()?;

    let db_path = paths.db_dir().join("app.sqlite");
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
    )?;

    conn.busy_timeout(Duration::from_secs(10))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    Ok(conn)
}

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS download (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  gallery_id TEXT NOT NULL,
  title TEXT NOT NULL,
  url TEXT NOT NULL,
  download_path TEXT NOT NULL,
  downloaded_at TEXT NOT NULL,
  files_count INTEGER NOT NULL,
  site TEXT NOT NULL,
  metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_download_gallery_id ON download(gallery_id);
CREATE INDEX IF NOT EXISTS idx_download_site ON download(site);
CREATE INDEX IF NOT EXISTS idx_download_downloaded_at ON download(downloaded_at);
"#,
    )?;

    // Backfill older installs that created `download` without `metadata`.
    let has_metadata = {
        let mut stmt = conn.prepare("PRAGMA table_info(download)")?;
        let mut rows = stmt.query([])?;
        let mut found = false;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            if name == "metadata" {
                found = true;
                break;
            }
        }
        found
    };
    if !has_metadata {
        conn.execute("ALTER TABLE download ADD COLUMN metadata TEXT", [])?;
    }

    let current_schema_version = 2;
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key='schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        Some(v) if v == current_schema_version.to_string() => {}
        _ => {
            conn.execute(
                "INSERT INTO meta(key, value) VALUES('schema_version', ?)
                 ON CONFLICT(key) DO UPDATE SET value=excluded.value",
                [current_schema_version.to_string()],
            )?;
        }
    }

    Ok(())
}

pub fn ensure_schema(paths: &AppPaths) -> Result<()> {
    let conn = open(paths)?;
    migrate(&conn)?;
    Ok(())
}

trait OptionalRowExt<T> {
    fn optional(self) -> rusqlite::Result<Option<T>>;
}

impl<T> OptionalRowExt<T> for rusqlite::Result<T> {
    fn optional(self) -> rusqlite::Result<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::AppPaths;

    #[test]
    fn migrate_adds_metadata_for_legacy_download_table() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        paths.ensure_dirs().expect("ensure dirs");
        let db_path = paths.db_dir().join("app.sqlite");

        {
            let conn = Connection::open(&db_path).expect("open");
            conn.execute_batch(
                r#"
CREATE TABLE IF NOT EXISTS download (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  gallery_id TEXT NOT NULL,
  title TEXT NOT NULL,
  url TEXT NOT NULL,
  download_path TEXT NOT NULL,
  downloaded_at TEXT NOT NULL,
  files_count INTEGER NOT NULL,
  site TEXT NOT NULL
);
"#,
            )
            .expect("create legacy download table");
        }

        let conn = open(&paths).expect("open migrated");
        migrate(&conn).expect("migrate");

        let mut stmt = conn
            .prepare("PRAGMA table_info(download)")
            .expect("table_info");
        let mut rows = stmt.query([]).expect("query table_info");
        let mut has_metadata = false;
        while let Some(row) = rows.next().expect("next row") {
            let name: String = row.get(1).expect("name");
            if name == "metadata" {
                has_metadata = true;
                break;
            }
        }
        assert!(has_metadata, "metadata column should exist after migrate");

        let version: String = conn
            .query_row(
                "SELECT value FROM meta WHERE key='schema_version'",
                [],
                |row| row.get(0),
            )
            .expect("schema_version");
        assert_eq!(version, "2");
    }
}
