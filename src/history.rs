use crate::config::HistoryConfig;
use crate::db;
use crate::paths::AppPaths;
use crate::site::GalleryInfo;
use crate::Result;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

/// Durable record of completed downloads, keyed by (gallery id, site).
/// Cheap to clone around worker threads; every operation opens its own
/// connection so the store itself holds no sqlite state.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    paths: AppPaths,
    max_entries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub gallery_id: String,
    pub title: String,
    pub url: String,
    pub download_path: String,
    pub downloaded_at: String,
    pub files_count: u32,
    pub site: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryStats {
    pub total_downloads: u64,
    pub total_files: u64,
    pub recent_downloads: u64,
    pub by_site: HashMap<String, u64>,
}

const ENTRY_COLUMNS: &str =
    "id, gallery_id, title, url, download_path, downloaded_at, files_count, site, metadata";

impl HistoryStore {
    pub fn new(paths: AppPaths, config: &HistoryConfig) -> Self {
        Self {
            paths,
            max_entries: config.max_history_entries,
        }
    }

    fn conn(&self) -> Result<Connection> {
        let conn = db::open(&self.paths)?;
        db::migrate(&conn)?;
        Ok(conn)
    }

    /// Inserts a record for a finished download unless one already exists for
    /// the (gallery id, site) pair, in which case the existing id is returned.
    /// The conditional insert is a single statement, so concurrent job
    /// completions racing on one gallery cannot write duplicate rows.
    pub fn record(
        &self,
        info: &GalleryInfo,
        download_path: &Path,
        files_count: u32,
        site: &str,
    ) -> Result<i64> {
        let conn = self.conn()?;
        let metadata = match &info.metadata {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };

        let inserted = conn.execute(
            "INSERT INTO download (gallery_id, title, url, download_path, downloaded_at, files_count, site, metadata)
             SELECT ?1, ?2, ?3, ?4, strftime('%Y-%m-%dT%H:%M:%S','now'), ?5, ?6, ?7
             WHERE NOT EXISTS (SELECT 1 FROM download WHERE gallery_id = ?1 AND site = ?6)",
            params![
                info.id,
                info.title,
                info.url,
                download_path.to_string_lossy(),
                files_count,
                site,
                metadata,
            ],
        )?;

        if inserted == 1 {
            return Ok(conn.last_insert_rowid());
        }

        match self.download_id_conn(&conn, &info.id, site)? {
            Some(id) => Ok(id),
            // The existing row vanished between the insert and the lookup
            // (concurrent clear/trim); treat as a fresh miss and insert.
            None => {
                conn.execute(
                    "INSERT INTO download (gallery_id, title, url, download_path, downloaded_at, files_count, site, metadata)
                     VALUES (?1, ?2, ?3, ?4, strftime('%Y-%m-%dT%H:%M:%S','now'), ?5, ?6, ?7)",
                    params![
                        info.id,
                        info.title,
                        info.url,
                        download_path.to_string_lossy(),
                        files_count,
                        site,
                        metadata,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    pub fn exists(&self, gallery_id: &str, site: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM download WHERE gallery_id = ?1 AND site = ?2",
            params![gallery_id, site],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Id of the latest entry for the key, or None when never downloaded.
    pub fn download_id(&self, gallery_id: &str, site: &str) -> Result<Option<i64>> {
        let conn = self.conn()?;
        self.download_id_conn(&conn, gallery_id, site)
    }

    fn download_id_conn(
        &self,
        conn: &Connection,
        gallery_id: &str,
        site: &str,
    ) -> Result<Option<i64>> {
        let row = conn.query_row(
            "SELECT id FROM download WHERE gallery_id = ?1 AND site = ?2
             ORDER BY downloaded_at DESC, id DESC LIMIT 1",
            params![gallery_id, site],
            |row| row.get::<_, i64>(0),
        );
        match row {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM download
             ORDER BY downloaded_at DESC, id DESC LIMIT ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], row_to_entry)?;
        let mut entries = Vec::new();
        for entry in rows {
            entries.push(entry?);
        }
        Ok(entries)
    }

    /// Case-insensitive substring search over titles and gallery ids.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn()?;
        let escaped = query
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let pattern = format!("%{escaped}%");
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM download
             WHERE title LIKE ?1 ESCAPE '\\' OR gallery_id LIKE ?1 ESCAPE '\\'
             ORDER BY downloaded_at DESC, id DESC LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![pattern, limit as i64], row_to_entry)?;
        let mut entries = Vec::new();
        for entry in rows {
            entries.push(entry?);
        }
        Ok(entries)
    }

    pub fn stats(&self) -> Result<HistoryStats> {
        let conn = self.conn()?;
        let total_downloads: i64 =
            conn.query_row("SELECT COUNT(*) FROM download", [], |row| row.get(0))?;
        let total_files: i64 = conn.query_row(
            "SELECT COALESCE(SUM(files_count), 0) FROM download",
            [],
            |row| row.get(0),
        )?;
        let recent_downloads: i64 = conn.query_row(
            "SELECT COUNT(*) FROM download
             WHERE downloaded_at >= strftime('%Y-%m-%dT%H:%M:%S','now','-7 days')",
            [],
            |row| row.get(0),
        )?;

        let mut by_site = HashMap::new();
        let mut stmt = conn.prepare("SELECT site, COUNT(*) FROM download GROUP BY site")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let site: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            by_site.insert(site, count.max(0) as u64);
        }

        Ok(HistoryStats {
            total_downloads: total_downloads.max(0) as u64,
            total_files: total_files.max(0) as u64,
            recent_downloads: recent_downloads.max(0) as u64,
            by_site,
        })
    }

    /// Deletes oldest entries beyond the cap (argument, else the configured
    /// retention cap). Returns the number of rows removed.
    pub fn trim(&self, max_entries: Option<usize>) -> Result<usize> {
        let cap = max_entries.unwrap_or(self.max_entries);
        let conn = self.conn()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM download", [], |row| row.get(0))?;
        let excess = total - cap as i64;
        if excess <= 0 {
            return Ok(0);
        }

        let deleted = conn.execute(
            "DELETE FROM download WHERE id IN (
                 SELECT id FROM download ORDER BY downloaded_at ASC, id ASC LIMIT ?1
             )",
            params![excess],
        )?;
        Ok(deleted)
    }

    pub fn clear(&self) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM download", [])?;
        Ok(deleted)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let metadata_raw: Option<String> = row.get(8)?;
    Ok(HistoryEntry {
        id: row.get(0)?,
        gallery_id: row.get(1)?,
        title: row.get(2)?,
        url: row.get(3)?,
        download_path: row.get(4)?,
        downloaded_at: row.get(5)?,
        files_count: row.get(6)?,
        site: row.get(7)?,
        metadata: metadata_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
    })
}
