use rusqlite::{params, Connection};
use std::path::Path;

use catalog_core::RecordIdentity;

use crate::pipeline::ingestion::envelope::Cursor;

/// Local metadata store for the ingestion pipeline: cross-run dedup
/// identities, resume cursors, and per-source fetch cadence.
///
/// Opened short-lived around each use; the database lives under
/// `{data_root}/ingest/meta.db`.
pub struct IngestMeta {
    conn: Connection,
}

impl IngestMeta {
    pub fn open_at_root<P: AsRef<Path>>(data_root: P) -> anyhow::Result<Self> {
        let db_path = data_root.as_ref().join("ingest").join("meta.db");
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS seen_identities (
                source_id     TEXT NOT NULL,
                identity      TEXT NOT NULL,
                first_seen_at INTEGER NOT NULL,
                PRIMARY KEY (source_id, identity)
            );
            CREATE TABLE IF NOT EXISTS resume_cursors (
                source_id  TEXT PRIMARY KEY,
                cursor     TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS fetch_cadence (
                source_id        TEXT PRIMARY KEY,
                last_fetched_at  INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self { conn })
    }

    // Cross-run dedup identities

    pub fn load_identities(&self, source_id: &str) -> anyhow::Result<Vec<RecordIdentity>> {
        let mut stmt = self
            .conn
            .prepare("SELECT identity FROM seen_identities WHERE source_id = ?1")?;
        let rows = stmt.query_map(params![source_id], |row| row.get::<_, String>(0))?;
        let mut identities = Vec::new();
        for row in rows {
            identities.push(RecordIdentity::from_stored(row?));
        }
        Ok(identities)
    }

    pub fn record_identities(
        &mut self,
        source_id: &str,
        identities: &[RecordIdentity],
        now_ts: i64,
    ) -> anyhow::Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO seen_identities (source_id, identity, first_seen_at)
                 VALUES (?1, ?2, ?3)",
            )?;
            for identity in identities {
                stmt.execute(params![source_id, identity.as_str(), now_ts])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // Resume cursors

    pub fn get_resume_cursor(&self, source_id: &str) -> anyhow::Result<Option<Cursor>> {
        let mut stmt = self
            .conn
            .prepare("SELECT cursor FROM resume_cursors WHERE source_id = ?1")?;
        let mut rows = stmt.query(params![source_id])?;
        if let Some(row) = rows.next()? {
            let token: String = row.get(0)?;
            Ok(Some(Cursor::new(token)))
        } else {
            Ok(None)
        }
    }

    pub fn set_resume_cursor(&self, source_id: &str, cursor: &Cursor, now_ts: i64) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO resume_cursors (source_id, cursor, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(source_id) DO UPDATE SET cursor=excluded.cursor, updated_at=excluded.updated_at",
            params![source_id, cursor.as_str(), now_ts],
        )?;
        Ok(())
    }

    pub fn clear_resume_cursor(&self, source_id: &str) -> anyhow::Result<()> {
        self.conn.execute(
            "DELETE FROM resume_cursors WHERE source_id = ?1",
            params![source_id],
        )?;
        Ok(())
    }

    // Fetch cadence

    pub fn get_last_fetched_at(&self, source_id: &str) -> anyhow::Result<Option<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT last_fetched_at FROM fetch_cadence WHERE source_id = ?1")?;
        let mut rows = stmt.query(params![source_id])?;
        if let Some(row) = rows.next()? {
            let ts: i64 = row.get(0)?;
            Ok(Some(ts))
        } else {
            Ok(None)
        }
    }

    pub fn set_last_fetched_at(&self, source_id: &str, ts: i64) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO fetch_cadence (source_id, last_fetched_at) VALUES (?1, ?2)
             ON CONFLICT(source_id) DO UPDATE SET last_fetched_at=excluded.last_fetched_at",
            params![source_id, ts],
        )?;
        Ok(())
    }
}
