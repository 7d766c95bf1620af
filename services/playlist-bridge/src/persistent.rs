//!
//! src/persistent.rs
//!
//! Durable store for playlist mappings. One row per mapping plus one
//! row per resolution, written together so a reader never sees half
//! of a sync
//!

use std::{path::Path, str::FromStr};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Pool, Row, Sqlite, SqliteConnection
};

use crate::errors::BridgeError;
use crate::types::{Outcome, PlaylistMapping, Platform, Resolution, Track};

#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn load_mapping(&self, source_playlist_id: &str)
        -> Result<Option<PlaylistMapping>, BridgeError>;

    /// Replaces any stored mapping for the same source playlist
    async fn save_mapping(&self, mapping: &PlaylistMapping) -> Result<(), BridgeError>;
}

pub struct Persistent {
    pool: Pool<Sqlite>
}

impl Persistent {
    pub async fn init(database_url: &str) -> Result<Self, BridgeError> {
        let in_memory = database_url.contains(":memory:");
        if !in_memory {
            ensure_parent_dir(database_url)?;
        }

        // pragmas ride on the connect options so every pooled connection gets them
        let mut options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| BridgeError::Config(format!("DATABASE_URL {database_url}: {e}")))?
            .create_if_missing(true)
            .foreign_keys(true)
            .synchronous(SqliteSynchronous::Normal);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // every pooled connection to :memory: would open its own database
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(if in_memory { 1 } else { 8 })
            .connect_with(options)
            .await
            .map_err(|e| BridgeError::Db(format!("connecting to sqlite at {database_url}: {e}")))?;

        let this = Self { pool };
        this.ensure_schema().await?;
        Ok( this )
    }

    async fn ensure_schema(&self) -> Result<(), BridgeError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mappings (
              source_playlist_id  TEXT PRIMARY KEY,
              source_platform     TEXT NOT NULL,
              target_platform     TEXT NOT NULL,
              target_playlist_id  TEXT NOT NULL,
              pending_removals    TEXT NOT NULL DEFAULT '[]',
              created_at          TEXT NOT NULL,
              last_synced_at      TEXT NOT NULL
            );
            "#
        ).execute(&self.pool).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resolutions (
              source_playlist_id  TEXT NOT NULL
                  REFERENCES mappings(source_playlist_id) ON DELETE CASCADE,
              position            INTEGER NOT NULL,
              source_track        TEXT NOT NULL,
              outcome             TEXT NOT NULL,
              attempted_at        TEXT NOT NULL,
              attempts            INTEGER NOT NULL,
              PRIMARY KEY (source_playlist_id, position)
            );
            "#
        ).execute(&self.pool).await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_mappings_target ON mappings(target_playlist_id);"
        ).execute(&self.pool).await?;

        Ok(())
    }

    fn parse_time(raw: &str) -> Result<DateTime<Utc>, BridgeError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| BridgeError::Parse(format!("timestamp {raw}: {e}")))
    }

    fn parse_platform(raw: &str) -> Result<Platform, BridgeError> {
        raw.parse::<Platform>()
            .map_err(|_| BridgeError::Parse(format!("stored platform {raw}")))
    }

    async fn load_resolutions(conn: &mut SqliteConnection, source_playlist_id: &str)
        -> Result<Vec<Resolution>, BridgeError> {
        let rows = sqlx::query(
            r#"
            SELECT source_track, outcome, attempted_at, attempts
              FROM resolutions
             WHERE source_playlist_id = ?1
             ORDER BY position ASC;
            "#
        )
        .bind(source_playlist_id)
        .fetch_all(&mut *conn)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<Resolution, BridgeError> {
                let source: Track = serde_json::from_str(&row.try_get::<String, _>("source_track")?)?;
                let outcome: Outcome = serde_json::from_str(&row.try_get::<String, _>("outcome")?)?;
                Ok(Resolution {
                    source,
                    outcome,
                    attempted_at: Self::parse_time(&row.try_get::<String, _>("attempted_at")?)?,
                    attempts: row.try_get::<i64, _>("attempts")?.try_into().unwrap_or(u32::MAX)
                })
            })
            .collect()
    }
}

/// Creates the directory holding a file-backed database
fn ensure_parent_dir(database_url: &str) -> Result<(), BridgeError> {
    let raw = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    let path = raw.split('?').next().unwrap_or(raw);
    match Path::new(path).parent() {
        Some(dir) if !dir.as_os_str().is_empty() => Ok(std::fs::create_dir_all(dir)?),
        _ => Ok(())
    }
}

#[async_trait]
impl MappingStore for Persistent {
    async fn load_mapping(&self, source_playlist_id: &str)
        -> Result<Option<PlaylistMapping>, BridgeError> {
        // one read transaction so both tables come from the same snapshot
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            SELECT source_platform, target_platform, target_playlist_id,
                   pending_removals, created_at, last_synced_at
              FROM mappings
             WHERE source_playlist_id = ?1;
            "#
        )
        .bind(source_playlist_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else { return Ok(None) };

        let mut mapping = PlaylistMapping {
            source_playlist_id: source_playlist_id.to_string(),
            source_platform: Self::parse_platform(&row.try_get::<String, _>("source_platform")?)?,
            target_platform: Self::parse_platform(&row.try_get::<String, _>("target_platform")?)?,
            target_playlist_id: row.try_get("target_playlist_id")?,
            resolutions: Vec::new(),
            pending_removals: serde_json::from_str(&row.try_get::<String, _>("pending_removals")?)?,
            created_at: Self::parse_time(&row.try_get::<String, _>("created_at")?)?,
            last_synced_at: Self::parse_time(&row.try_get::<String, _>("last_synced_at")?)?
        };
        drop(row);

        mapping.resolutions = Self::load_resolutions(&mut *tx, source_playlist_id).await?;
        tx.commit().await?;
        Ok(Some(mapping))
    }

    async fn save_mapping(&self, mapping: &PlaylistMapping) -> Result<(), BridgeError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO mappings (
                source_playlist_id, source_platform, target_platform,
                target_playlist_id, pending_removals, created_at, last_synced_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(source_playlist_id) DO UPDATE SET
                source_platform    = excluded.source_platform,
                target_platform    = excluded.target_platform,
                target_playlist_id = excluded.target_playlist_id,
                pending_removals   = excluded.pending_removals,
                last_synced_at     = excluded.last_synced_at;
            "#
        )
        .bind(&mapping.source_playlist_id)
        .bind(mapping.source_platform.as_str())
        .bind(mapping.target_platform.as_str())
        .bind(&mapping.target_playlist_id)
        .bind(serde_json::to_string(&mapping.pending_removals)?)
        .bind(mapping.created_at.to_rfc3339())
        .bind(mapping.last_synced_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM resolutions WHERE source_playlist_id = ?1;")
            .bind(&mapping.source_playlist_id)
            .execute(&mut *tx)
            .await?;

        for (position, r) in mapping.resolutions.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO resolutions (
                    source_playlist_id, position, source_track, outcome,
                    attempted_at, attempts
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);
                "#
            )
            .bind(&mapping.source_playlist_id)
            .bind(position as i64)
            .bind(serde_json::to_string(&r.source)?)
            .bind(serde_json::to_string(&r.outcome)?)
            .bind(r.attempted_at.to_rfc3339())
            .bind(i64::from(r.attempts))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::track;
    use crate::types::{FailureKind, NoMatchReason};

    fn mapping() -> PlaylistMapping {
        let now = Utc::now();
        let target = track(Platform::YouTube, "vid1", "Song A", "Band", Some(200));
        PlaylistMapping {
            source_playlist_id: "sp-playlist".into(),
            source_platform: Platform::Spotify,
            target_platform: Platform::YouTube,
            target_playlist_id: "yt-playlist".into(),
            resolutions: vec![
                Resolution::new(
                    track(Platform::Spotify, "a", "Song A", "Band", Some(201)),
                    Outcome::Matched { track: target, score: 0.93 },
                    1
                ),
                Resolution::new(
                    track(Platform::Spotify, "b", "Song B", "Band", None),
                    Outcome::NoMatch { reason: NoMatchReason::LowConfidence },
                    1
                ),
                Resolution::new(
                    track(Platform::Spotify, "c", "Song C", "Band", None),
                    Outcome::Failed { kind: FailureKind::Transient },
                    4
                ),
            ],
            pending_removals: vec!["vid9".into()],
            created_at: now,
            last_synced_at: now
        }
    }

    #[tokio::test]
    async fn missing_mapping_loads_as_none() {
        let db = Persistent::init("sqlite::memory:").await.unwrap();
        assert!(db.load_mapping("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn saved_mapping_loads_back_in_order() {
        let db = Persistent::init("sqlite::memory:").await.unwrap();
        let m = mapping();
        db.save_mapping(&m).await.unwrap();

        let loaded = db.load_mapping("sp-playlist").await.unwrap().unwrap();
        assert_eq!(loaded.target_playlist_id, "yt-playlist");
        assert_eq!(loaded.target_platform, Platform::YouTube);
        assert_eq!(loaded.pending_removals, vec!["vid9".to_string()]);
        assert_eq!(loaded.resolutions.len(), 3);
        for (a, b) in loaded.resolutions.iter().zip(&m.resolutions) {
            assert!(a.same_content(b));
            assert_eq!(a.attempts, b.attempts);
        }
    }

    #[tokio::test]
    async fn save_replaces_previous_resolutions() {
        let db = Persistent::init("sqlite::memory:").await.unwrap();
        let mut m = mapping();
        db.save_mapping(&m).await.unwrap();

        m.resolutions.truncate(1);
        m.pending_removals.clear();
        m.last_synced_at = Utc::now();
        db.save_mapping(&m).await.unwrap();

        let loaded = db.load_mapping("sp-playlist").await.unwrap().unwrap();
        assert_eq!(loaded.resolutions.len(), 1);
        assert!(loaded.pending_removals.is_empty());
        assert_eq!(loaded.created_at.timestamp(), m.created_at.timestamp());
    }

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("nested/bridge.db").display());

        let db = Persistent::init(&url).await.unwrap();
        db.save_mapping(&mapping()).await.unwrap();
        drop(db);

        let reopened = Persistent::init(&url).await.unwrap();
        let loaded = reopened.load_mapping("sp-playlist").await.unwrap().unwrap();
        assert_eq!(loaded.resolutions.len(), 3);
    }

    #[tokio::test]
    async fn pooled_connections_enforce_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("fk.db").display());
        let db = Persistent::init(&url).await.unwrap();
        db.save_mapping(&mapping()).await.unwrap();

        let mut conns = Vec::new();
        for _ in 0..4 {
            conns.push(db.pool.acquire().await.unwrap());
        }
        for conn in conns.iter_mut() {
            let on: i64 = sqlx::query_scalar("PRAGMA foreign_keys;")
                .fetch_one(&mut **conn)
                .await
                .unwrap();
            assert_eq!(on, 1);
        }
        drop(conns);

        sqlx::query("DELETE FROM mappings WHERE source_playlist_id = ?1;")
            .bind("sp-playlist")
            .execute(&db.pool)
            .await
            .unwrap();
        let left: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM resolutions;")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(left, 0);
    }
}
