//!
//! src/persistent.rs  Andrew Belles  Oct 3rd, 2025
//!
//! Station record store. Stations live in an sqlite database along with
//! the last known now playing / last played track that the scrobble
//! daemon denormalizes into each row
//!

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, Pool, Row, Sqlite};

use crate::errors::AggregatorError;

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct StationRecord {
    pub username: String,
    pub station_url: Option<String>,
    pub stream_url: Option<String>,
    pub profile_image_url: Option<String>,
    pub disabled: bool,
    pub now_playing_artist: Option<String>,
    pub now_playing_track: Option<String>,
    pub last_played_artist: Option<String>,
    pub last_played_track: Option<String>
}

impl StationRecord {
    pub fn new(username: &str) -> Self {
        Self { username: username.to_string(), ..Default::default() }
    }
}

/// Listing access to the persistent station documents
#[async_trait]
pub trait StationStore: Send + Sync {
    async fn list_stations(&self) -> Result<Vec<StationRecord>, AggregatorError>;
}

pub struct Persistent {
    pool: Pool<Sqlite>
}

impl Persistent {

    async fn ensure_schema(pool: &Pool<Sqlite>) -> Result<(), AggregatorError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS stations (
              username            TEXT PRIMARY KEY,
              station_url         TEXT,
              stream_url          TEXT,
              profile_image_url   TEXT,
              disabled            INTEGER NOT NULL DEFAULT 0,
              now_playing_artist  TEXT,
              now_playing_track   TEXT,
              last_played_artist  TEXT,
              last_played_track   TEXT,
              created_at          INTEGER NOT NULL,
              updated_at          INTEGER NOT NULL
            );
            "
        ).execute(pool).await?;

        Ok(())
    }

    pub async fn init(database_url: &str) -> Result<Self, AggregatorError> {
        let is_memory = database_url == "sqlite::memory:";

        let mut opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true);

        // WAL is file-only; don't set it for in-memory
        if !is_memory {
            opts = opts.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                       .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);
        }

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(if is_memory {1} else {8})
            .connect_with(opts)
            .await?;

        Self::ensure_schema(&pool).await?;

        Ok(Self { pool })
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }

    /// Inserts or replaces a station row, used for seeding
    pub async fn upsert_station(&self, station: &StationRecord) -> Result<(), AggregatorError> {
        if station.username.trim().is_empty() {
            return Err(AggregatorError::Db("missing station username".into()));
        }

        sqlx::query(
            r"
            INSERT INTO stations (
                username, station_url, stream_url, profile_image_url, disabled,
                now_playing_artist, now_playing_track, last_played_artist,
                last_played_track, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
            ON CONFLICT(username) DO UPDATE SET
                station_url        = excluded.station_url,
                stream_url         = excluded.stream_url,
                profile_image_url  = excluded.profile_image_url,
                disabled           = excluded.disabled,
                now_playing_artist = excluded.now_playing_artist,
                now_playing_track  = excluded.now_playing_track,
                last_played_artist = excluded.last_played_artist,
                last_played_track  = excluded.last_played_track,
                updated_at         = excluded.updated_at;
            "
        )
        .bind(&station.username)
        .bind(station.station_url.as_ref())
        .bind(station.stream_url.as_ref())
        .bind(station.profile_image_url.as_ref())
        .bind(i32::from(station.disabled))
        .bind(station.now_playing_artist.as_ref())
        .bind(station.now_playing_track.as_ref())
        .bind(station.last_played_artist.as_ref())
        .bind(station.last_played_track.as_ref())
        .bind(Self::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count_stations(&self) -> Result<i64, AggregatorError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM stations;")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl StationStore for Persistent {
    async fn list_stations(&self) -> Result<Vec<StationRecord>, AggregatorError> {
        let rows = sqlx::query(
            r"
            SELECT username, station_url, stream_url, profile_image_url, disabled,
                   now_playing_artist, now_playing_track,
                   last_played_artist, last_played_track
              FROM stations
             ORDER BY username;
            "
        )
        .fetch_all(&self.pool)
        .await?;

        let stations = rows.into_iter()
            .map(|row| StationRecord {
                username: row.get("username"),
                station_url: row.get("station_url"),
                stream_url: row.get("stream_url"),
                profile_image_url: row.get("profile_image_url"),
                disabled: row.get::<i64, _>("disabled") != 0,
                now_playing_artist: row.get("now_playing_artist"),
                now_playing_track: row.get("now_playing_track"),
                last_played_artist: row.get("last_played_artist"),
                last_played_track: row.get("last_played_track"),
            })
            .collect();

        Ok(stations)
    }
}
