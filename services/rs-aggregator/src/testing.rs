//!
//! src/testing.rs  Andrew Belles  Oct 4th, 2025
//!
//! In-process fakes for the upstream, the cache store and the station
//! store, plus builders for last.fm shaped response bodies
//!

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::cache::CacheStore;
use crate::errors::AggregatorError;
use crate::fetch::Upstream;
use crate::persistent::{StationRecord, StationStore};
use crate::types::Identifier;

pub fn user_info_body(image: Option<&str>) -> Value {
    let mut images = vec![json!({"size": "small", "#text": "https://img/small.png"})];
    if let Some(url) = image {
        images.push(json!({"size": "large", "#text": url}));
    }
    json!({"user": {"name": "someone", "image": images}})
}

pub fn recent_tracks_body(tracks: &[(&str, &str, bool)]) -> Value {
    let tracks: Vec<Value> = tracks.iter()
        .map(|(artist, name, now_playing)| {
            let mut t = json!({
                "artist": {"#text": artist},
                "name": name,
                "url": format!("https://www.last.fm/music/{artist}/_/{name}"),
                "image": [{"size": "small", "#text": ""}]
            });
            if *now_playing {
                t["@attr"] = json!({"nowplaying": "true"});
            }
            t
        })
        .collect();
    json!({"recenttracks": {"track": tracks}})
}

pub fn comparison_body(score: &str) -> Value {
    json!({"comparison": {"result": {"score": score}}})
}

/// Upstream backed by fixed bodies. Unknown users fail like last.fm's
/// "user not found", unknown pairs compare without a score
#[derive(Default)]
pub struct FakeUpstream {
    profiles: HashMap<String, Value>,
    recent: HashMap<String, Value>,
    scores: HashMap<(String, String), Value>,
    failing: HashSet<String>,
    calls: AtomicUsize
}

impl FakeUpstream {
    pub fn with_profile(mut self, user: &str, image: Option<&str>) -> Self {
        self.profiles.insert(user.to_string(), user_info_body(image));
        self
    }

    pub fn with_recent(self, user: &str, tracks: &[(&str, &str, bool)]) -> Self {
        self.with_raw_recent(user, recent_tracks_body(tracks))
    }

    pub fn with_raw_recent(mut self, user: &str, body: Value) -> Self {
        self.recent.insert(user.to_string(), body);
        self
    }

    pub fn with_score(mut self, user: &str, other: &str, score: &str) -> Self {
        self.scores.insert((user.to_string(), other.to_string()), comparison_body(score));
        self
    }

    pub fn failing(mut self, user: &str) -> Self {
        self.failing.insert(user.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(&self, user: &Identifier, body: Option<&Value>) -> Result<Value, AggregatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(user.as_str()) {
            return Err(AggregatorError::UpstreamUnavailable(format!("{user} unreachable")));
        }
        body.cloned()
            .ok_or_else(|| AggregatorError::UpstreamUnavailable(format!("no such user {user}")))
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn user_info(&self, user: &Identifier) -> Result<Value, AggregatorError> {
        self.answer(user, self.profiles.get(user.as_str()))
    }

    async fn recent_tracks(&self, user: &Identifier, _limit: u32)
        -> Result<Value, AggregatorError> {
        self.answer(user, self.recent.get(user.as_str()))
    }

    async fn compare(&self, user: &Identifier, other: &Identifier)
        -> Result<Value, AggregatorError> {
        let empty = json!({"comparison": {"result": {}}});
        let key = (user.as_str().to_string(), other.as_str().to_string());
        self.answer(other, Some(self.scores.get(&key).unwrap_or(&empty)))
    }
}

/// Cache store counting traffic and remembering each key's ttl
#[derive(Default)]
pub struct CountingStore {
    entries: Mutex<HashMap<String, (Vec<u8>, u64)>>,
    gets: AtomicUsize,
    sets: AtomicUsize,
    fail: bool
}

impl CountingStore {
    /// Every operation errors, like an unreachable cache
    pub fn failing() -> Self {
        Self { fail: true, ..Default::default() }
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    pub async fn ttl_of(&self, key: &str) -> Option<u64> {
        self.entries.lock().await.get(key).map(|(_, ttl)| *ttl)
    }
}

#[async_trait]
impl CacheStore for CountingStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, AggregatorError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AggregatorError::CacheUnavailable("connection refused".into()));
        }
        Ok(self.entries.lock().await.get(key).map(|(bytes, _)| bytes.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_seconds: u64)
        -> Result<(), AggregatorError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AggregatorError::CacheUnavailable("connection refused".into()));
        }
        self.entries.lock().await.insert(key.to_string(), (value, ttl_seconds));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeStationStore {
    records: Vec<StationRecord>,
    broken: bool
}

impl FakeStationStore {
    pub fn new(records: Vec<StationRecord>) -> Self {
        Self { records, broken: false }
    }

    pub fn broken() -> Self {
        Self { records: Vec::new(), broken: true }
    }
}

#[async_trait]
impl StationStore for FakeStationStore {
    async fn list_stations(&self) -> Result<Vec<StationRecord>, AggregatorError> {
        if self.broken {
            return Err(AggregatorError::Db("database is locked".into()));
        }
        Ok(self.records.clone())
    }
}
