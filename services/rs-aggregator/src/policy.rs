//!
//! src/policy.rs  Andrew Belles  Oct 4th, 2025
//!
//! The aggregation endpoints. Each one pairs a per-identifier upstream
//! fetch with a normalizer, a completeness rule deciding whether the batch
//! may be cached, and a ttl
//!

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::aggregate::{aggregate, FetchResult};
use crate::cache::{CacheKey, CachedBody, Endpoint, Produced, ReadThrough};
use crate::config::{CacheConfig, RECENT_TRACKS_LIMIT};
use crate::errors::AggregatorError;
use crate::fetch::Upstream;
use crate::persistent::{StationRecord, StationStore};
use crate::types::{
    Compatibility, Identifier, ProfileInfo, RecentTracks, StationListing, TrackSample
};

const PROFILE_IMAGE_SIZE: &str = "large";
const TRACK_IMAGE_SIZE: &str = "small";
const MAX_RECENT_TRACKS: usize = 3;

/// First image in a last.fm `image` array tagged with `size`
pub fn pick_image(images: Option<&Value>, size: &str) -> Option<String> {
    images?
        .as_array()?
        .iter()
        .find(|image| image.get("size").and_then(Value::as_str) == Some(size))
        .and_then(|image| image.get("#text"))
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}

/// user.getInfo -> large profile image, absent image is not an error
pub fn profile_from_user_info(v: &Value) -> ProfileInfo {
    ProfileInfo {
        lastfm_profile_image: pick_image(v.pointer("/user/image"), PROFILE_IMAGE_SIZE)
    }
}

fn artist_name(v: &Value) -> Option<&str> {
    match v {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => map.get("#text")
            .or_else(|| map.get("name"))
            .and_then(Value::as_str),
        _ => None
    }
}

/// One raw track record -> sample, None when artist or title is missing
pub fn track_sample(v: &Value) -> Option<TrackSample> {
    let artist = v.get("artist").and_then(artist_name).filter(|s| !s.is_empty())?;
    let title  = v.get("name").and_then(Value::as_str).filter(|s| !s.is_empty())?;
    let now_playing = v.pointer("/@attr/nowplaying").and_then(Value::as_str) == Some("true");

    Some(TrackSample {
        artist: artist.to_string(),
        title: title.to_string(),
        image_url: pick_image(v.get("image"), TRACK_IMAGE_SIZE),
        source_url: v.get("url").and_then(Value::as_str).map(str::to_string),
        now_playing
    })
}

/// Drops the second entry when it repeats the first (now playing echoing the
/// last scrobble) and keeps at most three
pub fn dedup_recent(mut tracks: Vec<TrackSample>) -> Vec<TrackSample> {
    if tracks.len() > 1 && tracks[0].same_song(&tracks[1]) {
        tracks.remove(1);
    }
    tracks.truncate(MAX_RECENT_TRACKS);
    tracks
}

/// user.getRecentTracks -> normalized samples. last.fm sends a bare object
/// instead of an array when there is a single track
pub fn recent_from_response(v: &Value) -> Result<Vec<TrackSample>, AggregatorError> {
    let raw = v.pointer("/recenttracks/track")
        .ok_or_else(|| AggregatorError::MalformedUpstream(
            "recenttracks.track missing".to_string()
        ))?;

    let tracks = match raw {
        Value::Array(items) => items.iter().filter_map(track_sample).collect(),
        Value::Object(_) => track_sample(raw).into_iter().collect(),
        _ => return Err(AggregatorError::MalformedUpstream(
            "recenttracks.track has unexpected type".to_string()
        )),
    };

    Ok(dedup_recent(tracks))
}

/// Raw tasteometer score in [0,1] -> percentage, two decimals
pub fn scale_score(raw: f64) -> f64 {
    let pct = (raw.clamp(0.0, 1.0) * 10_000.0).round() / 100.0;
    if pct.is_finite() { pct } else { 0.0 }
}

/// tasteometer.compare -> percentage; missing or malformed comparisons score 0
pub fn score_from_comparison(v: &Value) -> f64 {
    let raw = v.pointer("/comparison/result/score")
        .and_then(|s| match s {
            Value::String(s) => s.trim().parse::<f64>().ok(),
            Value::Number(n) => n.as_f64(),
            _ => None
        })
        .filter(|s| s.is_finite())
        .unwrap_or(0.0);
    scale_score(raw)
}

/// Directory entry for an enabled station with a 0..2 track preview built
/// from the denormalized fields already on the record
pub fn listing_from_record(record: &StationRecord) -> Option<StationListing> {
    if record.disabled || record.username.is_empty() {
        return None;
    }

    let mut recent_tracks = Vec::with_capacity(2);
    if let (Some(artist), Some(track)) = (&record.now_playing_artist, &record.now_playing_track) {
        recent_tracks.push(TrackSample::new(artist, track, true));
    }
    if let (Some(artist), Some(track)) = (&record.last_played_artist, &record.last_played_track) {
        recent_tracks.push(TrackSample::new(artist, track, false));
    }

    Some(StationListing {
        lastfm_username: Identifier::from(record.username.as_str()),
        station_url: record.station_url.clone(),
        stream_url: record.stream_url.clone(),
        lastfm_profile_image: record.profile_image_url.clone(),
        recent_tracks
    })
}

/// Wires the upstream, record store and response cache into the endpoints
#[derive(Clone)]
pub struct Policies {
    upstream: Arc<dyn Upstream>,
    stations: Arc<dyn StationStore>,
    cache: ReadThrough,
    ttl: CacheConfig
}

impl Policies {
    pub fn new(
        upstream: Arc<dyn Upstream>,
        stations: Arc<dyn StationStore>,
        cache: ReadThrough,
        ttl: CacheConfig
    ) -> Self {
        Self { upstream, stations, cache, ttl }
    }

    pub fn cache(&self) -> &ReadThrough {
        &self.cache
    }

    /// Profile images for a batch. Failures are dropped, the batch is
    /// always cacheable
    pub async fn profile_info(&self, ids: &[Identifier], bypass: bool)
        -> Result<CachedBody, AggregatorError> {
        let key = CacheKey::new(Endpoint::ProfileInfo, ids, None);
        self.cache.cached(&key, self.ttl.ttl_profile_info, bypass, || async move {
            let result = aggregate(ids, |id| async move {
                let info = self.upstream.user_info(&id).await;
                FetchResult::from(info.map(|v| profile_from_user_info(&v)))
            }).await;

            if !result.is_complete() {
                warn!(
                    requested = result.requested,
                    succeeded = result.succeeded,
                    "profile_info.partial"
                );
            }
            Ok::<_, AggregatorError>(Produced { value: result.values, complete: true })
        }).await
    }

    /// Single identifier form; there is nothing to partially succeed on,
    /// so an upstream failure is returned to the caller
    pub async fn user_info(&self, user: &Identifier, bypass: bool)
        -> Result<CachedBody, AggregatorError> {
        let key = CacheKey::new(Endpoint::UserInfo, std::slice::from_ref(user), None);
        self.cache.cached(&key, self.ttl.ttl_profile_info, bypass, || async move {
            let info = profile_from_user_info(&self.upstream.user_info(user).await?);
            let complete = info.lastfm_profile_image.is_some();
            if !complete {
                warn!(user = %user, "user_info.no_image");
            }
            Ok::<_, AggregatorError>(Produced { value: info, complete })
        }).await
    }

    /// Recent tracks for a batch, cached only when every station answered
    pub async fn recent_tracks(&self, ids: &[Identifier], bypass: bool)
        -> Result<CachedBody, AggregatorError> {
        let key = CacheKey::new(Endpoint::RecentTracks, ids, None);
        self.cache.cached(&key, self.ttl.ttl_recent_tracks, bypass, || async move {
            let result = aggregate(ids, |id| async move {
                let tracks = self.upstream
                    .recent_tracks(&id, RECENT_TRACKS_LIMIT)
                    .await
                    .and_then(|v| recent_from_response(&v));
                FetchResult::from(tracks.map(|recent_tracks| RecentTracks { recent_tracks }))
            }).await;

            let complete = result.is_complete();
            if !complete {
                warn!(
                    requested = result.requested,
                    succeeded = result.succeeded,
                    "recent_tracks.partial"
                );
            }
            Ok::<_, AggregatorError>(Produced { value: result.values, complete })
        }).await
    }

    /// Compatibility of `subject` with every station in the batch
    pub async fn compatibility(&self, ids: &[Identifier], subject: &Identifier, bypass: bool)
        -> Result<CachedBody, AggregatorError> {
        let key = CacheKey::new(Endpoint::Compatibility, ids, Some(subject));
        self.cache.cached(&key, self.ttl.ttl_compatibility, bypass, || async move {
            let result = aggregate(ids, |id| async move {
                let comparison = self.upstream.compare(subject, &id).await;
                FetchResult::from(comparison.map(|v| Compatibility {
                    tasteometer: score_from_comparison(&v)
                }))
            }).await;

            if !result.is_complete() {
                warn!(
                    subject = %subject,
                    requested = result.requested,
                    succeeded = result.succeeded,
                    "compatibility.partial"
                );
            }
            Ok::<_, AggregatorError>(Produced { value: result.values, complete: true })
        }).await
    }

    /// The public directory, one record store call, no fan-out
    pub async fn stations(&self, bypass: bool) -> Result<CachedBody, AggregatorError> {
        let key = CacheKey::new(Endpoint::Stations, &[], None);
        self.cache.cached(&key, self.ttl.ttl_stations, bypass, || async move {
            let records = self.stations.list_stations().await?;
            let listing: Vec<StationListing> = records.iter()
                .filter_map(listing_from_record)
                .collect();
            Ok::<_, AggregatorError>(Produced { value: listing, complete: true })
        }).await
    }
}

/// Keyed map produced by every batch endpoint
pub type BatchBody<T> = HashMap<Identifier, T>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::cache::Lookup;
    use crate::testing::{self, CountingStore, FakeStationStore, FakeUpstream};

    fn ids(raw: &[&str]) -> Vec<Identifier> {
        raw.iter().map(|s| Identifier::from(*s)).collect()
    }

    fn build(upstream: FakeUpstream, stations: FakeStationStore)
        -> (Policies, Arc<FakeUpstream>, Arc<CountingStore>) {
        let upstream = Arc::new(upstream);
        let store = Arc::new(CountingStore::default());
        let policies = Policies::new(
            upstream.clone(),
            Arc::new(stations),
            ReadThrough::new(store.clone()),
            CacheConfig::default()
        );
        (policies, upstream, store)
    }

    #[test]
    fn duplicate_now_playing_is_dropped() {
        let raw = testing::recent_tracks_body(&[
            ("X", "Y", true),
            ("X", "Y", false),
            ("Z", "W", false),
        ]);
        let tracks = recent_from_response(&raw).unwrap();
        let shape: Vec<_> = tracks.iter()
            .map(|t| (t.artist.as_str(), t.title.as_str(), t.now_playing))
            .collect();
        assert_eq!(shape, vec![("X", "Y", true), ("Z", "W", false)]);
    }

    #[test]
    fn recent_tracks_are_capped_at_three() {
        let raw = testing::recent_tracks_body(&[
            ("A", "1", true),
            ("B", "2", false),
            ("C", "3", false),
            ("D", "4", false),
        ]);
        assert_eq!(recent_from_response(&raw).unwrap().len(), 3);
    }

    #[test]
    fn track_fields_are_normalized() {
        let raw = json!({
            "artist": {"#text": "Broadcast"},
            "name": "Tears in the Typing Pool",
            "url": "https://www.last.fm/music/Broadcast/_/Tears+in+the+Typing+Pool",
            "image": [
                {"size": "small", "#text": "https://img/34s.png"},
                {"size": "large", "#text": "https://img/174s.png"}
            ],
            "@attr": {"nowplaying": "true"}
        });
        let track = track_sample(&raw).unwrap();
        assert_eq!(track.artist, "Broadcast");
        assert_eq!(track.image_url.as_deref(), Some("https://img/34s.png"));
        assert!(track.source_url.is_some());
        assert!(track.now_playing);

        assert!(track_sample(&json!({"name": "no artist"})).is_none());
    }

    #[test]
    fn single_track_object_is_accepted() {
        let raw = json!({"recenttracks": {"track": {"artist": {"#text": "A"}, "name": "B"}}});
        assert_eq!(recent_from_response(&raw).unwrap().len(), 1);
    }

    #[test]
    fn unrecognized_shape_is_malformed() {
        let err = recent_from_response(&json!({"recenttracks": {}})).unwrap_err();
        assert!(matches!(err, AggregatorError::MalformedUpstream(_)));
    }

    #[test]
    fn profile_picks_large_image() {
        let info = profile_from_user_info(&testing::user_info_body(Some("https://img/large.png")));
        assert_eq!(info.lastfm_profile_image.as_deref(), Some("https://img/large.png"));

        let none = profile_from_user_info(&testing::user_info_body(None));
        assert!(none.lastfm_profile_image.is_none());
    }

    #[test]
    fn scores_scale_to_percentages() {
        assert_eq!(score_from_comparison(&testing::comparison_body("0.42")), 42.0);
        assert_eq!(score_from_comparison(&json!({"comparison": {"result": {"score": 0.9731}}})), 97.31);
        assert_eq!(score_from_comparison(&json!({"comparison": {}})), 0.0);
        assert_eq!(score_from_comparison(&testing::comparison_body("garbage")), 0.0);
        assert_eq!(scale_score(1.7), 100.0);
    }

    #[test]
    fn directory_filters_and_previews() {
        let mut live = StationRecord::new("kexp");
        live.now_playing_artist = Some("A".into());
        live.now_playing_track = Some("B".into());
        live.last_played_artist = Some("C".into());
        live.last_played_track = Some("D".into());
        let listing = listing_from_record(&live).unwrap();
        assert_eq!(listing.recent_tracks, vec![
            TrackSample::new("A", "B", true),
            TrackSample::new("C", "D", false),
        ]);

        let mut half = StationRecord::new("wfmu");
        half.last_played_artist = Some("C".into());
        assert!(listing_from_record(&half).unwrap().recent_tracks.is_empty());

        let mut off = StationRecord::new("off");
        off.disabled = true;
        assert!(listing_from_record(&off).is_none());
    }

    #[tokio::test]
    async fn profile_info_omits_failures_and_still_caches() {
        let upstream = FakeUpstream::default()
            .with_profile("a", Some("https://img/a.png"))
            .with_profile("b", None)
            .failing("c");
        let (policies, _, store) = build(upstream, FakeStationStore::default());

        let out = policies.profile_info(&ids(&["a", "b", "c"]), false).await.unwrap();
        policies.cache().settle().await;

        let body: BatchBody<ProfileInfo> = out.decode().unwrap();
        assert_eq!(body.len(), 2);
        assert_eq!(body[&Identifier::from("a")].lastfm_profile_image.as_deref(), Some("https://img/a.png"));
        assert!(body[&Identifier::from("b")].lastfm_profile_image.is_none());
        assert_eq!(store.sets(), 1);
    }

    #[tokio::test]
    async fn recent_tracks_only_cached_when_complete() {
        let track = &[("X", "Y", true)];
        let upstream = FakeUpstream::default()
            .with_recent("a", track)
            .with_recent("b", track)
            .with_raw_recent("broken", json!({"recenttracks": {}}));
        let (policies, upstream, _) = build(upstream, FakeStationStore::default());

        // partial: served, not cached, so the retry goes upstream again
        let partial = ids(&["a", "broken"]);
        let first = policies.recent_tracks(&partial, false).await.unwrap();
        policies.cache().settle().await;
        let body: BatchBody<RecentTracks> = first.decode().unwrap();
        assert_eq!(body.len(), 1);
        let second = policies.recent_tracks(&partial, false).await.unwrap();
        assert_eq!(second.lookup, Lookup::Miss);
        assert_eq!(upstream.calls(), 4);

        // complete: the retry is a hit
        let complete = ids(&["a", "b"]);
        policies.recent_tracks(&complete, false).await.unwrap();
        policies.cache().settle().await;
        let again = policies.recent_tracks(&complete, false).await.unwrap();
        assert_eq!(again.lookup, Lookup::Hit);
        assert_eq!(upstream.calls(), 6);
    }

    #[tokio::test]
    async fn compatibility_scales_and_keys_on_subject() {
        let upstream = FakeUpstream::default()
            .with_score("rj", "kexp", "0.42")
            .with_score("rj", "wfmu", "1");
        let (policies, upstream, _) = build(upstream, FakeStationStore::default());
        let batch = ids(&["kexp", "wfmu", "nobody"]);

        let out = policies.compatibility(&batch, &"rj".into(), false).await.unwrap();
        policies.cache().settle().await;
        let body: BatchBody<Compatibility> = out.decode().unwrap();
        assert_eq!(body[&Identifier::from("kexp")].tasteometer, 42.0);
        assert_eq!(body[&Identifier::from("wfmu")].tasteometer, 100.0);
        // no comparison on record for this pair
        assert_eq!(body[&Identifier::from("nobody")].tasteometer, 0.0);

        let other = policies.compatibility(&batch, &"someone".into(), false).await.unwrap();
        assert_eq!(other.lookup, Lookup::Miss);
        assert_eq!(upstream.calls(), 6);
    }

    #[tokio::test]
    async fn user_info_surfaces_upstream_failure() {
        let upstream = FakeUpstream::default().failing("ghost");
        let (policies, _, store) = build(upstream, FakeStationStore::default());

        let out = policies.user_info(&"ghost".into(), false).await;
        assert!(matches!(out, Err(AggregatorError::UpstreamUnavailable(_))));
        policies.cache().settle().await;
        assert_eq!(store.sets(), 0);
    }

    #[tokio::test]
    async fn user_without_image_is_served_but_not_cached() {
        let upstream = FakeUpstream::default().with_profile("x", None);
        let (policies, upstream, store) = build(upstream, FakeStationStore::default());

        let out = policies.user_info(&"x".into(), false).await.unwrap();
        policies.cache().settle().await;
        assert_eq!(out.decode::<Value>().unwrap(), json!({"lastfmProfileImage": null}));
        assert_eq!(store.sets(), 0);

        let again = policies.user_info(&"x".into(), false).await.unwrap();
        assert_eq!(again.lookup, Lookup::Miss);
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test]
    async fn stations_listing_is_cached_and_fails_hard() {
        let mut kexp = StationRecord::new("kexp");
        kexp.station_url = Some("https://kexp.org".into());
        let mut off = StationRecord::new("off");
        off.disabled = true;
        let (policies, _, store) = build(
            FakeUpstream::default(),
            FakeStationStore::new(vec![kexp, off])
        );

        let out = policies.stations(false).await.unwrap();
        policies.cache().settle().await;
        let listing: Vec<StationListing> = out.decode().unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].lastfm_username, Identifier::from("kexp"));
        assert_eq!(store.sets(), 1);

        let (broken, _, _) = build(FakeUpstream::default(), FakeStationStore::broken());
        assert!(broken.stations(false).await.is_err());
    }
}
