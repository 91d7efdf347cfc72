//!
//! src/client.rs  Andrew Belles  Oct 5th, 2025
//!
//! Consumer side of the aggregation endpoints. Loads the station directory
//! and then fills in profile images, compatibility and recent tracks by
//! walking the station list in fixed size batches, one request at a time
//!

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::Endpoint;
use crate::config::{ClientConfig, HttpConfig, RetryConfig};
use crate::errors::AggregatorError;
use crate::fetch::{base_client, http_with_retry};
use crate::types::{Identifier, StationListing, TrackSample};

/// Where batches come from. Responses map identifier -> partial record
#[async_trait]
pub trait BatchSource: Send + Sync {
    async fn fetch_batch(
        &self,
        endpoint: Endpoint,
        ids: &[Identifier],
        subject: Option<&Identifier>,
        bypass: bool
    ) -> Result<HashMap<Identifier, Value>, AggregatorError>;

    async fn fetch_listing(&self, bypass: bool) -> Result<Vec<StationListing>, AggregatorError>;
}

/// Talks to a running aggregator over http
#[derive(Clone, Debug)]
pub struct HttpBatchSource {
    http: Client,
    cfg: ClientConfig,
    retry: RetryConfig
}

impl HttpBatchSource {
    pub fn new(http_cfg: &HttpConfig, cfg: &ClientConfig) -> Result<Self, AggregatorError> {
        let http = base_client(http_cfg)?;
        Ok( Self { http, cfg: cfg.clone(), retry: http_cfg.retry.clone() } )
    }

    /// GET {base}/{endpoint}?ids=a,b&subject=u&nocache=1
    pub fn batch_request(
        &self,
        endpoint: Endpoint,
        ids: &[Identifier],
        subject: Option<&Identifier>,
        bypass: bool
    ) -> Result<RequestBuilder, AggregatorError> {
        let url = self.cfg.base_url.join(endpoint.path())
            .map_err(|e| AggregatorError::Config(format!("client url: {e}")))?;

        let mut query: Vec<(&str, String)> = Vec::with_capacity(3);
        if !ids.is_empty() {
            let joined = ids.iter().map(Identifier::as_str).collect::<Vec<_>>().join(",");
            query.push(("ids", joined));
        }
        if let Some(subject) = subject {
            query.push(("subject", subject.to_string()));
        }
        if bypass {
            query.push(("nocache", "1".to_string()));
        }

        Ok(self.http.get(url).query(&query))
    }
}

#[async_trait]
impl BatchSource for HttpBatchSource {
    async fn fetch_batch(
        &self,
        endpoint: Endpoint,
        ids: &[Identifier],
        subject: Option<&Identifier>,
        bypass: bool
    ) -> Result<HashMap<Identifier, Value>, AggregatorError> {
        let request = self.batch_request(endpoint, ids, subject, bypass)?;
        let v = http_with_retry(request, &self.retry).await?;
        Ok(serde_json::from_value(v)?)
    }

    async fn fetch_listing(&self, bypass: bool) -> Result<Vec<StationListing>, AggregatorError> {
        let request = self.batch_request(Endpoint::Stations, &[], None, bypass)?;
        let v = http_with_retry(request, &self.retry).await?;
        Ok(serde_json::from_value(v)?)
    }
}

/// Splits `ids` into consecutive chunks of `batch_size` and requests them
/// strictly one after another, handing each response to `merge` before the
/// next request goes out. A failed chunk is skipped. An empty list completes
/// without checking `batch_size`. Returns the number of requests issued
pub async fn batched_fetch<S, M>(
    source: &S,
    endpoint: Endpoint,
    batch_size: usize,
    ids: &[Identifier],
    subject: Option<&Identifier>,
    bypass: bool,
    mut merge: M
) -> Result<usize, AggregatorError>
where
    S: BatchSource + ?Sized,
    M: FnMut(HashMap<Identifier, Value>)
{
    if ids.is_empty() {
        return Ok(0);
    }
    if batch_size == 0 {
        return Err(AggregatorError::Config(
            format!("batch size for {} must be positive", endpoint.path())
        ));
    }

    let mut issued = 0;
    for chunk in ids.chunks(batch_size) {
        issued += 1;
        match source.fetch_batch(endpoint, chunk, subject, bypass).await {
            Ok(batch) => {
                debug!(endpoint = endpoint.path(), size = chunk.len(), got = batch.len(), "client.batch");
                merge(batch);
            }
            Err(e) => warn!(
                endpoint = endpoint.path(),
                size = chunk.len(),
                error = %e,
                "client.batch.failed"
            ),
        }
    }
    Ok(issued)
}

// Distinguishes an explicit null from a missing field
fn present<'de, D>(d: D) -> Result<Option<Option<String>>, D::Error>
where
    D: Deserializer<'de>
{
    Option::<String>::deserialize(d).map(Some)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StationPatch {
    #[serde(default, deserialize_with = "present")]
    lastfm_profile_image: Option<Option<String>>,
    #[serde(default)]
    recent_tracks: Option<Vec<TrackSample>>,
    #[serde(default)]
    tasteometer: Option<f64>
}

/// A directory entry plus whatever the batch endpoints have filled in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationView {
    pub lastfm_username: Identifier,
    pub station_url: Option<String>,
    pub stream_url: Option<String>,
    pub lastfm_profile_image: Option<String>,
    pub recent_tracks: Vec<TrackSample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasteometer: Option<f64>
}

impl From<StationListing> for StationView {
    fn from(l: StationListing) -> Self {
        Self {
            lastfm_username: l.lastfm_username,
            station_url: l.station_url,
            stream_url: l.stream_url,
            lastfm_profile_image: l.lastfm_profile_image,
            recent_tracks: l.recent_tracks,
            tasteometer: None
        }
    }
}

impl StationView {
    /// Field-wise merge: fields present in the patch overwrite, the rest
    /// are left as they are
    pub fn apply(&mut self, patch: &Value) {
        let patch = match StationPatch::deserialize(patch) {
            Ok(p) => p,
            Err(e) => {
                warn!(station = %self.lastfm_username, error = %e, "client.patch.invalid");
                return;
            }
        };
        if let Some(image) = patch.lastfm_profile_image {
            self.lastfm_profile_image = image;
        }
        if let Some(tracks) = patch.recent_tracks {
            self.recent_tracks = tracks;
        }
        if let Some(score) = patch.tasteometer {
            self.tasteometer = Some(score);
        }
    }
}

fn merge_into(stations: &mut [StationView], batch: &HashMap<Identifier, Value>) {
    for station in stations.iter_mut() {
        if let Some(patch) = batch.get(&station.lastfm_username) {
            station.apply(patch);
        }
    }
}

pub struct StationDirectoryClient<S: BatchSource> {
    source: S,
    cfg: ClientConfig,
    stations: Vec<StationView>
}

impl<S: BatchSource> StationDirectoryClient<S> {
    pub fn new(source: S, cfg: ClientConfig) -> Self {
        Self { source, cfg, stations: Vec::new() }
    }

    pub fn stations(&self) -> &[StationView] {
        &self.stations
    }

    fn usernames(&self) -> Vec<Identifier> {
        self.stations.iter().map(|s| s.lastfm_username.clone()).collect()
    }

    /// Replaces the local view with a fresh directory listing
    pub async fn load_stations(&mut self, bypass: bool) -> Result<&[StationView], AggregatorError> {
        let listing = self.source.fetch_listing(bypass).await?;
        self.stations = listing.into_iter().map(StationView::from).collect();
        info!(count = self.stations.len(), "client.stations.loaded");
        Ok(&self.stations)
    }

    async fn fill(
        &mut self,
        endpoint: Endpoint,
        batch_size: usize,
        subject: Option<&Identifier>,
        bypass: bool
    ) -> Result<usize, AggregatorError> {
        let ids = self.usernames();
        let stations = &mut self.stations;
        batched_fetch(&self.source, endpoint, batch_size, &ids, subject, bypass, |batch| {
            merge_into(stations, &batch);
        }).await
    }

    pub async fn fill_profile_info(&mut self, bypass: bool) -> Result<usize, AggregatorError> {
        let size = self.cfg.profile_info_batch;
        self.fill(Endpoint::ProfileInfo, size, None, bypass).await
    }

    /// Needs a logged in user to compare against; without one nothing is sent
    pub async fn fill_compatibility(&mut self, subject: Option<&Identifier>, bypass: bool)
        -> Result<usize, AggregatorError> {
        let Some(subject) = subject else {
            return Ok(0);
        };
        let size = self.cfg.compatibility_batch;
        self.fill(Endpoint::Compatibility, size, Some(subject), bypass).await
    }

    pub async fn fill_recent_tracks(&mut self, bypass: bool) -> Result<usize, AggregatorError> {
        let size = self.cfg.recent_tracks_batch;
        self.fill(Endpoint::RecentTracks, size, None, bypass).await
    }
}
