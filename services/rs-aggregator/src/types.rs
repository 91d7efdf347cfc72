//!
//! src/types.rs  Andrew Belles  Oct 2nd, 2025
//!
//! Shared domain types: identifiers, normalized track samples and the
//! per-endpoint response records
//!

use std::fmt;

use serde::{Deserialize, Serialize};

// Opaque user or station handle, kept exactly as given
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(pub String);

impl Identifier {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits a comma separated query value, dropping empty segments.
    /// Segments are not trimmed or case folded
    pub fn parse_csv(csv: &str) -> Vec<Identifier> {
        csv.split(',')
            .filter(|s| !s.is_empty())
            .map(Identifier::from)
            .collect()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(s: &str) -> Self { Identifier(s.to_string()) }
}

impl From<String> for Identifier {
    fn from(s: String) -> Self { Identifier(s) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSample {
    pub artist: String,
    #[serde(rename = "name")]
    pub title: String,
    #[serde(rename = "image", default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(rename = "url", default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(rename = "nowPlaying", default)]
    pub now_playing: bool
}

impl TrackSample {
    pub fn new(artist: &str, title: &str, now_playing: bool) -> Self {
        Self {
            artist: artist.to_string(),
            title: title.to_string(),
            image_url: None,
            source_url: None,
            now_playing
        }
    }

    pub fn same_song(&self, other: &TrackSample) -> bool {
        self.artist == other.artist && self.title == other.title
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileInfo {
    pub lastfm_profile_image: Option<String>
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentTracks {
    pub recent_tracks: Vec<TrackSample>
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compatibility {
    // percentage, 0..=100
    pub tasteometer: f64
}

/// One entry of the public station directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationListing {
    pub lastfm_username: Identifier,
    pub station_url: Option<String>,
    pub stream_url: Option<String>,
    pub lastfm_profile_image: Option<String>,
    pub recent_tracks: Vec<TrackSample>
}
