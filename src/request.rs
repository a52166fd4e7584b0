use std::{fmt::Display, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const DEFAULT_SERVICE: &str = "tidal";
pub const DEFAULT_AUDIO_FORMAT: &str = "LOSSLESS";
pub const DEFAULT_FILENAME_FORMAT: &str = "title-artist";
pub const DEFAULT_OUTPUT_DIR: &str = ".";

/// Everything needed to fetch and tag one track.
///
/// Field names follow the JSON the desktop shell sends, so a request can be
/// read straight from a file by the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackRequest {
    pub service: String,
    pub spotify_id: String,
    pub track_name: String,
    pub artist_name: String,
    pub album_name: String,
    pub album_artist: String,
    pub release_date: String,
    pub cover_url: String,
    #[serde(rename = "spotify_track_number")]
    pub track_number: u32,
    #[serde(rename = "spotify_disc_number")]
    pub disc_number: u32,
    #[serde(rename = "spotify_total_tracks")]
    pub total_tracks: u32,
    #[serde(rename = "spotify_total_discs")]
    pub total_discs: u32,
    pub copyright: String,
    pub publisher: String,
    pub audio_format: String,
    pub output_dir: String,
    pub filename_format: String,
    pub position: u32,
    #[serde(rename = "track_number")]
    pub include_track_number: bool,
    pub use_album_track_number: bool,
    pub playlist_name: String,
    pub playlist_owner: String,
    pub service_url: String,
    pub api_url: String,
    /// Track length in seconds, used as a hint for lyrics lookups.
    pub duration: u32,
    pub item_id: String,
    pub region: String,
    pub allow_fallback: bool,
    pub embed_lyrics: bool,
    pub embed_max_quality_cover: bool,
    pub use_first_artist_only: bool,
    pub use_single_genre: bool,
    pub embed_genre: bool,
}

impl TrackRequest {
    pub fn spotify_url(&self) -> Option<String> {
        if self.spotify_id.is_empty() {
            None
        } else {
            Some(spotify_track_url(&self.spotify_id))
        }
    }

    /// True when any of the album facts used for tagging is missing.
    pub fn needs_backfill(&self) -> bool {
        self.copyright.is_empty()
            || self.publisher.is_empty()
            || self.total_discs == 0
            || self.release_date.is_empty()
            || self.total_tracks == 0
            || self.track_number == 0
    }
}

pub fn spotify_track_url(spotify_id: &str) -> String {
    format!("https://open.spotify.com/track/{spotify_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Tidal,
    Amazon,
    Qobuz,
    Deezer,
}

impl Service {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tidal => "tidal",
            Self::Amazon => "amazon",
            Self::Qobuz => "qobuz",
            Self::Deezer => "deezer",
        }
    }
}

impl Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tidal" => Ok(Self::Tidal),
            "amazon" => Ok(Self::Amazon),
            "qobuz" => Ok(Self::Qobuz),
            "deezer" => Ok(Self::Deezer),
            "" => Err(Error::validation("service is required")),
            other => Err(Error::validation(format!("unknown service: {other}"))),
        }
    }
}

/// Audio container of a finished file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Flac,
    Mp3,
    M4a,
}

impl Container {
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Flac => "flac",
            Self::Mp3 => "mp3",
            Self::M4a => "m4a",
        }
    }

    pub fn from_path(path: &std::path::Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "flac" => Some(Self::Flac),
            "mp3" => Some(Self::Mp3),
            "m4a" => Some(Self::M4a),
            _ => None,
        }
    }
}

/// Terminal result of one download call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub already_exists: bool,
    pub item_id: String,
}

impl DownloadOutcome {
    pub fn downloaded(item_id: String, file: PathBuf) -> Self {
        Self {
            success: true,
            message: "Download completed successfully".to_string(),
            file: Some(file),
            error: None,
            already_exists: false,
            item_id,
        }
    }

    pub fn existing(item_id: String, file: PathBuf) -> Self {
        Self {
            success: true,
            message: "File already exists".to_string(),
            file: Some(file),
            error: None,
            already_exists: true,
            item_id,
        }
    }

    pub fn failed(item_id: String, err: &Error) -> Self {
        Self {
            success: false,
            message: "Download failed".to_string(),
            file: None,
            error: Some(format!("Download failed: {err}")),
            already_exists: false,
            item_id,
        }
    }
}
