use std::{sync::Arc, time::Duration};

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    config::Config,
    error::{Error, Result},
    helpers::http::get_json,
    metadata::parse_lrc_timestamp,
};

const LYRICS_TIMEOUT: Duration = Duration::from_secs(15);
const LRC_CREDIT: &str = "tunefetch";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LyricLine {
    /// Start of the line; `None` for unsynced lyrics.
    pub start_ms: Option<u64>,
    pub words: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lyrics {
    pub source: &'static str,
    pub lines: Vec<LyricLine>,
}

impl Lyrics {
    pub fn is_synced(&self) -> bool {
        self.lines.iter().any(|l| l.start_ms.is_some())
    }

    /// Renders an LRC document with a `ti`/`ar`/`by` header.
    pub fn to_lrc(&self, title: &str, artist: &str) -> String {
        let mut out = format!("[ti:{title}]\n[ar:{artist}]\n[by:{LRC_CREDIT}]\n\n");

        for line in self.lines.iter().filter(|l| !l.words.is_empty()) {
            if let Some(ms) = line.start_ms {
                out.push_str(&lrc_timestamp(ms));
            }
            out.push_str(&line.words);
            out.push('\n');
        }

        out
    }
}

/// `[mm:ss.cc]`.
pub fn lrc_timestamp(ms: u64) -> String {
    let secs = ms / 1000;
    format!("[{:02}:{:02}.{:02}]", secs / 60, secs % 60, (ms % 1000) / 10)
}

#[derive(Debug, Deserialize)]
struct SpotifyLyricsResponse {
    #[serde(default)]
    error: bool,
    #[serde(default)]
    lines: Vec<SpotifyLyricsLine>,
}

#[derive(Debug, Deserialize)]
struct SpotifyLyricsLine {
    #[serde(rename = "timeTag", default)]
    time_tag: String,
    #[serde(default)]
    words: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LrclibTrack {
    #[serde(default)]
    plain_lyrics: Option<String>,
    #[serde(default)]
    synced_lyrics: Option<String>,
}

impl LrclibTrack {
    fn synced(&self) -> Option<&str> {
        self.synced_lyrics.as_deref().filter(|s| !s.trim().is_empty())
    }

    fn plain(&self) -> Option<&str> {
        self.plain_lyrics.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// Looks lyrics up across the Spotify lyrics relay and LRCLIB.
#[derive(Debug, Clone)]
pub struct LyricsClient {
    client: Client,
    cfg: Arc<Config>,
}

impl LyricsClient {
    pub const fn new(client: Client, cfg: Arc<Config>) -> Self {
        Self { client, cfg }
    }

    /// First source with at least one line wins: Spotify relay, LRCLIB exact
    /// match, LRCLIB search, then both LRCLIB lookups with a simplified title.
    #[tracing::instrument(skip(self))]
    pub async fn fetch(&self, spotify_id: &str, track: &str, artist: &str, duration_secs: u32) -> Result<Lyrics> {
        if !spotify_id.is_empty() {
            match self.spotify_relay(spotify_id).await {
                Ok(l) => return Ok(l),
                Err(e) => debug!(?e, "Spotify lyrics relay had nothing"),
            }
        }

        match self.lrclib_with_fallback(track, artist, duration_secs).await {
            Ok(l) => return Ok(l),
            Err(e) => debug!(?e, "LRCLIB had nothing"),
        }

        let simplified = simplify_title(track);
        if simplified != track {
            debug!(%simplified, "Retrying with simplified title");
            if let Ok(l) = self.lrclib_with_fallback(simplified, artist, duration_secs).await {
                return Ok(l);
            }
        }

        Err(Error::not_found(format!("lyrics for {artist} - {track}")))
    }

    /// Same as [`Self::fetch`], rendered as LRC.
    pub async fn fetch_lrc(&self, spotify_id: &str, track: &str, artist: &str, duration_secs: u32) -> Result<String> {
        let lyrics = self.fetch(spotify_id, track, artist, duration_secs).await?;
        info!(source = lyrics.source, synced = lyrics.is_synced(), "Found lyrics");
        Ok(lyrics.to_lrc(track, artist))
    }

    async fn lrclib_with_fallback(&self, track: &str, artist: &str, duration_secs: u32) -> Result<Lyrics> {
        match self.lrclib_get(track, artist, duration_secs).await {
            Ok(l) => Ok(l),
            Err(e) => {
                debug!(?e, "LRCLIB exact match failed, searching");
                self.lrclib_search(track, artist).await
            }
        }
    }

    async fn spotify_relay(&self, spotify_id: &str) -> Result<Lyrics> {
        let req = self
            .client
            .get(format!("{}/", self.cfg.spotify_lyrics_base))
            .query(&[("trackid", spotify_id), ("format", "lrc")])
            .timeout(LYRICS_TIMEOUT);
        let resp: SpotifyLyricsResponse = get_json("spotify-lyrics", req).await?;

        if resp.error {
            return Err(Error::not_found("lyrics on the Spotify relay"));
        }

        let lines = resp
            .lines
            .into_iter()
            .filter(|l| !(l.time_tag.is_empty() && l.words.is_empty()))
            .map(|l| LyricLine {
                start_ms: parse_lrc_timestamp(&l.time_tag),
                words: l.words,
            })
            .collect::<Vec<_>>();

        non_empty("Spotify", lines)
    }

    async fn lrclib_get(&self, track: &str, artist: &str, duration_secs: u32) -> Result<Lyrics> {
        let mut req = self
            .client
            .get(format!("{}/get", self.cfg.lrclib_base))
            .query(&[("artist_name", artist), ("track_name", track)])
            .timeout(LYRICS_TIMEOUT);
        if duration_secs > 0 {
            req = req.query(&[("duration", duration_secs)]);
        }

        let found: LrclibTrack = get_json("lrclib", req).await?;
        lrclib_lyrics("LRCLIB", &found)
    }

    async fn lrclib_search(&self, track: &str, artist: &str) -> Result<Lyrics> {
        let req = self
            .client
            .get(format!("{}/search", self.cfg.lrclib_base))
            .query(&[("q", format!("{artist} {track}"))])
            .timeout(LYRICS_TIMEOUT);
        let results: Vec<LrclibTrack> = get_json("lrclib", req).await?;

        let best = results
            .iter()
            .find(|r| r.synced().is_some())
            .or_else(|| results.iter().find(|r| r.plain().is_some()))
            .or_else(|| results.first())
            .ok_or_else(|| Error::not_found("LRCLIB search results"))?;

        lrclib_lyrics("LRCLIB search", best)
    }
}

fn non_empty(source: &'static str, lines: Vec<LyricLine>) -> Result<Lyrics> {
    if lines.is_empty() {
        return Err(Error::not_found(format!("lyric lines from {source}")));
    }
    Ok(Lyrics { source, lines })
}

fn lrclib_lyrics(source: &'static str, track: &LrclibTrack) -> Result<Lyrics> {
    let text = track
        .synced()
        .or_else(|| track.plain())
        .ok_or_else(|| Error::not_found(format!("lyrics on {source}")))?;

    non_empty(source, parse_lrc_text(text))
}

/// Splits LRC (or plain) text into lines. Lines without a leading timestamp
/// are kept unsynced.
pub fn parse_lrc_text(text: &str) -> Vec<LyricLine> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|line| {
            let stamped = line
                .strip_prefix('[')
                .and_then(|rest| rest.split_once(']'))
                .and_then(|(ts, words)| parse_lrc_timestamp(ts).map(|ms| (ms, words.trim())));

            match stamped {
                Some((ms, words)) => LyricLine {
                    start_ms: Some(ms),
                    words: words.to_string(),
                },
                None => LyricLine {
                    start_ms: None,
                    words: line.to_string(),
                },
            }
        })
        .collect()
}

/// Title without a bracketed or dashed suffix, e.g. `Song (Remastered 2011)`
/// becomes `Song`.
pub fn simplify_title(title: &str) -> &str {
    let mut name = title;
    if let Some(idx) = name.find('(').filter(|i| *i > 0) {
        name = name[..idx].trim();
    }
    if let Some(idx) = name.find(" - ").filter(|i| *i > 0) {
        name = name[..idx].trim();
    }
    name
}
