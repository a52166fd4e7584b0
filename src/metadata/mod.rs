pub mod flac;
pub mod m4a;
pub mod mp3;

use std::path::Path;

use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::{Error, Result},
    processor::probe,
    request::{Container, TrackRequest},
};

/// The tag set written into a finished file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub album_artist: String,
    pub date: String,
    pub track_number: u32,
    pub total_tracks: u32,
    pub disc_number: u32,
    pub total_discs: u32,
    pub url: String,
    pub copyright: String,
    pub publisher: String,
    pub description: String,
    pub isrc: String,
    pub genre: String,
    pub lyrics: String,
}

impl Metadata {
    pub fn from_request(req: &TrackRequest, description: &str) -> Self {
        Self {
            title: req.track_name.clone(),
            artist: req.artist_name.clone(),
            album: req.album_name.clone(),
            album_artist: req.album_artist.clone(),
            date: req.release_date.clone(),
            track_number: req.track_number.max(1),
            total_tracks: req.total_tracks,
            disc_number: req.disc_number,
            total_discs: req.total_discs,
            url: req.spotify_url().unwrap_or_default(),
            copyright: req.copyright.clone(),
            publisher: req.publisher.clone(),
            description: description.to_string(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_isrc(mut self, isrc: Option<String>) -> Self {
        self.isrc = isrc.unwrap_or_default();
        self
    }

    #[must_use]
    pub fn with_genre(mut self, genre: Option<String>) -> Self {
        self.genre = genre.unwrap_or_default();
        self
    }

    pub fn year(&self) -> &str {
        self.date.get(..4).unwrap_or(&self.date)
    }
}

/// `N` or `N/Total`.
pub fn number_with_total(n: u32, total: u32) -> String {
    if total > 0 {
        format!("{n}/{total}")
    } else {
        n.to_string()
    }
}

/// Writes `meta` (and the cover, if given) into `path` in one pass.
///
/// Only failing to open, parse or save the container is an error. A cover
/// that cannot be read is skipped with a warning.
#[tracing::instrument(skip(cfg, meta), fields(title = %meta.title))]
pub async fn embed(cfg: &Config, path: &Path, meta: &Metadata, cover: Option<&Path>) -> Result<()> {
    let cover_data = match cover {
        Some(c) => match tokio::fs::read(c).await {
            Ok(data) if !data.is_empty() => Some(data),
            Ok(_) => {
                warn!(cover = ?c, "Cover file is empty, skipping");
                None
            }
            Err(e) => {
                warn!(cover = ?c, ?e, "Failed to read cover file, skipping");
                None
            }
        },
        None => None,
    };

    match container_of(path)? {
        Container::Flac => {
            let (target, meta) = (path.to_path_buf(), meta.clone());
            blocking(path, move || flac::embed(&target, &meta, cover_data.as_deref())).await
        }
        Container::Mp3 => {
            let (target, meta) = (path.to_path_buf(), meta.clone());
            blocking(path, move || mp3::embed(&target, &meta, cover_data.as_deref())).await
        }
        Container::M4a => m4a::embed(cfg, path, meta, cover.filter(|_| cover_data.is_some())).await,
    }?;

    debug!("Metadata embedded");
    Ok(())
}

/// Adds lyrics to a file that already carries its primary tags.
///
/// Timestamped lines past the decoded duration are dropped first.
#[tracing::instrument(skip(cfg, lyrics))]
pub async fn embed_lyrics(cfg: &Config, path: &Path, lyrics: &str) -> Result<()> {
    if lyrics.trim().is_empty() {
        return Ok(());
    }

    let lyrics = match probe::duration(cfg, path).await {
        Ok(secs) => {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let limit_ms = (secs * 1000.0) as u64;
            filter_lyrics_to_duration(lyrics, limit_ms)
        }
        Err(e) => {
            warn!(?e, "Could not read duration, embedding lyrics unfiltered");
            lyrics.to_string()
        }
    };

    match container_of(path)? {
        Container::Flac => {
            let target = path.to_path_buf();
            blocking(path, move || flac::embed_lyrics(&target, &lyrics)).await
        }
        Container::Mp3 => {
            let target = path.to_path_buf();
            blocking(path, move || mp3::embed_lyrics(&target, &lyrics)).await
        }
        Container::M4a => m4a::embed_lyrics(cfg, path, &lyrics).await,
    }?;

    info!("Lyrics embedded");
    Ok(())
}

fn container_of(path: &Path) -> Result<Container> {
    Container::from_path(path)
        .ok_or_else(|| Error::embed(path, "unsupported container for tagging"))
}

async fn blocking<F>(path: &Path, f: F) -> Result<()>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::embed(path, e))?
}

/// Drops `[mm:ss.xx]` lines stamped after `limit_ms`. Header tags and plain
/// lines are kept.
pub fn filter_lyrics_to_duration(lyrics: &str, limit_ms: u64) -> String {
    if limit_ms == 0 {
        return lyrics.to_string();
    }

    lyrics
        .lines()
        .filter(|line| {
            let stamp = line
                .trim()
                .strip_prefix('[')
                .and_then(|rest| rest.split_once(']'))
                .and_then(|(ts, _)| parse_lrc_timestamp(ts));

            match stamp {
                Some(ms) if ms > limit_ms => {
                    debug!(line, limit_ms, "Dropping lyric line past the end of the track");
                    false
                }
                _ => true,
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Milliseconds of an LRC `mm:ss` or `mm:ss.xx` stamp.
pub fn parse_lrc_timestamp(ts: &str) -> Option<u64> {
    let (min, rest) = ts.split_once(':')?;
    let (sec, frac) = rest.split_once('.').unwrap_or((rest, ""));

    let min = min.trim().parse::<u64>().ok()?;
    let sec = sec.trim().parse::<u64>().ok()?;
    let centis = if frac.is_empty() {
        0
    } else {
        let digits = frac.chars().take_while(char::is_ascii_digit).take(2).collect::<String>();
        let mut value = digits.parse::<u64>().ok()?;
        if digits.len() == 1 {
            value *= 10;
        }
        value
    };

    Some(min * 60_000 + sec * 1000 + centis * 10)
}
