mod rate_limit;

use std::{collections::HashMap, sync::Arc, time::Duration};

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};
use tryhard::RetryPolicy;

pub use self::rate_limit::RateLimiter;
use crate::{
    config::Config,
    error::{Error, Result},
    helpers::http::{get_json, parse_json},
    request::spotify_track_url,
};

pub const LINK_ATTEMPTS: u32 = 3;
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(15);
const LINK_TIMEOUT: Duration = Duration::from_secs(30);
const DEEZER_TIMEOUT: Duration = Duration::from_secs(10);
const QOBUZ_SEARCH_TIMEOUT: Duration = Duration::from_secs(10);

static ASIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"B[0-9A-Z]{9}").expect("Invalid regex"));

/// Provider URLs for one Spotify track.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderLinks {
    pub tidal: Option<String>,
    pub amazon: Option<String>,
    pub deezer: Option<String>,
}

impl ProviderLinks {
    pub const fn is_empty(&self) -> bool {
        self.tidal.is_none() && self.amazon.is_none() && self.deezer.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Availability {
    pub spotify_id: String,
    pub tidal: bool,
    pub amazon: bool,
    pub qobuz: bool,
    pub deezer: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tidal_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amazon_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deezer_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LinksResponse {
    #[serde(rename = "linksByPlatform", default)]
    links_by_platform: HashMap<String, PlatformLink>,
}

#[derive(Debug, Deserialize)]
struct PlatformLink {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct DeezerTrack {
    #[serde(default)]
    isrc: String,
}

#[derive(Debug, Deserialize)]
struct QobuzSearch {
    tracks: QobuzSearchTracks,
}

#[derive(Debug, Deserialize)]
struct QobuzSearchTracks {
    #[serde(default)]
    total: u64,
}

/// Cross-resolves Spotify tracks through song.link.
///
/// One resolver (and therefore one [`RateLimiter`]) is meant to be shared by
/// every download in the process.
#[derive(Debug)]
pub struct LinkResolver {
    client: Client,
    cfg: Arc<Config>,
    limiter: Arc<RateLimiter>,
    backoff: Duration,
}

impl LinkResolver {
    pub fn new(client: Client, cfg: Arc<Config>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            client,
            cfg,
            limiter,
            backoff: RATE_LIMIT_BACKOFF,
        }
    }

    /// Delay between attempts after a 429.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Provider URLs for `spotify_id`. Fails with `NotFound` when song.link
    /// knows none of the supported platforms.
    #[tracing::instrument(skip(self))]
    pub async fn resolve(&self, spotify_id: &str, region: &str) -> Result<ProviderLinks> {
        if spotify_id.trim().is_empty() {
            return Err(Error::validation("spotify id is required"));
        }

        let spotify_url = spotify_track_url(spotify_id);
        let api_url = format!("{}/links", self.cfg.songlink_base);

        info!("Getting streaming URLs from song.link");
        let resp = tryhard::retry_fn(|| self.fetch_links(&api_url, &spotify_url, region))
            .retries(LINK_ATTEMPTS - 1)
            .custom_backoff(|attempt, err: &Error| match err {
                Error::RateLimited { .. } => {
                    warn!(attempt, "Rate limited by song.link, backing off");
                    RetryPolicy::Delay(self.backoff)
                }
                _ => RetryPolicy::Break,
            })
            .await
            .map_err(|e| match e {
                Error::RateLimited { .. } => Error::RateLimitExceeded {
                    attempts: LINK_ATTEMPTS,
                },
                e => e,
            })?;

        let platform_url = |key: &str| {
            resp.links_by_platform
                .get(key)
                .map(|l| l.url.trim())
                .filter(|u| !u.is_empty())
                .map(ToString::to_string)
        };

        let links = ProviderLinks {
            tidal: platform_url("tidal"),
            amazon: platform_url("amazonMusic").map(|u| normalize_amazon_url(&u)),
            deezer: platform_url("deezer"),
        };
        debug!(?links, "Resolved provider links");

        if links.is_empty() {
            return Err(Error::not_found(format!(
                "streaming links for Spotify track {spotify_id}"
            )));
        }

        Ok(links)
    }

    async fn fetch_links(&self, api_url: &str, spotify_url: &str, region: &str) -> Result<LinksResponse> {
        self.limiter.acquire().await;

        let mut req = self
            .client
            .get(api_url)
            .timeout(LINK_TIMEOUT)
            .query(&[("url", spotify_url)]);
        if !region.is_empty() {
            req = req.query(&[("userCountry", region)]);
        }

        let resp = req.send().await?;
        let status = resp.status();
        trace!(?status, "song.link responded");

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited {
                service: "song.link",
            });
        }
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status,
                url: resp.url().to_string(),
            });
        }

        let body = resp.bytes().await?;
        parse_json("song.link", &body)
    }

    pub async fn tidal_url(&self, spotify_id: &str, region: &str) -> Result<String> {
        self.resolve(spotify_id, region)
            .await?
            .tidal
            .ok_or_else(|| Error::not_found("Tidal link"))
    }

    pub async fn amazon_url(&self, spotify_id: &str, region: &str) -> Result<String> {
        self.resolve(spotify_id, region)
            .await?
            .amazon
            .ok_or_else(|| Error::not_found("Amazon Music link"))
    }

    pub async fn deezer_url(&self, spotify_id: &str) -> Result<String> {
        self.resolve(spotify_id, "")
            .await?
            .deezer
            .ok_or_else(|| Error::not_found("Deezer link"))
    }

    /// ISRC via the Deezer link and Deezer's public track API.
    #[tracing::instrument(skip(self))]
    pub async fn isrc(&self, spotify_id: &str) -> Result<String> {
        let deezer_url = self
            .deezer_url(spotify_id)
            .await
            .map_err(|e| Error::IsrcNotFound {
                reason: e.to_string(),
            })?;

        self.isrc_from_deezer(&deezer_url).await
    }

    async fn isrc_from_deezer(&self, deezer_url: &str) -> Result<String> {
        let track_id = deezer_track_id(deezer_url).ok_or_else(|| Error::IsrcNotFound {
            reason: format!("no track id in Deezer URL {deezer_url}"),
        })?;

        let url = format!("{}/track/{}", self.cfg.deezer_api_base, track_id);
        let track: DeezerTrack = get_json("deezer", self.client.get(url).timeout(DEEZER_TIMEOUT))
            .await
            .map_err(|e| Error::IsrcNotFound {
                reason: e.to_string(),
            })?;

        if track.isrc.is_empty() {
            return Err(Error::IsrcNotFound {
                reason: format!("Deezer track {track_id} has no ISRC"),
            });
        }

        info!(isrc = %track.isrc, "Found ISRC via Deezer");
        Ok(track.isrc)
    }

    /// Which platforms carry the track. Qobuz is checked through the ISRC.
    #[tracing::instrument(skip(self))]
    pub async fn availability(&self, spotify_id: &str) -> Result<Availability> {
        let links = match self.resolve(spotify_id, "").await {
            Ok(links) => links,
            Err(Error::NotFound { .. }) => ProviderLinks::default(),
            Err(e) => return Err(e),
        };

        let mut qobuz = false;
        if let Some(deezer_url) = &links.deezer {
            match self.isrc_from_deezer(deezer_url).await {
                Ok(isrc) => qobuz = self.qobuz_has_isrc(&isrc).await,
                Err(e) => debug!(?e, "Skipping Qobuz availability check"),
            }
        }

        Ok(Availability {
            spotify_id: spotify_id.to_string(),
            tidal: links.tidal.is_some(),
            amazon: links.amazon.is_some(),
            qobuz,
            deezer: links.deezer.is_some(),
            tidal_url: links.tidal,
            amazon_url: links.amazon,
            deezer_url: links.deezer,
        })
    }

    async fn qobuz_has_isrc(&self, isrc: &str) -> bool {
        let req = self
            .client
            .get(format!("{}/track/search", self.cfg.qobuz_search_base))
            .query(&[
                ("query", isrc),
                ("limit", "1"),
                ("app_id", self.cfg.qobuz_app_id.as_str()),
            ])
            .timeout(QOBUZ_SEARCH_TIMEOUT);

        match get_json::<QobuzSearch>("qobuz", req).await {
            Ok(search) => search.tracks.total > 0,
            Err(e) => {
                debug!(?e, "Qobuz search failed");
                false
            }
        }
    }
}

/// Numeric id following `/track/` in a Deezer URL.
pub fn deezer_track_id(deezer_url: &str) -> Option<&str> {
    let (_, rest) = deezer_url.split_once("/track/")?;
    let id = rest.split(['?', '#', '/']).next()?.trim();

    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// song.link sometimes points at an album page with a `trackAsin` parameter.
pub fn normalize_amazon_url(url: &str) -> String {
    match url.split_once("trackAsin=") {
        Some((_, rest)) => {
            let asin = rest.split('&').next().unwrap_or_default();
            format!("https://music.amazon.com/tracks/{asin}?musicTerritory=US")
        }
        None => url.to_string(),
    }
}

pub fn amazon_asin(url: &str) -> Option<&str> {
    ASIN.find(url).map(|m| m.as_str())
}
