use std::{path::PathBuf, time::Duration};

use futures::{future::select_ok, FutureExt};
use rand::seq::SliceRandom;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{finalize, Handler, Job, Services, SIDE_FETCH_WAIT};
use crate::{
    config::Config,
    error::{Error, Result},
    helpers::{
        download::download_file,
        http::{get_json, parse_json, send_checked},
    },
    request::{Container, Service},
};

const SEARCH_TIMEOUT: Duration = Duration::from_secs(15);
const RELAY_TIMEOUT: Duration = Duration::from_secs(60);
const FILE_TIMEOUT: Duration = Duration::from_secs(300);

const HI_RES: &str = "27";
const HI_RES_STANDARD: &str = "7";
const LOSSLESS: &str = "6";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    tracks: SearchTracks,
}

#[derive(Debug, Deserialize)]
struct SearchTracks {
    #[serde(default)]
    items: Vec<QobuzTrack>,
}

#[derive(Debug, Deserialize)]
struct QobuzTrack {
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    maximum_bit_depth: u32,
    #[serde(default)]
    maximum_sampling_rate: f64,
    #[serde(default)]
    hires: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RelayResponse {
    Flat { url: String },
    Nested { data: RelayData },
}

#[derive(Debug, Deserialize)]
struct RelayData {
    url: String,
}

impl RelayResponse {
    fn into_url(self) -> Option<String> {
        let url = match self {
            Self::Flat { url } | Self::Nested { data: RelayData { url } } => url,
        };
        Some(url).filter(|u| !u.is_empty())
    }
}

#[derive(Debug)]
pub struct QobuzProvider;

#[async_trait::async_trait]
impl Handler for QobuzProvider {
    #[tracing::instrument(skip_all, fields(spotify_id = %job.request.spotify_id))]
    async fn download(&self, ctx: &Services, job: &Job) -> Result<PathBuf> {
        let req = &job.request;

        let isrc = job
            .isrc
            .wait_for(SIDE_FETCH_WAIT)
            .await
            .filter(|i| !i.is_empty())
            .ok_or_else(|| Error::validation("an ISRC is required for Qobuz downloads"))?;

        let track = Self::search_by_isrc(&ctx.client, &ctx.cfg, &isrc).await?;
        if track.hires {
            info!(
                title = %track.title,
                bits = track.maximum_bit_depth,
                khz = track.maximum_sampling_rate,
                "Found Hi-Res Qobuz track"
            );
        } else {
            info!(title = %track.title, "Found Qobuz track");
        }

        let url = Self::get_download_url(&ctx.client, &ctx.cfg, track.id, &req.audio_format, req.allow_fallback).await?;

        let target = job.expected_path(Container::Flac);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        job.track_partial(&target);
        let bytes = download_file(&ctx.client, &target, &url, FILE_TIMEOUT).await?;
        info!(bytes, "Qobuz file downloaded");

        finalize(ctx, job, &target, target.clone()).await
    }

    fn supports(&self, service: Service) -> bool {
        service == Service::Qobuz
    }
}

impl QobuzProvider {
    async fn search_by_isrc(client: &Client, cfg: &Config, isrc: &str) -> Result<QobuzTrack> {
        let req = client
            .get(format!("{}/track/search", cfg.qobuz_search_base))
            .query(&[
                ("query", isrc),
                ("limit", "1"),
                ("app_id", cfg.qobuz_app_id.as_str()),
            ])
            .timeout(SEARCH_TIMEOUT);

        let search: SearchResponse = get_json("qobuz", req).await?;
        search
            .tracks
            .items
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(format!("Qobuz track for ISRC {isrc}")))
    }

    /// Download URL at the requested quality, stepping 27 → 7 → 6 when
    /// fallback is allowed.
    async fn get_download_url(
        client: &Client,
        cfg: &Config,
        track_id: u64,
        quality: &str,
        allow_fallback: bool,
    ) -> Result<String> {
        let mut quality = quality_code(quality);

        loop {
            match Self::race_relays(client, cfg, track_id, quality).await {
                Ok(url) => return Ok(url),
                Err(e) => {
                    let next = match quality {
                        HI_RES if allow_fallback => HI_RES_STANDARD,
                        HI_RES_STANDARD if allow_fallback => LOSSLESS,
                        _ => return Err(e),
                    };
                    warn!(?e, from = quality, to = next, "Qobuz quality unavailable, falling back");
                    quality = next;
                }
            }
        }
    }

    /// Asks every relay at once, in shuffled order, and takes the first URL.
    async fn race_relays(client: &Client, cfg: &Config, track_id: u64, quality: &str) -> Result<String> {
        let mut relays = cfg.qobuz_relays.clone();
        if relays.is_empty() {
            return Err(Error::ProvidersExhausted {
                provider: "qobuz",
                attempts: 0,
                last: "no relays configured".to_string(),
            });
        }
        relays.shuffle(&mut rand::rng());

        let attempts = relays.len();
        let requests = relays
            .into_iter()
            .map(|relay| Self::fetch_from_relay(client, relay, track_id, quality).boxed());

        match select_ok(requests).await {
            Ok((url, _)) => {
                debug!(quality, "Got Qobuz download URL");
                Ok(url)
            }
            Err(e) => Err(Error::ProvidersExhausted {
                provider: "qobuz",
                attempts,
                last: e.to_string(),
            }),
        }
    }

    async fn fetch_from_relay(client: &Client, relay: String, track_id: u64, quality: &str) -> Result<String> {
        let url = format!("{relay}{track_id}&quality={quality}");
        let body = send_checked(client.get(&url).timeout(RELAY_TIMEOUT))
            .await?
            .bytes()
            .await?;

        parse_json::<RelayResponse>("qobuz relay", &body)?
            .into_url()
            .ok_or_else(|| Error::transient("qobuz", format!("no URL from {relay}")))
    }
}

/// Qobuz format id for a requested quality.
fn quality_code(quality: &str) -> &'static str {
    match quality.trim().to_ascii_uppercase().as_str() {
        "27" | "HI_RES" | "HI_RES_LOSSLESS" => HI_RES,
        "7" => HI_RES_STANDARD,
        _ => LOSSLESS,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{Arc, OnceLock},
    };

    use axum::{
        extract::Query,
        http::StatusCode,
        response::IntoResponse,
        routing::get,
        Json, Router,
    };
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::{
        downloader::handlers::tests::{request, services},
        helpers::{http::build_client, side_fetch::SideFetch},
        metadata,
        test_support::{synthetic_flac, MockServer},
    };

    type Seen = Arc<Mutex<Vec<String>>>;

    /// Relay that only serves quality `6`.
    fn relay_router(seen: Seen) -> Router {
        Router::new().route(
            "/qobuz-relay/stream",
            get(move |Query(q): Query<HashMap<String, String>>| {
                let seen = seen.clone();
                async move {
                    let quality = q.get("quality").cloned().unwrap_or_default();
                    seen.lock().push(quality.clone());

                    if quality == LOSSLESS {
                        Json(json!({ "data": { "url": "https://cdn.invalid/q.flac" } })).into_response()
                    } else {
                        StatusCode::BAD_GATEWAY.into_response()
                    }
                }
            }),
        )
    }

    #[test]
    fn quality_codes() {
        assert_eq!(quality_code(""), "6");
        assert_eq!(quality_code("5"), "6");
        assert_eq!(quality_code("LOSSLESS"), "6");
        assert_eq!(quality_code("hi_res"), "27");
        assert_eq!(quality_code("7"), "7");
    }

    #[test]
    fn relay_response_shapes() {
        let flat: RelayResponse = serde_json::from_value(json!({ "url": "https://a" })).expect("flat");
        assert_eq!(flat.into_url().as_deref(), Some("https://a"));

        let nested: RelayResponse =
            serde_json::from_value(json!({ "data": { "url": "https://b" } })).expect("nested");
        assert_eq!(nested.into_url().as_deref(), Some("https://b"));

        let empty: RelayResponse = serde_json::from_value(json!({ "url": "" })).expect("empty");
        assert_eq!(empty.into_url(), None);

        assert!(serde_json::from_value::<RelayResponse>(json!({ "error": "x" })).is_err());
    }

    #[tokio::test]
    async fn staircase_walks_down_to_lossless() {
        let seen = Seen::default();
        let server = MockServer::start(relay_router(seen.clone())).await;
        let cfg = server.config(&std::env::temp_dir());

        let url = QobuzProvider::get_download_url(&build_client(&cfg), &cfg, 1, "27", true)
            .await
            .expect("url");

        assert_eq!(url, "https://cdn.invalid/q.flac");
        assert_eq!(*seen.lock(), vec!["27", "7", "6"]);
    }

    #[tokio::test]
    async fn no_staircase_without_fallback() {
        let seen = Seen::default();
        let server = MockServer::start(relay_router(seen.clone())).await;
        let cfg = server.config(&std::env::temp_dir());

        let err = QobuzProvider::get_download_url(&build_client(&cfg), &cfg, 1, "27", false)
            .await
            .expect_err("no fallback");

        assert!(matches!(err, Error::ProvidersExhausted { attempts: 1, .. }));
        assert_eq!(*seen.lock(), vec!["27"]);
    }

    #[tokio::test]
    async fn first_working_relay_wins() {
        let seen = Seen::default();
        let server = MockServer::start(relay_router(seen.clone())).await;
        let mut cfg = server.config(&std::env::temp_dir());
        cfg.qobuz_relays = vec![
            format!("{}/missing?trackId=", server.base),
            format!("{}/qobuz-relay/stream?trackId=", server.base),
            format!("{}/also-missing?trackId=", server.base),
        ];

        let url = QobuzProvider::race_relays(&build_client(&cfg), &cfg, 1, "6")
            .await
            .expect("url");
        assert_eq!(url, "https://cdn.invalid/q.flac");
    }

    #[tokio::test]
    async fn missing_isrc_is_a_validation_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let ctx = services(crate::config::for_mock("http://127.0.0.1:9", dir.path().to_path_buf()));
        let job = Job::new(request("qobuz", dir.path()), SideFetch::empty(), SideFetch::empty());

        let err = QobuzProvider.download(&ctx, &job).await.expect_err("no isrc");
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_isrc_lookup_gives_up() {
        let dir = tempfile::tempdir().expect("temp dir");
        let ctx = services(crate::config::for_mock("http://127.0.0.1:9", dir.path().to_path_buf()));
        let stalled = SideFetch::spawn(futures::future::pending::<Option<String>>());
        let job = Job::new(request("qobuz", dir.path()), stalled, SideFetch::empty());
        let start = tokio::time::Instant::now();

        let err = QobuzProvider.download(&ctx, &job).await.expect_err("no isrc");

        assert!(matches!(err, Error::Validation(_)));
        assert!(start.elapsed() >= SIDE_FETCH_WAIT);
    }

    #[tokio::test]
    async fn downloads_and_tags_by_isrc() {
        let base = Arc::new(OnceLock::<String>::new());
        let relay_base = base.clone();
        let router = Router::new()
            .route(
                "/qobuz-api/track/search",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    assert_eq!(q.get("query").map(String::as_str), Some("USRC17607839"));
                    Json(json!({ "tracks": { "items": [{ "id": 555, "title": "Song" }] } }))
                }),
            )
            .route(
                "/qobuz-relay/stream",
                get(move |Query(q): Query<HashMap<String, String>>| {
                    let base = relay_base.get().cloned().unwrap_or_default();
                    async move {
                        assert_eq!(q.get("trackId").map(String::as_str), Some("555"));
                        Json(json!({ "url": format!("{base}/file.flac") }))
                    }
                }),
            )
            .route("/file.flac", get(|| async { synthetic_flac(120 * 1024) }));
        let server = MockServer::start(router).await;
        base.set(server.base.clone()).expect("base set once");

        let dir = tempfile::tempdir().expect("temp dir");
        let ctx = services(server.config(dir.path()));
        let job = Job::new(
            request("qobuz", dir.path()),
            SideFetch::ready(Some("USRC17607839".to_string())),
            SideFetch::empty(),
        );

        let out = QobuzProvider.download(&ctx, &job).await.expect("download");

        assert_eq!(out, dir.path().join("Song - Artist.flac"));
        let tags = metadata::flac::read_tags(&out).expect("tags");
        assert_eq!(tags.title.as_deref(), Some("Song"));
    }
}
