use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use rand::seq::SliceRandom;
use reqwest::Client;
use serde::Deserialize;
use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
};
use tracing::{debug, info, trace, warn};

use super::{finalize, Handler, Job, Services};
use crate::{
    downloader::manifest::{parse_manifest, StreamDescriptor},
    error::{Error, Result},
    helpers::{
        download::{download_file, get_file_response, write_resp},
        http::{parse_json, send_checked},
        temp_path::TempPath,
    },
    processor::ffmpeg::transcode_to_flac,
    request::{Container, Service},
};

const API_TIMEOUT: Duration = Duration::from_secs(15);
const SEGMENT_TIMEOUT: Duration = Duration::from_secs(120);
const FILE_TIMEOUT: Duration = Duration::from_secs(300);

const HI_RES: &str = "HI_RES";
const LOSSLESS: &str = "LOSSLESS";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TrackResponse {
    Manifest { data: ManifestData },
    Files(Vec<TrackFile>),
}

#[derive(Debug, Deserialize)]
struct ManifestData {
    #[serde(default)]
    manifest: String,
}

#[derive(Debug, Deserialize)]
struct TrackFile {
    #[serde(rename = "OriginalTrackUrl", default)]
    original_track_url: String,
}

impl TrackResponse {
    fn into_stream(self) -> Result<StreamDescriptor> {
        match self {
            Self::Manifest { data } if !data.manifest.is_empty() => parse_manifest(&data.manifest),
            Self::Files(files) => files
                .into_iter()
                .map(|f| f.original_track_url)
                .find(|u| !u.is_empty())
                .map(|url| StreamDescriptor::Direct {
                    url,
                    mime_type: None,
                })
                .ok_or_else(|| Error::transient("tidal", "no download URL in response")),
            Self::Manifest { .. } => Err(Error::transient("tidal", "empty manifest in response")),
        }
    }
}

#[derive(Debug)]
pub struct TidalProvider;

#[async_trait::async_trait]
impl Handler for TidalProvider {
    #[tracing::instrument(skip_all, fields(spotify_id = %job.request.spotify_id))]
    async fn download(&self, ctx: &Services, job: &Job) -> Result<PathBuf> {
        let req = &job.request;

        let tidal_url = if req.service_url.is_empty() {
            ctx.resolver.tidal_url(&req.spotify_id, &req.region).await?
        } else {
            req.service_url.clone()
        };
        let track_id = track_id(&tidal_url)
            .ok_or_else(|| Error::validation(format!("no Tidal track id in {tidal_url}")))?;
        debug!(%track_id, "Resolved Tidal track");

        let apis = Self::api_sources(ctx, &req.api_url);
        let stream = Self::get_stream(&ctx.client, &apis, track_id, &req.audio_format, req.allow_fallback).await?;

        let target = job.expected_path(Container::Flac);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let flat_flac = stream.is_flac();
        match stream {
            StreamDescriptor::Direct { url, .. } if flat_flac => {
                job.track_partial(&target);
                download_file(&ctx.client, &target, &url, FILE_TIMEOUT).await?;
            }
            StreamDescriptor::Direct { url, .. } => {
                let raw = TempPath::beside(&target, "m4a.tmp");
                download_file(&ctx.client, raw.path(), &url, FILE_TIMEOUT).await?;
                Self::transcode(ctx, raw, &target).await?;
            }
            StreamDescriptor::Segmented {
                init_url,
                media_urls,
            } => {
                let raw = TempPath::beside(&target, "m4a.tmp");
                let bytes = fetch_segments(&ctx.client, &init_url, &media_urls, raw.path()).await?;
                info!(segments = media_urls.len(), bytes, "Segments downloaded");
                Self::transcode(ctx, raw, &target).await?;
            }
        }

        finalize(ctx, job, &target, target.clone()).await
    }

    fn supports(&self, service: Service) -> bool {
        service == Service::Tidal
    }
}

impl TidalProvider {
    /// The pinned API, or every configured one.
    fn api_sources(ctx: &Services, pinned: &str) -> Vec<String> {
        let pinned = pinned.trim();
        if pinned.is_empty() || pinned.eq_ignore_ascii_case("auto") {
            ctx.cfg.tidal_apis.clone()
        } else {
            vec![pinned.trim_end_matches('/').to_string()]
        }
    }

    /// Stream for `quality`, dropping from HI_RES to LOSSLESS once when
    /// fallback is allowed.
    async fn get_stream(
        client: &Client,
        apis: &[String],
        track_id: &str,
        quality: &str,
        allow_fallback: bool,
    ) -> Result<StreamDescriptor> {
        match Self::rotate(client, apis, track_id, quality).await {
            Err(e) if allow_fallback && quality.eq_ignore_ascii_case(HI_RES) => {
                warn!(?e, "HI_RES unavailable, falling back to LOSSLESS");
                Self::rotate(client, apis, track_id, LOSSLESS).await
            }
            res => res,
        }
    }

    /// Tries each API once, in random order.
    async fn rotate(client: &Client, apis: &[String], track_id: &str, quality: &str) -> Result<StreamDescriptor> {
        let mut order = apis.to_vec();
        order.shuffle(&mut rand::rng());

        let mut last_error = None;
        for api in &order {
            match Self::fetch_stream(client, api, track_id, quality).await {
                Ok(stream) => {
                    info!(%api, quality, "Got Tidal stream");
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(%api, ?e, "Tidal API failed");
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(Error::ProvidersExhausted {
            provider: "tidal",
            attempts: order.len(),
            last: last_error.unwrap_or_else(|| "no APIs configured".to_string()),
        })
    }

    async fn fetch_stream(client: &Client, api: &str, track_id: &str, quality: &str) -> Result<StreamDescriptor> {
        let req = client
            .get(format!("{api}/track/"))
            .query(&[("id", track_id), ("quality", quality)])
            .timeout(API_TIMEOUT);

        let body = send_checked(req).await?.bytes().await?;
        trace!(len = body.len(), "Tidal API response");

        parse_json::<TrackResponse>("tidal", &body)?.into_stream()
    }

    /// Re-encodes the raw stream into `target`. When that fails the raw
    /// stream is kept as `<stem>.m4a` and reported in the error.
    async fn transcode(ctx: &Services, raw: TempPath, target: &Path) -> Result<()> {
        match transcode_to_flac(&ctx.cfg, raw.path(), target).await {
            Ok(()) => {
                debug!(?target, "Transcoded to FLAC");
                Ok(())
            }
            Err(Error::Transcode { reason, .. }) => {
                match tokio::fs::remove_file(target).await {
                    Ok(()) => debug!(?target, "Removed incomplete FLAC"),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => warn!(?target, ?e, "Failed to remove incomplete FLAC"),
                }

                let preserved = target.with_extension("m4a");
                match tokio::fs::rename(raw.path(), &preserved).await {
                    Ok(()) => {
                        raw.keep();
                        warn!(?preserved, %reason, "Transcode failed, raw stream kept");
                        Err(Error::Transcode {
                            reason,
                            preserved: Some(preserved),
                        })
                    }
                    Err(e) => {
                        warn!(?e, "Could not keep raw stream");
                        Err(Error::Transcode {
                            reason,
                            preserved: None,
                        })
                    }
                }
            }
            Err(e) => Err(e),
        }
    }
}

/// Numeric id following `/track/`.
pub fn track_id(tidal_url: &str) -> Option<&str> {
    let (_, rest) = tidal_url.split_once("/track/")?;
    let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let id = &rest[..end];

    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

/// Concatenates the init segment and every media segment into `out`, one
/// request at a time and strictly in order.
pub async fn fetch_segments(client: &Client, init_url: &str, media_urls: &[String], out: &Path) -> Result<u64> {
    let file = File::create(out).await?;
    let mut writer = BufWriter::new(file);

    let init = get_file_response(client, init_url, SEGMENT_TIMEOUT).await?;
    let mut written = write_resp(init, &mut writer).await?;

    for (i, url) in media_urls.iter().enumerate() {
        trace!(segment = i + 1, total = media_urls.len(), "Fetching segment");
        let resp = get_file_response(client, url, SEGMENT_TIMEOUT).await?;
        written += write_resp(resp, &mut writer).await?;
    }

    writer.flush().await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{Arc, OnceLock},
    };

    use axum::{
        extract::{Path as AxumPath, Query},
        http::StatusCode,
        response::IntoResponse,
        routing::get,
        Json, Router,
    };
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::{
        downloader::{
            handlers::tests::{job, request, services},
            manifest::tests::encode,
        },
        helpers::http::build_client,
        test_support::MockServer,
    };

    type Seen = Arc<Mutex<Vec<String>>>;

    fn quality_router(seen: Seen) -> Router {
        Router::new().route(
            "/tidal/track/",
            get(move |Query(q): Query<HashMap<String, String>>| {
                let seen = seen.clone();
                async move {
                    let quality = q.get("quality").cloned().unwrap_or_default();
                    seen.lock().push(quality.clone());

                    if quality == HI_RES {
                        StatusCode::NOT_FOUND.into_response()
                    } else {
                        Json(json!([{ "OriginalTrackUrl": "https://cdn.invalid/a.flac" }])).into_response()
                    }
                }
            }),
        )
    }

    #[test]
    fn track_ids_are_digits_after_track() {
        assert_eq!(track_id("https://tidal.com/browse/track/12345?u"), Some("12345"));
        assert_eq!(track_id("https://listen.tidal.com/track/987/lyrics"), Some("987"));
        assert_eq!(track_id("https://tidal.com/album/1"), None);
        assert_eq!(track_id("https://tidal.com/track/abc"), None);
    }

    #[test]
    fn v2_response_with_empty_manifest_is_rejected() {
        let resp: TrackResponse =
            serde_json::from_value(json!({ "data": { "manifest": "" } })).expect("shape");
        assert!(resp.into_stream().is_err());
    }

    #[test]
    fn v2_manifest_is_decoded() {
        let manifest = encode(r#"{"mimeType":"audio/flac","urls":["https://cdn/x.flac"]}"#);
        let resp: TrackResponse =
            serde_json::from_value(json!({ "data": { "manifest": manifest } })).expect("shape");

        assert!(resp.into_stream().expect("stream").is_flac());
    }

    #[tokio::test]
    async fn hi_res_falls_back_once_when_allowed() {
        let seen = Seen::default();
        let server = MockServer::start(quality_router(seen.clone())).await;
        let client = build_client(&server.config(&std::env::temp_dir()));
        let apis = vec![format!("{}/tidal", server.base)];

        let stream = TidalProvider::get_stream(&client, &apis, "1", HI_RES, true)
            .await
            .expect("fallback stream");

        assert!(matches!(stream, StreamDescriptor::Direct { .. }));
        assert_eq!(*seen.lock(), vec![HI_RES.to_string(), LOSSLESS.to_string()]);
    }

    #[tokio::test]
    async fn no_fallback_without_permission() {
        let seen = Seen::default();
        let server = MockServer::start(quality_router(seen.clone())).await;
        let client = build_client(&server.config(&std::env::temp_dir()));
        let apis = vec![format!("{}/tidal", server.base)];

        let err = TidalProvider::get_stream(&client, &apis, "1", HI_RES, false)
            .await
            .expect_err("no fallback");

        assert!(matches!(err, Error::ProvidersExhausted { attempts: 1, .. }));
        assert_eq!(*seen.lock(), vec![HI_RES.to_string()]);
    }

    #[tokio::test]
    async fn rotation_tries_every_api() {
        let seen = Seen::default();
        let server = MockServer::start(quality_router(seen.clone())).await;
        let client = build_client(&server.config(&std::env::temp_dir()));
        let apis = vec![
            format!("{}/down-1", server.base),
            format!("{}/tidal", server.base),
            format!("{}/down-2", server.base),
        ];

        let stream = TidalProvider::rotate(&client, &apis, "1", LOSSLESS).await;

        assert!(stream.is_ok());
        assert_eq!(*seen.lock(), vec![LOSSLESS.to_string()]);
    }

    #[tokio::test]
    async fn segments_are_written_in_order() {
        // Earlier segments answer slower, so any concurrency would reorder them.
        let router = Router::new().route(
            "/seg/{file}",
            get(|AxumPath(file): AxumPath<String>| async move {
                if file == "init.mp4" {
                    return b"INIT|".to_vec();
                }

                let n: u64 = file.trim_end_matches(".mp4").parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(60 - n * 10)).await;
                format!("S{n}|").into_bytes()
            }),
        );
        let server = MockServer::start(router).await;
        let client = build_client(&server.config(&std::env::temp_dir()));
        let dir = tempfile::tempdir().expect("temp dir");
        let out = dir.path().join("raw.m4a.tmp");

        let media = (1..=5)
            .map(|n| format!("{}/seg/{n}.mp4", server.base))
            .collect::<Vec<_>>();
        let written = fetch_segments(&client, &format!("{}/seg/init.mp4", server.base), &media, &out)
            .await
            .expect("segments");

        let body = std::fs::read_to_string(&out).expect("read");
        assert_eq!(body, "INIT|S1|S2|S3|S4|S5|");
        assert_eq!(written, body.len() as u64);
    }

    #[tokio::test]
    async fn failed_transcode_keeps_the_raw_stream() {
        let base = Arc::new(OnceLock::<String>::new());
        let manifest_base = base.clone();
        let router = Router::new()
            .route(
                "/tidal/track/",
                get(move || {
                    let base = manifest_base.get().cloned().unwrap_or_default();
                    async move {
                        let manifest = encode(&format!(
                            r#"{{"mimeType":"audio/mp4","codecs":"mp4a.40.2","urls":["{base}/raw.m4a"]}}"#
                        ));
                        Json(json!({ "data": { "manifest": manifest } }))
                    }
                }),
            )
            .route("/raw.m4a", get(|| async { vec![7u8; 2048] }));
        let server = MockServer::start(router).await;
        base.set(server.base.clone()).expect("base set once");

        let dir = tempfile::tempdir().expect("temp dir");
        // No ffmpeg in the install directory and PATH lookup disabled.
        let ctx = services(server.config(dir.path()));
        let mut req = request("tidal", dir.path());
        req.service_url = "https://tidal.com/browse/track/42".to_string();
        let job = job(req);

        let err = TidalProvider.download(&ctx, &job).await.expect_err("no ffmpeg");

        let kept = dir.path().join("Song - Artist.m4a");
        match err {
            Error::Transcode { preserved, .. } => assert_eq!(preserved.as_deref(), Some(kept.as_path())),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(std::fs::read(&kept).expect("kept").len(), 2048);
        assert!(!dir.path().join("Song - Artist.flac").exists());
        assert!(!dir.path().join("Song - Artist.flac.m4a.tmp").exists());
        assert_eq!(job.take_partial(), None);
    }

    #[tokio::test]
    async fn failed_transcode_removes_the_half_written_flac() {
        let dir = tempfile::tempdir().expect("temp dir");
        let ctx = services(crate::config::for_mock("http://127.0.0.1:9", dir.path().to_path_buf()));
        let target = dir.path().join("Song - Artist.flac");
        std::fs::write(&target, b"fLaC").expect("write target");
        let raw = TempPath::beside(&target, "m4a.tmp");
        std::fs::write(raw.path(), vec![7u8; 512]).expect("write raw");

        let err = TidalProvider::transcode(&ctx, raw, &target).await.expect_err("no ffmpeg");

        assert!(matches!(err, Error::Transcode { preserved: Some(_), .. }));
        assert!(!target.exists());
        assert_eq!(std::fs::read(dir.path().join("Song - Artist.m4a")).expect("kept").len(), 512);
    }
}
