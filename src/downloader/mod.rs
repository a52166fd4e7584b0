mod backfill;
mod handlers;
pub(crate) mod manifest;

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use backfill::Backfill;
use handlers::{DownloadHandler, Job, ProviderOutput, Services};
use tracing::{debug, info, trace, warn};

pub use self::handlers::{is_complete_file, MIN_EXISTING_SIZE};
use crate::{
    config::Config,
    error::{Error, Result},
    genre::fetch_genre,
    helpers::{
        filename::{sanitize, sanitize_folder_path},
        http::build_client,
        id::item_id,
        side_fetch::SideFetch,
    },
    linking::{LinkResolver, RateLimiter},
    lyrics::LyricsClient,
    metadata,
    processor::probe,
    queue::{HistoryEntry, QueueSink},
    request::{
        DownloadOutcome, Service, TrackRequest, DEFAULT_AUDIO_FORMAT, DEFAULT_FILENAME_FORMAT,
        DEFAULT_OUTPUT_DIR, DEFAULT_SERVICE,
    },
};

/// How long a fresh download waits for its lyrics before giving up on them.
const LYRICS_WAIT: Duration = Duration::from_secs(60);

/// Entry point for downloading tracks. Cheap to share behind an `Arc`;
/// concurrent calls are allowed.
#[derive(Debug)]
pub struct Downloader {
    services: Services,
    lyrics: LyricsClient,
    backfill: Backfill,
    queue: Arc<dyn QueueSink>,
    active: AtomicUsize,
}

impl Downloader {
    pub fn new(cfg: Arc<Config>, limiter: Arc<RateLimiter>, queue: Arc<dyn QueueSink>) -> Self {
        let client = build_client(&cfg);
        let resolver = LinkResolver::new(client.clone(), cfg.clone(), limiter);
        let lyrics = LyricsClient::new(client.clone(), cfg.clone());

        Self {
            services: Services {
                client,
                cfg,
                resolver: Arc::new(resolver),
            },
            lyrics,
            backfill: Backfill::default(),
            queue,
            active: AtomicUsize::new(0),
        }
    }

    pub fn resolver(&self) -> &LinkResolver {
        &self.services.resolver
    }

    /// Advisory only: true while any [`Self::download_track`] call runs.
    pub fn is_downloading(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    /// Downloads one track and reports every step to the queue sink.
    ///
    /// Never panics and never returns an error: failures are described by the
    /// outcome, and any partially written output file is removed.
    #[tracing::instrument(skip_all, fields(service = %req.service, spotify_id = %req.spotify_id))]
    pub async fn download_track(&self, mut req: TrackRequest) -> DownloadOutcome {
        let _active = ActiveGuard::enter(&self.active);

        fill_defaults(&mut req);
        let item_id = self.register(&mut req);

        let handler = match select_handler(&req) {
            Ok(h) => h,
            Err(e) => return self.fail(item_id, &e),
        };
        self.queue.start_item(&item_id);

        // File names may use backfilled fields.
        if let Some(base) = &self.services.cfg.track_info_base {
            self.backfill.fill(&self.services.client, base, &mut req).await;
        }

        if let Some(existing) = handler.existing_output(&req) {
            info!(?existing, "File already exists, skipping");
            self.queue.skip_item(&item_id, &existing);
            return DownloadOutcome::existing(item_id, existing);
        }

        let isrc = self.spawn_isrc(&req);
        let genre = self.spawn_genre(&req, &isrc);
        let lyrics = self.spawn_lyrics(&req);
        let job = Job::new(req, isrc, genre);

        info!("Starting download");
        match handler.download(&self.services, &job).await {
            Ok(ProviderOutput::Downloaded(path)) => {
                if job.request.embed_lyrics {
                    self.embed_lyrics(&path, &lyrics).await;
                }
                drop(lyrics);

                let size_mb = file_size_mb(&path).await;
                self.queue.complete_item(&item_id, &path, size_mb);
                self.record_history(&job.request, path.clone());

                info!(?path, size_mb, "Download completed");
                DownloadOutcome::downloaded(item_id, path)
            }
            Ok(ProviderOutput::AlreadyExists(path)) => {
                self.queue.skip_item(&item_id, &path);
                DownloadOutcome::existing(item_id, path)
            }
            Err(e) => {
                discard_partial(&job).await;
                self.fail(item_id, &e)
            }
        }
    }

    fn register(&self, req: &mut TrackRequest) -> String {
        if req.item_id.is_empty() {
            req.item_id = item_id(&req.spotify_id);
            self.queue.add_item(
                &req.item_id,
                &req.track_name,
                &req.artist_name,
                &req.album_name,
                &req.spotify_id,
            );
        }
        req.item_id.clone()
    }

    fn fail(&self, item_id: String, err: &Error) -> DownloadOutcome {
        warn!(?err, %item_id, "Download failed");
        let outcome = DownloadOutcome::failed(item_id, err);
        self.queue
            .fail_item(&outcome.item_id, outcome.error.as_deref().unwrap_or_default());
        outcome
    }

    fn spawn_isrc(&self, req: &TrackRequest) -> SideFetch<String> {
        if req.spotify_id.is_empty() {
            return SideFetch::empty();
        }

        let resolver = self.services.resolver.clone();
        let spotify_id = req.spotify_id.clone();
        SideFetch::spawn(async move {
            match resolver.isrc(&spotify_id).await {
                Ok(isrc) => {
                    debug!(%isrc, "Resolved ISRC");
                    Some(isrc)
                }
                Err(e) => {
                    debug!(?e, "ISRC lookup failed");
                    None
                }
            }
        })
    }

    fn spawn_genre(&self, req: &TrackRequest, isrc: &SideFetch<String>) -> SideFetch<String> {
        if !req.embed_genre || req.spotify_id.is_empty() {
            return SideFetch::empty();
        }

        let client = self.services.client.clone();
        let cfg = self.services.cfg.clone();
        let isrc = isrc.clone();
        let single = req.use_single_genre;
        SideFetch::spawn(async move {
            let isrc = isrc.wait().await?;
            match fetch_genre(&client, &cfg, &isrc, single).await {
                Ok(genre) => Some(genre),
                Err(e) => {
                    warn!(?e, "Genre lookup failed");
                    None
                }
            }
        })
    }

    fn spawn_lyrics(&self, req: &TrackRequest) -> SideFetch<String> {
        if !req.embed_lyrics || req.spotify_id.is_empty() {
            return SideFetch::empty();
        }

        let lyrics = self.lyrics.clone();
        let spotify_id = req.spotify_id.clone();
        let track = req.track_name.clone();
        let artist = req.artist_name.clone();
        let duration = req.duration;
        SideFetch::spawn(async move {
            match lyrics.fetch_lrc(&spotify_id, &track, &artist, duration).await {
                Ok(lrc) => Some(lrc),
                Err(e) => {
                    debug!(?e, "No lyrics found");
                    None
                }
            }
        })
    }

    async fn embed_lyrics(&self, path: &Path, lyrics: &SideFetch<String>) {
        let Some(lrc) = lyrics.wait_for(LYRICS_WAIT).await else {
            trace!("No lyrics to embed");
            return;
        };

        if let Err(e) = metadata::embed_lyrics(&self.services.cfg, path, &lrc).await {
            warn!(?e, "Failed to embed lyrics");
        }
    }

    /// Probes the finished file in the background and hands a history entry
    /// to the queue sink.
    fn record_history(&self, req: &TrackRequest, path: PathBuf) {
        let cfg = self.services.cfg.clone();
        let queue = self.queue.clone();
        let mut entry = HistoryEntry {
            spotify_id: req.spotify_id.clone(),
            title: req.track_name.clone(),
            artists: req.artist_name.clone(),
            album: req.album_name.clone(),
            duration: "--:--".to_string(),
            cover_url: req.cover_url.clone(),
            quality: "Unknown".to_string(),
            format: history_format(&req.audio_format, &path),
            path,
        };

        tokio::spawn(async move {
            match probe::properties(&cfg, &entry.path).await {
                Ok(props) => {
                    entry.quality = props.quality_label();
                    entry.duration = props.duration_label();
                }
                Err(e) => debug!(?e, path = ?entry.path, "Could not probe finished file"),
            }
            queue.record_history(entry);
        });
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn fill_defaults(req: &mut TrackRequest) {
    if req.service.is_empty() {
        req.service = DEFAULT_SERVICE.to_string();
    }
    if req.audio_format.is_empty() {
        req.audio_format = DEFAULT_AUDIO_FORMAT.to_string();
    }
    if req.filename_format.is_empty() {
        req.filename_format = DEFAULT_FILENAME_FORMAT.to_string();
    }
    if req.output_dir.is_empty() {
        req.output_dir = DEFAULT_OUTPUT_DIR.to_string();
    }

    let mut out_dir = PathBuf::from(&req.output_dir);
    if !req.playlist_name.is_empty() {
        out_dir.push(sanitize(&req.playlist_name));
    }
    req.output_dir = sanitize_folder_path(&out_dir.to_string_lossy())
        .to_string_lossy()
        .into_owned();
}

fn select_handler(req: &TrackRequest) -> Result<&'static DownloadHandler> {
    let service = Service::from_str(&req.service)?;
    if service == Service::Qobuz && req.spotify_id.is_empty() {
        return Err(Error::validation("a Spotify id is required for Qobuz downloads"));
    }

    handlers::for_service(service)
        .ok_or_else(|| Error::validation(format!("no handler for service {service}")))
}

async fn discard_partial(job: &Job) {
    let Some(partial) = job.take_partial() else {
        return;
    };
    if !partial.exists() {
        return;
    }

    match tokio::fs::remove_file(&partial).await {
        Ok(()) => debug!(?partial, "Removed partial download"),
        Err(e) => warn!(?partial, ?e, "Failed to remove partial download"),
    }
}

async fn file_size_mb(path: &Path) -> f64 {
    let bytes = tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or_default();

    #[allow(clippy::cast_precision_loss)]
    let mb = bytes as f64 / (1024.0 * 1024.0);
    mb
}

/// Upper-cased request format, or the file extension when the request only
/// named a quality tier.
fn history_format(requested: &str, path: &Path) -> String {
    let requested = requested.to_uppercase();
    match requested.as_str() {
        "6" | "7" | "27" => "FLAC".to_string(),
        "" | "LOSSLESS" => path
            .extension()
            .map(|e| e.to_string_lossy().to_uppercase())
            .unwrap_or(requested),
        _ => requested,
    }
}
