pub(super) mod amazon;
pub(super) mod deezer;
pub(super) mod qobuz;
pub(super) mod tidal;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use reqwest::Client;
use tracing::{debug, trace, warn};

use crate::{
    config::Config,
    cover::fetch_cover,
    error::Result,
    helpers::{filename, side_fetch::SideFetch, temp_path::TempPath},
    linking::LinkResolver,
    metadata::{self, Metadata},
    request::{Container, Service, TrackRequest},
};

/// Files at or below this size are treated as leftovers, not finished tracks.
pub const MIN_EXISTING_SIZE: u64 = 100 * 1024;

/// How long tagging and Qobuz wait for the ISRC and genre lookups to land.
pub(super) const SIDE_FETCH_WAIT: Duration = Duration::from_secs(45);

pub static HANDLERS: Lazy<Vec<DownloadHandler>> = Lazy::new(|| {
    vec![
        DownloadHandler::new(tidal::TidalProvider),
        DownloadHandler::new(amazon::AmazonProvider),
        DownloadHandler::new(qobuz::QobuzProvider),
        DownloadHandler::new(deezer::DeezerProvider),
    ]
});

pub fn for_service(service: Service) -> Option<&'static DownloadHandler> {
    HANDLERS.iter().find(|h| h.supports(service))
}

/// Shared collaborators handed to every provider.
#[derive(Debug, Clone)]
pub struct Services {
    pub client: Client,
    pub cfg: Arc<Config>,
    pub resolver: Arc<LinkResolver>,
}

/// One track being downloaded.
#[derive(Debug)]
pub struct Job {
    pub request: TrackRequest,
    pub isrc: SideFetch<String>,
    pub genre: SideFetch<String>,
    partial: Mutex<Option<PathBuf>>,
}

impl Job {
    pub fn new(request: TrackRequest, isrc: SideFetch<String>, genre: SideFetch<String>) -> Self {
        Self {
            request,
            isrc,
            genre,
            partial: Mutex::new(None),
        }
    }

    pub fn expected_path(&self, container: Container) -> PathBuf {
        filename::expected_path(&self.request, container)
    }

    pub fn output_dir(&self) -> &Path {
        Path::new(&self.request.output_dir)
    }

    /// Marks `path` as the output the caller has to remove if the job fails.
    pub fn track_partial(&self, path: &Path) {
        trace!(?path, "Tracking output file");
        *self.partial.lock() = Some(path.to_path_buf());
    }

    pub fn take_partial(&self) -> Option<PathBuf> {
        self.partial.lock().take()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOutput {
    Downloaded(PathBuf),
    AlreadyExists(PathBuf),
}

#[derive(Debug)]
pub struct DownloadHandler {
    provider: Box<dyn Handler>,
}
impl DownloadHandler {
    fn new<T>(provider: T) -> Self
    where
        T: Handler + 'static,
    {
        Self {
            provider: Box::new(provider),
        }
    }

    pub fn supports(&self, service: Service) -> bool {
        self.provider.supports(service)
    }

    /// A finished file for `req` in any container this provider produces.
    pub fn existing_output(&self, req: &TrackRequest) -> Option<PathBuf> {
        self.provider
            .outputs()
            .iter()
            .map(|c| filename::expected_path(req, *c))
            .find(|p| is_complete_file(p))
    }

    pub async fn download(&self, ctx: &Services, job: &Job) -> Result<ProviderOutput> {
        if let Some(existing) = self.existing_output(&job.request) {
            debug!(?existing, "File already exists");
            return Ok(ProviderOutput::AlreadyExists(existing));
        }

        self.provider
            .download(ctx, job)
            .await
            .map(ProviderOutput::Downloaded)
    }
}

#[async_trait::async_trait]
pub trait Handler: std::fmt::Debug + Send + Sync {
    /// Fetches, renames and tags the track, returning the final path.
    async fn download(&self, ctx: &Services, job: &Job) -> Result<PathBuf>;

    fn supports(&self, service: Service) -> bool;

    fn outputs(&self) -> &'static [Container] {
        &[Container::Flac]
    }
}

pub fn is_complete_file(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > MIN_EXISTING_SIZE)
}

/// Moves a fetched file to `target` and tags it.
///
/// From here on nothing fails the job: cover and tag problems are logged and
/// the untagged file is kept.
pub(super) async fn finalize(ctx: &Services, job: &Job, fetched: &Path, target: PathBuf) -> Result<PathBuf> {
    if fetched != target {
        tokio::fs::rename(fetched, &target).await?;
        debug!(from = ?fetched, to = ?target, "Renamed download");
    }
    job.track_partial(&target);

    let req = &job.request;
    let cover = fetch_cover(&ctx.client, &req.cover_url, &target, req.embed_max_quality_cover).await;

    let meta = Metadata::from_request(req, &ctx.cfg.description_tag)
        .with_isrc(job.isrc.wait_for(SIDE_FETCH_WAIT).await)
        .with_genre(job.genre.wait_for(SIDE_FETCH_WAIT).await);

    if let Err(e) = metadata::embed(&ctx.cfg, &target, &meta, cover.as_ref().map(TempPath::path)).await {
        warn!(?e, "Failed to embed metadata, keeping untagged file");
    }

    Ok(target)
}
