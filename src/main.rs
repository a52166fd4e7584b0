use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter::Builder as TracingFilterBuilder, util::SubscriberInitExt};
use tunefetch::{
    linking::RateLimiter,
    processor::probe,
    Config, Downloader, MemoryQueue, TrackRequest,
};
use url::Url;

#[derive(Debug, Parser)]
#[command(version, about = "Download lossless tracks for Spotify songs")]
struct Args {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Download every track described in a JSON file.
    ///
    /// The file holds one request object or an array of them. Tracks are
    /// downloaded one after another.
    Download {
        #[arg(long, short)]
        request: PathBuf,
    },

    /// Show where a Spotify track is available.
    Links {
        /// Spotify track id or `open.spotify.com` URL.
        track: String,

        #[arg(long, default_value = "")]
        region: String,
    },

    /// Print the tags and stream properties of an audio file.
    Inspect { file: PathBuf },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Requests {
    Many(Vec<TrackRequest>),
    One(Box<TrackRequest>),
}

impl Requests {
    fn into_vec(self) -> Vec<TrackRequest> {
        match self {
            Self::Many(v) => v,
            Self::One(r) => vec![*r],
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match dotenvy::dotenv() {
        Err(e) if e.not_found() => {}
        Ok(_) => {}
        Err(e) => {
            bail!("Failed to load .env file: {}", e);
        }
    }

    init_log();

    let args = Args::parse();
    trace!(?args, "Parsed arguments");

    let cfg = Arc::new(Config::from_env());
    let queue = Arc::new(MemoryQueue::default());
    let downloader = Downloader::new(cfg.clone(), Arc::new(RateLimiter::default()), queue);

    match args.cmd {
        Cmd::Download { request } => download(&downloader, request).await,
        Cmd::Links { track, region } => links(&downloader, &track, &region).await,
        Cmd::Inspect { file } => inspect(&cfg, file).await,
    }
}

async fn download(downloader: &Downloader, request: PathBuf) -> anyhow::Result<()> {
    let raw = tokio::fs::read(&request)
        .await
        .with_context(|| format!("Failed to read {}", request.display()))?;
    let requests = serde_json::from_slice::<Requests>(&raw)
        .context("Request file is not a track request or a list of them")?
        .into_vec();

    info!(count = requests.len(), "Starting downloads");

    let mut failed = 0;
    for req in requests {
        let outcome = downloader.download_track(req).await;
        if !outcome.success {
            failed += 1;
        }
        println!("{}", serde_json::to_string(&outcome)?);
    }

    if failed > 0 {
        warn!(failed, "Some downloads failed");
        bail!("{failed} download(s) failed");
    }

    info!("All downloads finished");
    Ok(())
}

async fn links(downloader: &Downloader, track: &str, region: &str) -> anyhow::Result<()> {
    let spotify_id = spotify_id(track)?;
    let availability = downloader.resolver().availability(&spotify_id).await?;

    if !region.is_empty() {
        match downloader.resolver().resolve(&spotify_id, region).await {
            Ok(links) => info!(?links, region, "Regional links"),
            Err(e) => warn!(?e, region, "No regional links"),
        }
    }

    println!("{}", serde_json::to_string_pretty(&availability)?);
    Ok(())
}

async fn inspect(cfg: &Config, file: PathBuf) -> anyhow::Result<()> {
    let tags = probe::read_tags(cfg, &file)
        .await
        .with_context(|| format!("Failed to read tags from {}", file.display()))?;
    let props = probe::properties(cfg, &file).await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "tags": tags,
            "properties": props,
            "quality": props.quality_label(),
            "duration": props.duration_label(),
        }))?
    );
    Ok(())
}

/// Accepts a bare id or an `open.spotify.com/track/<id>` URL.
fn spotify_id(track: &str) -> anyhow::Result<String> {
    let Ok(url) = Url::parse(track) else {
        return Ok(track.to_string());
    };

    let mut segments = url.path_segments().into_iter().flatten();
    while let Some(segment) = segments.next() {
        if segment == "track" {
            if let Some(id) = segments.next().filter(|s| !s.is_empty()) {
                return Ok(id.to_string());
            }
        }
    }

    bail!("No track id in {track}")
}

fn init_log() {
    tracing_subscriber::fmt()
        .with_ansi(true)
        .with_env_filter(
            TracingFilterBuilder::default()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .finish()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spotify_ids_from_urls() {
        assert_eq!(spotify_id("abc123").expect("id"), "abc123");
        assert_eq!(
            spotify_id("https://open.spotify.com/track/abc123?si=x").expect("id"),
            "abc123"
        );
        assert_eq!(
            spotify_id("https://open.spotify.com/intl-de/track/abc123").expect("id"),
            "abc123"
        );
        assert!(spotify_id("https://open.spotify.com/album/xyz").is_err());
    }

    #[test]
    fn request_files_hold_one_or_many() {
        let one = serde_json::from_str::<Requests>(r#"{"service":"deezer","spotify_id":"a"}"#).expect("one");
        assert_eq!(one.into_vec().len(), 1);

        let many = serde_json::from_str::<Requests>(r#"[{"spotify_id":"a"},{"spotify_id":"b"}]"#).expect("many");
        assert_eq!(many.into_vec().len(), 2);
    }
}
