use std::{path::Path, time::Duration};

use reqwest::Client;
use tracing::{debug, warn};

use crate::helpers::{download::download_file, temp_path::TempPath};

const COVER_TIMEOUT: Duration = Duration::from_secs(30);

const SIZE_300: &str = "ab67616d00001e02";
const SIZE_640: &str = "ab67616d0000b273";
const SIZE_MAX: &str = "ab67616d000082c1";

/// Swaps the Spotify image size token for a bigger one.
pub fn upgrade_cover_url(url: &str, max_quality: bool) -> String {
    let url = url.replace(SIZE_300, SIZE_640);
    if max_quality {
        url.replace(SIZE_640, SIZE_MAX)
    } else {
        url
    }
}

/// Fetches the cover next to `audio_path`. The guard removes the image once
/// tagging is done. Any failure only costs the cover.
#[tracing::instrument(skip(client))]
pub async fn fetch_cover(
    client: &Client,
    cover_url: &str,
    audio_path: &Path,
    max_quality: bool,
) -> Option<TempPath> {
    if cover_url.trim().is_empty() {
        return None;
    }

    let url = upgrade_cover_url(cover_url, max_quality);
    let guard = TempPath::beside(audio_path, "cover.jpg");

    match download_file(client, guard.path(), &url, COVER_TIMEOUT).await {
        Ok(0) => {
            warn!("Cover download was empty, continuing without cover");
            None
        }
        Ok(bytes) => {
            debug!(bytes, "Cover downloaded");
            Some(guard)
        }
        Err(e) => {
            warn!(?e, "Failed to download cover, continuing without cover");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::{http::StatusCode, routing::get, Router};

    use super::*;
    use crate::{
        config::Config,
        helpers::http::build_client,
        test_support::{fake_jpeg, MockServer},
    };

    #[test]
    fn size_tokens_are_upgraded() {
        let small = "https://i.scdn.co/image/ab67616d00001e02ff00";
        assert_eq!(
            upgrade_cover_url(small, false),
            "https://i.scdn.co/image/ab67616d0000b273ff00"
        );
        assert_eq!(
            upgrade_cover_url(small, true),
            "https://i.scdn.co/image/ab67616d000082c1ff00"
        );
        assert_eq!(upgrade_cover_url("https://x/y.jpg", true), "https://x/y.jpg");
    }

    #[tokio::test]
    async fn cover_is_cleaned_up_with_its_guard() {
        let server = MockServer::start(
            Router::new().route("/cover.jpg", get(|| async { fake_jpeg() })),
        )
        .await;
        let dir = tempfile::tempdir().expect("temp dir");
        let audio = dir.path().join("Song - Artist.flac");
        let client = build_client(&Config::default());

        let guard = fetch_cover(&client, &format!("{}/cover.jpg", server.base), &audio, false)
            .await
            .expect("cover");
        let cover = guard.path().to_path_buf();
        assert!(cover.exists());

        drop(guard);
        assert!(!cover.exists());
    }

    #[tokio::test]
    async fn server_error_means_no_cover() {
        let server = MockServer::start(Router::new().route(
            "/cover.jpg",
            get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        ))
        .await;
        let dir = tempfile::tempdir().expect("temp dir");
        let client = build_client(&Config::default());

        let cover = fetch_cover(
            &client,
            &format!("{}/cover.jpg", server.base),
            &dir.path().join("a.flac"),
            false,
        )
        .await;

        assert!(cover.is_none());
        assert!(!dir.path().join("a.flac.cover.jpg").exists());
    }
}
