use std::{collections::HashMap, time::Duration};

use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::{error::Result, helpers::http::get_json, request::TrackRequest};

pub const BACKFILL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct TrackInfoResponse {
    track: TrackInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct TrackInfo {
    copyright: String,
    publisher: String,
    total_discs: u32,
    total_tracks: u32,
    track_number: u32,
    release_date: String,
}

/// Fills album facts a request is missing from the track-info service.
///
/// Answers are remembered per Spotify id, so asking again for a track that
/// was already looked up makes no request.
#[derive(Debug, Default)]
pub struct Backfill {
    known: Mutex<HashMap<String, TrackInfo>>,
}

impl Backfill {
    /// Bounded by [`BACKFILL_TIMEOUT`]; any failure leaves the request as it
    /// was.
    #[tracing::instrument(skip_all, fields(spotify_id = %req.spotify_id))]
    pub async fn fill(&self, client: &Client, base: &str, req: &mut TrackRequest) {
        if req.spotify_id.is_empty() || !req.needs_backfill() {
            return;
        }

        let cached = self.known.lock().get(&req.spotify_id).cloned();
        if let Some(info) = cached {
            trace!("Using remembered track details");
            apply(req, info);
            return;
        }

        let fetch = fetch_track_info(client, base, &req.spotify_id);
        match tokio::time::timeout(BACKFILL_TIMEOUT, fetch).await {
            Ok(Ok(info)) => {
                self.known.lock().insert(req.spotify_id.clone(), info.clone());
                apply(req, info);
                debug!("Backfilled track details");
            }
            Ok(Err(e)) => debug!(?e, "Track details unavailable, continuing"),
            Err(_) => debug!("Track details lookup timed out, continuing"),
        }
    }
}

async fn fetch_track_info(client: &Client, base: &str, spotify_id: &str) -> Result<TrackInfo> {
    let url = format!("{}/track/{spotify_id}", base.trim_end_matches('/'));
    trace!(%url, "Fetching track details");

    let resp: TrackInfoResponse = get_json("track info", client.get(url).timeout(BACKFILL_TIMEOUT)).await?;
    Ok(resp.track)
}

fn apply(req: &mut TrackRequest, info: TrackInfo) {
    if req.copyright.is_empty() {
        req.copyright = info.copyright;
    }
    if req.publisher.is_empty() {
        req.publisher = info.publisher;
    }
    if req.release_date.is_empty() {
        req.release_date = info.release_date;
    }
    if req.total_discs == 0 {
        req.total_discs = info.total_discs;
    }
    if req.total_tracks == 0 {
        req.total_tracks = info.total_tracks;
    }
    if req.track_number == 0 {
        req.track_number = info.track_number;
    }
}

#[cfg(test)]
mod tests {
    use axum::{routing::get, Json, Router};
    use serde_json::json;

    use super::*;
    use crate::{config::Config, helpers::http::build_client, test_support::MockServer};

    #[test]
    fn only_missing_fields_are_filled() {
        let mut req = TrackRequest {
            copyright: "(C) Mine".to_string(),
            total_tracks: 12,
            ..TrackRequest::default()
        };
        apply(
            &mut req,
            TrackInfo {
                copyright: "(C) Theirs".to_string(),
                publisher: "Label".to_string(),
                total_discs: 2,
                total_tracks: 10,
                track_number: 4,
                release_date: "2021-05-01".to_string(),
            },
        );

        assert_eq!(req.copyright, "(C) Mine");
        assert_eq!(req.publisher, "Label");
        assert_eq!(req.total_tracks, 12);
        assert_eq!(req.total_discs, 2);
        assert_eq!(req.track_number, 4);
        assert_eq!(req.release_date, "2021-05-01");
    }

    #[tokio::test]
    async fn fetches_from_the_track_info_service() {
        let router = Router::new().route(
            "/info/track/{id}",
            get(|| async { Json(json!({ "track": { "publisher": "Label", "total_discs": 1 } })) }),
        );
        let server = MockServer::start(router).await;
        let client = build_client(&Config::default());
        let mut req = TrackRequest {
            spotify_id: "abc123".to_string(),
            ..TrackRequest::default()
        };

        let backfill = Backfill::default();
        let base = format!("{}/info", server.base);
        backfill.fill(&client, &base, &mut req).await;

        assert_eq!(req.publisher, "Label");
        assert_eq!(req.total_discs, 1);
        assert_eq!(server.hits(), 1);

        let mut again = TrackRequest {
            spotify_id: "abc123".to_string(),
            ..TrackRequest::default()
        };
        backfill.fill(&client, &base, &mut again).await;
        assert_eq!(again.publisher, "Label");
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn failures_leave_the_request_alone() {
        let server = MockServer::start(Router::new()).await;
        let client = build_client(&Config::default());
        let mut req = TrackRequest {
            spotify_id: "abc123".to_string(),
            ..TrackRequest::default()
        };
        let before = req.clone();

        Backfill::default()
            .fill(&client, &format!("{}/info", server.base), &mut req)
            .await;
        assert_eq!(req, before);
    }
}
