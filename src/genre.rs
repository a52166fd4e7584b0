use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};
use tryhard::RetryPolicy;

use crate::{
    config::Config,
    error::{Error, Result},
    helpers::http::get_json,
};

const GENRE_TIMEOUT: Duration = Duration::from_secs(10);
const GENRE_ATTEMPTS: u32 = 3;
const GENRE_RETRY_DELAY: Duration = Duration::from_secs(2);
const MAX_GENRES: usize = 5;
const USER_AGENT: &str = concat!("tunefetch/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct RecordingSearch {
    #[serde(default)]
    recordings: Vec<Recording>,
}

#[derive(Debug, Deserialize)]
struct Recording {
    #[serde(default)]
    tags: Vec<RecordingTag>,
}

#[derive(Debug, Clone, Deserialize)]
struct RecordingTag {
    #[serde(default)]
    count: i64,
    name: String,
}

/// Genre of the recording with `isrc`, from MusicBrainz community tags.
///
/// With `single` only the most-voted tag is returned; otherwise up to five
/// tags in MusicBrainz order, joined with `"; "`.
#[tracing::instrument(skip(client, cfg))]
pub async fn fetch_genre(client: &Client, cfg: &Config, isrc: &str, single: bool) -> Result<String> {
    if isrc.is_empty() {
        return Err(Error::validation("ISRC is required for a genre lookup"));
    }

    let url = format!("{}/recording", cfg.musicbrainz_base);
    let query = format!("isrc:{isrc}");

    let search: RecordingSearch = tryhard::retry_fn(|| {
        let req = client
            .get(&url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .query(&[
                ("query", query.as_str()),
                ("fmt", "json"),
                ("inc", "releases+artist-credits+tags+media+release-groups+labels"),
            ])
            .timeout(GENRE_TIMEOUT);
        get_json("musicbrainz", req)
    })
    .retries(GENRE_ATTEMPTS - 1)
    .custom_backoff(|attempt, err: &Error| {
        if err.is_transient() {
            debug!(attempt, ?err, "Retrying genre lookup");
            RetryPolicy::Delay(GENRE_RETRY_DELAY)
        } else {
            RetryPolicy::Break
        }
    })
    .await?;

    let recording = search
        .recordings
        .into_iter()
        .next()
        .ok_or_else(|| Error::not_found(format!("MusicBrainz recording for ISRC {isrc}")))?;

    let genre = pick_genre(&recording.tags, single);
    if genre.is_empty() {
        return Err(Error::not_found(format!("genre tags for ISRC {isrc}")));
    }

    info!(%genre, "Found genre");
    Ok(genre)
}

fn pick_genre(tags: &[RecordingTag], single: bool) -> String {
    if single {
        let mut best: Option<&RecordingTag> = None;
        for tag in tags {
            if best.map_or(true, |b| tag.count > b.count) {
                best = Some(tag);
            }
        }
        return best.map(|t| title_case(&t.name)).unwrap_or_default();
    }

    tags.iter()
        .take(MAX_GENRES)
        .map(|t| title_case(&t.name))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Upper-cases the first letter of every word, lower-cases the rest.
pub fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;

    for c in s.chars() {
        if c.is_alphanumeric() || c == '\'' {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use axum::{
        extract::Query,
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::get,
        Json, Router,
    };
    use serde_json::json;

    use super::*;
    use crate::{helpers::http::build_client, test_support::MockServer};

    fn tags() -> Vec<RecordingTag> {
        [("rock", 2), ("indie rock", 7), ("post-punk", 3), ("a", 1), ("b", 1), ("c", 1)]
            .into_iter()
            .map(|(name, count)| RecordingTag {
                count,
                name: name.to_string(),
            })
            .collect()
    }

    #[test]
    fn single_genre_is_the_most_voted() {
        assert_eq!(pick_genre(&tags(), true), "Indie Rock");
    }

    #[test]
    fn multiple_genres_are_capped() {
        assert_eq!(pick_genre(&tags(), false), "Rock; Indie Rock; Post-Punk; A; B");
        assert_eq!(pick_genre(&[], false), "");
    }

    #[test]
    fn title_casing() {
        assert_eq!(title_case("hip-hop"), "Hip-Hop");
        assert_eq!(title_case("DRUM AND BASS"), "Drum And Bass");
        assert_eq!(title_case("rock'n'roll"), "Rock'n'roll");
    }

    #[tokio::test]
    async fn looks_up_by_isrc_with_user_agent() {
        let router = Router::new().route(
            "/musicbrainz/recording",
            get(|Query(q): Query<HashMap<String, String>>, headers: HeaderMap| async move {
                assert_eq!(q.get("query").map(String::as_str), Some("isrc:USRC17607839"));
                let agent = headers
                    .get("user-agent")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default();
                assert!(agent.starts_with("tunefetch/"));

                Json(json!({
                    "recordings": [{ "tags": [{ "count": 1, "name": "electronic" }] }]
                }))
            }),
        );
        let server = MockServer::start(router).await;
        let cfg = server.config(&std::env::temp_dir());

        let genre = fetch_genre(&build_client(&cfg), &cfg, "USRC17607839", false)
            .await
            .expect("genre");
        assert_eq!(genre, "Electronic");
    }

    #[tokio::test]
    async fn retries_after_a_server_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/musicbrainz/recording",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        StatusCode::SERVICE_UNAVAILABLE.into_response()
                    } else {
                        Json(json!({ "recordings": [{ "tags": [{ "count": 4, "name": "jazz" }] }] }))
                            .into_response()
                    }
                }
            }),
        );
        let server = MockServer::start(router).await;
        let cfg = server.config(&std::env::temp_dir());

        let genre = fetch_genre(&build_client(&cfg), &cfg, "X", true).await.expect("genre");
        assert_eq!(genre, "Jazz");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let router = Router::new().route(
            "/musicbrainz/recording",
            get(|| async { StatusCode::BAD_REQUEST }),
        );
        let server = MockServer::start(router).await;
        let cfg = server.config(&std::env::temp_dir());

        let err = fetch_genre(&build_client(&cfg), &cfg, "X", false).await.expect_err("bad request");
        assert!(matches!(err, Error::HttpStatus { status, .. } if status.as_u16() == 400));
        assert_eq!(server.hits(), 1);
    }

    #[tokio::test]
    async fn no_recordings_is_not_found() {
        let router = Router::new().route(
            "/musicbrainz/recording",
            get(|| async { Json(json!({ "recordings": [] })) }),
        );
        let server = MockServer::start(router).await;
        let cfg = server.config(&std::env::temp_dir());

        let err = fetch_genre(&build_client(&cfg), &cfg, "X", false).await.expect_err("none");
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(server.hits(), 1);
    }
}
