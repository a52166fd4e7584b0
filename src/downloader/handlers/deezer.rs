use std::{path::PathBuf, time::Duration};

use serde::Serialize;
use tracing::{debug, info};

use super::{finalize, Handler, Job, Services};
use crate::{
    error::{Error, Result},
    helpers::{
        download::write_resp_to_file,
        http::send_checked,
        id::time_id,
        temp_path::TempPath,
    },
    request::{Container, Service},
};

const RELAY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RelayRequest<'a> {
    url: &'a str,
    format: &'static str,
    genre_source: &'static str,
}

#[derive(Debug)]
pub struct DeezerProvider;

#[async_trait::async_trait]
impl Handler for DeezerProvider {
    #[tracing::instrument(skip_all, fields(spotify_id = %job.request.spotify_id))]
    async fn download(&self, ctx: &Services, job: &Job) -> Result<PathBuf> {
        let spotify_url = job
            .request
            .spotify_url()
            .ok_or_else(|| Error::validation("a Spotify id is required for Deezer downloads"))?;

        debug!("Requesting track from Deezer relay");
        let resp = send_checked(
            ctx.client
                .post(&ctx.cfg.deezer_relay_url)
                .json(&RelayRequest {
                    url: &spotify_url,
                    format: "flac",
                    genre_source: "spotify",
                })
                .timeout(RELAY_TIMEOUT),
        )
        .await?;

        let out_dir = job.output_dir();
        tokio::fs::create_dir_all(out_dir).await?;

        let fetched = TempPath::new(out_dir.join(format!("deezer_{}.flac", time_id())));
        let bytes = write_resp_to_file(resp, fetched.path()).await?;
        if bytes == 0 {
            return Err(Error::transient("deezer", "relay returned an empty file"));
        }
        info!(bytes, "Deezer file downloaded");

        finalize(ctx, job, fetched.path(), job.expected_path(Container::Flac)).await
    }

    fn supports(&self, service: Service) -> bool {
        service == Service::Deezer
    }
}
