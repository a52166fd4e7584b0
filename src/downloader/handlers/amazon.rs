use std::{path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{finalize, Handler, Job, Services};
use crate::{
    error::{Error, Result},
    helpers::{download::download_file, http::get_json, temp_path::TempPath},
    linking::{amazon_asin, normalize_amazon_url},
    processor::{ffmpeg::decrypt, probe::audio_codec},
    request::{Container, Service},
};

const API_TIMEOUT: Duration = Duration::from_secs(30);
const FILE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamInfo {
    #[serde(default)]
    stream_url: String,
    #[serde(default)]
    decryption_key: String,
}

#[derive(Debug)]
pub struct AmazonProvider;

#[async_trait::async_trait]
impl Handler for AmazonProvider {
    #[tracing::instrument(skip_all, fields(spotify_id = %job.request.spotify_id))]
    async fn download(&self, ctx: &Services, job: &Job) -> Result<PathBuf> {
        let req = &job.request;

        let amazon_url = if req.service_url.is_empty() {
            ctx.resolver.amazon_url(&req.spotify_id, &req.region).await?
        } else {
            req.service_url.clone()
        };
        let amazon_url = normalize_amazon_url(&amazon_url);
        let asin = amazon_asin(&amazon_url)
            .ok_or_else(|| Error::validation(format!("no ASIN in {amazon_url}")))?
            .to_string();
        debug!(%asin, "Resolved Amazon track");

        let info: StreamInfo = get_json(
            "amazon",
            ctx.client
                .get(format!("{}/track/{asin}", ctx.cfg.amazon_api_base))
                .timeout(API_TIMEOUT),
        )
        .await?;
        if info.stream_url.is_empty() {
            return Err(Error::UnexpectedResponse {
                service: "amazon",
                reason: "no stream URL in response".to_string(),
                preview: String::new(),
            });
        }

        let out_dir = job.output_dir();
        tokio::fs::create_dir_all(out_dir).await?;

        let encrypted = TempPath::new(out_dir.join(format!("{asin}.m4a")));
        let bytes = download_file(&ctx.client, encrypted.path(), &info.stream_url, FILE_TIMEOUT).await?;
        info!(bytes, "Amazon stream downloaded");

        let (fetched, container) = if info.decryption_key.is_empty() {
            (encrypted, Container::M4a)
        } else {
            Self::decrypt(ctx, encrypted, &asin, &info.decryption_key).await?
        };

        let target = job.expected_path(container);
        let out = finalize(ctx, job, fetched.path(), target).await?;

        if container == Container::Flac {
            let stray = out_dir.join(format!("{asin}.m4a"));
            if stray.exists() {
                if let Err(e) = tokio::fs::remove_file(&stray).await {
                    warn!(?stray, ?e, "Failed to remove leftover M4A");
                }
            }
        }

        Ok(out)
    }

    fn supports(&self, service: Service) -> bool {
        service == Service::Amazon
    }

    fn outputs(&self) -> &'static [Container] {
        &[Container::Flac, Container::M4a]
    }
}

impl AmazonProvider {
    /// Decrypts the stream next to itself. FLAC streams land in `.flac`,
    /// everything else stays `.m4a`.
    async fn decrypt(
        ctx: &Services,
        encrypted: TempPath,
        asin: &str,
        key: &str,
    ) -> Result<(TempPath, Container)> {
        let container = match audio_codec(&ctx.cfg, encrypted.path()).await {
            Ok(codec) if codec.eq_ignore_ascii_case("flac") => Container::Flac,
            Ok(codec) => {
                debug!(%codec, "Keeping M4A container");
                Container::M4a
            }
            Err(e) => {
                warn!(?e, "Could not probe codec, keeping M4A container");
                Container::M4a
            }
        };

        let decrypted = TempPath::new(
            encrypted
                .path()
                .with_file_name(format!("dec_{asin}.{}", container.extension())),
        );
        decrypt(&ctx.cfg, encrypted.path(), decrypted.path(), key).await?;

        let size = tokio::fs::metadata(decrypted.path())
            .await
            .map(|m| m.len())
            .unwrap_or_default();
        if size == 0 {
            return Err(Error::Decrypt {
                reason: "decrypted file is missing or empty".to_string(),
            });
        }

        drop(encrypted);
        debug!(?container, size, "Decrypted Amazon stream");
        Ok((decrypted, container))
    }
}
