use std::{path::Path, time::Duration};

use reqwest::{Client, Response};
use tokio::{
    fs::{self, File},
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
};
use tracing::{debug, trace};

use super::http::send_checked;
use crate::error::Result;

/// Streams `download_url` into `download_path`, returning the number of bytes
/// written. The file is created (or truncated) before the first chunk lands.
#[tracing::instrument(skip(client))]
pub async fn download_file(
    client: &Client,
    download_path: &Path,
    download_url: &str,
    timeout: Duration,
) -> Result<u64> {
    let resp = get_file_response(client, download_url, timeout).await?;

    write_resp_to_file(resp, download_path).await
}

pub async fn get_file_response(client: &Client, download_url: &str, timeout: Duration) -> Result<Response> {
    debug!("Starting download");
    send_checked(client.get(download_url).timeout(timeout)).await
}

pub async fn write_resp_to_file(resp: Response, file_path: &Path) -> Result<u64> {
    trace!(path = ?file_path, "Writing request response to disk");

    if let Some(parent) = file_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }

    let file = File::create(file_path).await?;
    let mut out_file = BufWriter::new(file);
    let written = write_resp(resp, &mut out_file).await?;
    out_file.flush().await?;

    debug!(bytes = written, "Response written to disk");

    Ok(written)
}

/// Appends the whole body of `resp` to `out`.
pub async fn write_resp<W>(mut resp: Response, out: &mut W) -> Result<u64>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut written = 0u64;
    while let Some(chunk) = resp.chunk().await? {
        out.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    Ok(written)
}
