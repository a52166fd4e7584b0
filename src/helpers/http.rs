use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::{
    config::Config,
    error::{Error, Result},
};

const PREVIEW_LEN: usize = 200;

pub fn build_client(cfg: &Config) -> Client {
    Client::builder()
        .user_agent(cfg.user_agent.clone())
        .connect_timeout(Duration::from_secs(15))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Decodes a body without ever failing on bad encoding.
pub fn text_lossy(body: &[u8]) -> String {
    String::from_utf8_lossy(body).into_owned()
}

/// At most 200 bytes of `body`, cut on a character boundary.
pub fn preview(body: &[u8]) -> String {
    let text = text_lossy(body);
    if text.len() <= PREVIEW_LEN {
        return text;
    }

    let mut end = PREVIEW_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

pub fn parse_json<T: DeserializeOwned>(service: &'static str, body: &[u8]) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::UnexpectedResponse {
            service,
            reason: "empty response".to_string(),
            preview: String::new(),
        });
    }

    serde_json::from_slice(body).map_err(|e| Error::UnexpectedResponse {
        service,
        reason: e.to_string(),
        preview: preview(body),
    })
}

/// Sends `req` and fails on any non-success status.
pub async fn send_checked(req: RequestBuilder) -> Result<Response> {
    let resp = req.send().await?;
    let status = resp.status();

    if !status.is_success() {
        return Err(Error::HttpStatus {
            status,
            url: resp.url().to_string(),
        });
    }

    Ok(resp)
}

pub async fn get_json<T: DeserializeOwned>(service: &'static str, req: RequestBuilder) -> Result<T> {
    let resp = send_checked(req).await?;
    let body = resp.bytes().await?;
    trace!(service, len = body.len(), "Got response body");

    parse_json(service, &body)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Thing {
        #[allow(dead_code)]
        id: u32,
    }

    #[test]
    fn preview_is_truncated() {
        let body = "x".repeat(1000);
        let p = preview(body.as_bytes());
        assert_eq!(p.len(), PREVIEW_LEN + 3);
        assert!(p.ends_with("..."));

        assert_eq!(preview(b"short"), "short");
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let body = "é".repeat(150);
        let p = preview(body.as_bytes());
        assert!(p.ends_with("..."));
        assert!(p.len() <= PREVIEW_LEN + 3);
    }

    #[test]
    fn bad_json_carries_preview() {
        let body = format!("<html>{}</html>", "a".repeat(500));
        let err = parse_json::<Thing>("test", body.as_bytes()).expect_err("html is not json");

        match err {
            Error::UnexpectedResponse {
                service, preview, ..
            } => {
                assert_eq!(service, "test");
                assert!(preview.starts_with("<html>"));
                assert!(preview.len() <= PREVIEW_LEN + 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn empty_body_is_rejected() {
        assert!(matches!(
            parse_json::<Thing>("test", b"  "),
            Err(Error::UnexpectedResponse { .. })
        ));
    }

    #[test]
    fn invalid_utf8_is_tolerated() {
        assert_eq!(text_lossy(b"ok\xff"), "ok\u{fffd}");
    }
}
