use std::path::PathBuf;

use reqwest::StatusCode;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("link service rate limit exceeded after {attempts} attempts")]
    RateLimitExceeded { attempts: u32 },

    /// Upstream answered 429. Only ever seen inside the resolver's retry loop.
    #[error("rate limited by {service}")]
    RateLimited { service: &'static str },

    #[error("ISRC not found: {reason}")]
    IsrcNotFound { reason: String },

    #[error("{provider} request failed: {reason}")]
    TransientProvider {
        provider: &'static str,
        reason: String,
    },

    #[error("all {attempts} {provider} sources failed, last error: {last}")]
    ProvidersExhausted {
        provider: &'static str,
        attempts: usize,
        last: String,
    },

    #[error("request to {url} failed with HTTP {status}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("unexpected response from {service}: {reason} (response: {preview})")]
    UnexpectedResponse {
        service: &'static str,
        reason: String,
        preview: String,
    },

    #[error("transcode failed: {reason}{}", preserved_suffix(.preserved.as_ref()))]
    Transcode {
        reason: String,
        preserved: Option<PathBuf>,
    },

    #[error("decryption failed: {reason}")]
    Decrypt { reason: String },

    #[error("external decoder unavailable: {reason}")]
    Decoder { reason: String },

    #[error("failed to write tags to {path}: {reason}")]
    Embed { path: PathBuf, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

fn preserved_suffix(path: Option<&PathBuf>) -> String {
    path.map_or_else(String::new, |p| {
        format!(" (raw stream kept as {})", p.display())
    })
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn transient(provider: &'static str, reason: impl ToString) -> Self {
        Self::TransientProvider {
            provider,
            reason: reason.to_string(),
        }
    }

    pub fn embed(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Embed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// True for failures where asking again later may succeed. Client errors
    /// other than 408 and 429 are final.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::TransientProvider { .. }
            | Self::UnexpectedResponse { .. }
            | Self::Network { .. }
            | Self::RateLimited { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcode_message_mentions_preserved_file() {
        let err = Error::Transcode {
            reason: "exit status 1".to_string(),
            preserved: Some(PathBuf::from("/music/Song - Artist.m4a")),
        };

        let msg = err.to_string();
        assert!(msg.contains("exit status 1"));
        assert!(msg.contains("Song - Artist.m4a"));

        let err = Error::Transcode {
            reason: "exit status 1".to_string(),
            preserved: None,
        };
        assert_eq!(err.to_string(), "transcode failed: exit status 1");
    }

    #[test]
    fn transient_classification() {
        assert!(Error::transient("tidal", "timeout").is_transient());
        assert!(!Error::validation("missing id").is_transient());
        assert!(!Error::Decrypt {
            reason: "bad key".to_string()
        }
        .is_transient());

        let status = |status| Error::HttpStatus {
            status,
            url: "http://x".to_string(),
        };
        assert!(status(StatusCode::BAD_GATEWAY).is_transient());
        assert!(status(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(!status(StatusCode::BAD_REQUEST).is_transient());
        assert!(!status(StatusCode::NOT_FOUND).is_transient());
    }
}
