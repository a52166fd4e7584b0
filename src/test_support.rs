use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use axum::{extract::Request, middleware::Next, Router};
use tokio::{net::TcpListener, task::JoinHandle};

use crate::config::{self, Config};

/// An axum router served on an ephemeral local port.
pub struct MockServer {
    pub base: String,
    hits: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(router: Router) -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        let router = router.layer(axum::middleware::from_fn(
            move |req: Request, next: Next| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    next.run(req).await
                }
            },
        ));

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server address");

        let task = tokio::spawn(async move {
            axum::serve(listener, router).await.expect("mock server failed");
        });

        Self {
            base: format!("http://{addr}"),
            hits,
            task,
        }
    }

    /// Number of requests served so far.
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn config(&self, ffmpeg_dir: &Path) -> Config {
        config::for_mock(&self.base, ffmpeg_dir.to_path_buf())
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A FLAC stream with only a STREAMINFO block (44.1 kHz, stereo, 16 bit,
/// ten seconds) followed by `payload_len` bytes standing in for frames.
pub fn synthetic_flac(payload_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload_len + 42);
    out.extend_from_slice(b"fLaC");

    // last-metadata-block flag | STREAMINFO, length 34
    out.extend_from_slice(&[0x80, 0x00, 0x00, 0x22]);

    out.extend_from_slice(&4096u16.to_be_bytes());
    out.extend_from_slice(&4096u16.to_be_bytes());
    out.extend_from_slice(&[0x00, 0x00, 0x0e]);
    out.extend_from_slice(&[0x00, 0x40, 0x00]);

    let sample_rate: u64 = 44_100;
    let channels_minus_one: u64 = 1;
    let bits_minus_one: u64 = 15;
    let total_samples: u64 = 441_000;
    let packed =
        (sample_rate << 44) | (channels_minus_one << 41) | (bits_minus_one << 36) | total_samples;
    out.extend_from_slice(&packed.to_be_bytes());

    out.extend_from_slice(&[0u8; 16]);

    out.resize(out.len() + payload_len, 0);
    out
}

/// Smallest JPEG-looking payload: SOI marker and padding.
pub fn fake_jpeg() -> Vec<u8> {
    let mut data = vec![0xff, 0xd8, 0xff, 0xe0];
    data.extend_from_slice(&[0u8; 64]);
    data.extend_from_slice(&[0xff, 0xd9]);
    data
}
