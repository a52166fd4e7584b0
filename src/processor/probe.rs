use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use lofty::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::ffmpeg::{Binary, Tool};
use crate::{
    config::Config,
    error::{Error, Result},
    helpers::http::parse_json,
    request::Container,
};

/// Stream facts of a finished file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AudioProperties {
    pub sample_rate: Option<u32>,
    pub bit_depth: Option<u8>,
    pub bitrate_kbps: Option<u32>,
    pub duration_secs: f64,
}

impl AudioProperties {
    /// `24-bit/96.0kHz`, `320kbps/44.1kHz`, `44.1kHz` or `Unknown`.
    pub fn quality_label(&self) -> String {
        let khz = self.sample_rate.filter(|r| *r > 0).map(|r| f64::from(r) / 1000.0);

        match (self.bit_depth.filter(|b| *b > 0), self.bitrate_kbps.filter(|b| *b > 0), khz) {
            (Some(bits), _, Some(khz)) => format!("{bits}-bit/{khz:.1}kHz"),
            (None, Some(kbps), Some(khz)) => format!("{kbps}kbps/{khz:.1}kHz"),
            (None, None, Some(khz)) => format!("{khz:.1}kHz"),
            _ => "Unknown".to_string(),
        }
    }

    /// `m:ss` of the duration.
    pub fn duration_label(&self) -> String {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let total = self.duration_secs.max(0.0).round() as u64;
        format!("{}:{:02}", total / 60, total % 60)
    }
}

/// Tags as read back from a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TagSummary {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub track_number: Option<u32>,
    pub disc_number: Option<u32>,
    pub year: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeReport {
    #[serde(default)]
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
    #[serde(default)]
    tags: std::collections::HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    sample_rate: Option<String>,
    bits_per_raw_sample: Option<String>,
    bits_per_sample: Option<u8>,
    bit_rate: Option<String>,
}

/// Stream properties, read natively where possible and through ffprobe
/// otherwise.
pub async fn properties(cfg: &Config, path: &Path) -> Result<AudioProperties> {
    match native_properties(path.to_path_buf()).await {
        Ok(props) if props.duration_secs > 0.0 => return Ok(props),
        Ok(_) => trace!("Native probe found no duration"),
        Err(e) => trace!(?e, "Native probe failed"),
    }

    ffprobe_properties(cfg, path).await
}

/// Decoded duration in seconds.
pub async fn duration(cfg: &Config, path: &Path) -> Result<f64> {
    let props = properties(cfg, path).await?;
    if props.duration_secs > 0.0 {
        Ok(props.duration_secs)
    } else {
        Err(Error::Decoder {
            reason: format!("no duration for {}", path.display()),
        })
    }
}

async fn native_properties(path: PathBuf) -> Result<AudioProperties> {
    let read = tokio::task::spawn_blocking(move || -> std::result::Result<AudioProperties, String> {
        let tagged = lofty::read_from_path(&path).map_err(|e| e.to_string())?;
        let props = tagged.properties();

        Ok(AudioProperties {
            sample_rate: props.sample_rate(),
            bit_depth: props.bit_depth(),
            bitrate_kbps: props.audio_bitrate().or_else(|| props.overall_bitrate()),
            duration_secs: props.duration().as_secs_f64(),
        })
    })
    .await
    .map_err(|e| Error::Decoder {
        reason: e.to_string(),
    })?;

    read.map_err(|reason| Error::Decoder { reason })
}

async fn ffprobe_report(cfg: &Config, path: &Path) -> Result<FfprobeReport> {
    let ffprobe = Tool::locate(cfg, Binary::Ffprobe)?;
    let output = ffprobe
        .run_checked([
            OsStr::new("-v"),
            OsStr::new("quiet"),
            OsStr::new("-print_format"),
            OsStr::new("json"),
            OsStr::new("-show_format"),
            OsStr::new("-show_streams"),
            path.as_os_str(),
        ])
        .await
        .map_err(|reason| Error::Decoder { reason })?;

    parse_json("ffprobe", &output.stdout)
}

async fn ffprobe_properties(cfg: &Config, path: &Path) -> Result<AudioProperties> {
    let report = ffprobe_report(cfg, path).await?;

    let audio = report
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"));

    let bitrate = audio
        .and_then(|s| s.bit_rate.as_deref())
        .or(report.format.bit_rate.as_deref())
        .and_then(|b| b.parse::<u32>().ok())
        .map(|b| b / 1000);

    let bit_depth = audio.and_then(|s| {
        s.bits_per_raw_sample
            .as_deref()
            .and_then(|b| b.parse::<u8>().ok())
            .or(s.bits_per_sample)
            .filter(|b| *b > 0)
    });

    let props = AudioProperties {
        sample_rate: audio
            .and_then(|s| s.sample_rate.as_deref())
            .and_then(|r| r.parse().ok()),
        bit_depth,
        bitrate_kbps: bitrate,
        duration_secs: report
            .format
            .duration
            .as_deref()
            .and_then(|d| d.parse().ok())
            .unwrap_or_default(),
    };
    debug!(?props, "Probed with ffprobe");

    Ok(props)
}

/// Codec name of the first audio stream, e.g. `flac` or `eac3`.
pub async fn audio_codec(cfg: &Config, path: &Path) -> Result<String> {
    let ffprobe = Tool::locate(cfg, Binary::Ffprobe)?;
    let output = ffprobe
        .run_checked([
            OsStr::new("-v"),
            OsStr::new("quiet"),
            OsStr::new("-select_streams"),
            OsStr::new("a:0"),
            OsStr::new("-show_entries"),
            OsStr::new("stream=codec_name"),
            OsStr::new("-of"),
            OsStr::new("default=noprint_wrappers=1:nokey=1"),
            path.as_os_str(),
        ])
        .await
        .map_err(|reason| Error::Decoder { reason })?;

    let codec = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if codec.is_empty() {
        return Err(Error::Decoder {
            reason: format!("no audio stream in {}", path.display()),
        });
    }

    Ok(codec)
}

/// Reads back the primary tags of a finished file.
pub async fn read_tags(cfg: &Config, path: &Path) -> Result<TagSummary> {
    match Container::from_path(path) {
        Some(Container::Flac) => {
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || crate::metadata::flac::read_tags(&path))
                .await
                .map_err(|e| Error::Decoder {
                    reason: e.to_string(),
                })?
        }
        Some(Container::Mp3) => crate::metadata::mp3::read_tags(path),
        Some(Container::M4a) => {
            let report = ffprobe_report(cfg, path).await?;
            let tag = |k: &str| report.format.tags.get(k).cloned();
            let number = |k: &str| {
                tag(k).and_then(|v| v.split('/').next().and_then(|n| n.trim().parse().ok()))
            };

            Ok(TagSummary {
                title: tag("title"),
                artist: tag("artist"),
                album: tag("album"),
                album_artist: tag("album_artist"),
                track_number: number("track"),
                disc_number: number("disc"),
                year: tag("date").map(|d| d.chars().take(4).collect()),
            })
        }
        None => Err(Error::validation(format!(
            "unsupported file type: {}",
            path.display()
        ))),
    }
}
