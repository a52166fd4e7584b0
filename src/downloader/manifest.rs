use base64::{engine::general_purpose::STANDARD, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::error::{Error, Result};

static INIT_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"initialization="([^"]+)""#).expect("Invalid regex"));
static MEDIA_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"media="([^"]+)""#).expect("Invalid regex"));
static SEGMENT_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<S\s+[^>]*>").expect("Invalid regex"));
static REPEAT_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"r="(\d+)""#).expect("Invalid regex"));

/// Where the bytes of a track come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDescriptor {
    /// One file. `mime_type` is set when the provider said what it is.
    Direct {
        url: String,
        mime_type: Option<String>,
    },
    /// An initialization segment followed by media segments, in order.
    Segmented {
        init_url: String,
        media_urls: Vec<String>,
    },
}

impl StreamDescriptor {
    /// True when the bytes are FLAC already and can be written in place.
    pub fn is_flac(&self) -> bool {
        match self {
            Self::Direct { mime_type, .. } => mime_type
                .as_deref()
                .map_or(true, |m| m.is_empty() || m.to_ascii_lowercase().contains("flac")),
            Self::Segmented { .. } => false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonManifest {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    codecs: String,
    #[serde(default)]
    urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Mpd {
    #[serde(rename = "Period", default)]
    periods: Vec<Period>,
}

#[derive(Debug, Deserialize)]
struct Period {
    #[serde(rename = "AdaptationSet", default)]
    adaptation_sets: Vec<AdaptationSet>,
}

#[derive(Debug, Deserialize)]
struct AdaptationSet {
    #[serde(rename = "@codecs", default)]
    codecs: String,
    #[serde(rename = "SegmentTemplate")]
    segment_template: Option<SegmentTemplate>,
    #[serde(rename = "Representation", default)]
    representations: Vec<Representation>,
}

#[derive(Debug, Deserialize)]
struct Representation {
    #[serde(rename = "@codecs", default)]
    codecs: String,
    #[serde(rename = "@bandwidth", default)]
    bandwidth: u64,
    #[serde(rename = "SegmentTemplate")]
    segment_template: Option<SegmentTemplate>,
}

#[derive(Debug, Clone, Deserialize)]
struct SegmentTemplate {
    #[serde(rename = "@initialization", default)]
    initialization: String,
    #[serde(rename = "@media", default)]
    media: String,
    #[serde(rename = "SegmentTimeline")]
    timeline: Option<SegmentTimeline>,
}

#[derive(Debug, Clone, Deserialize)]
struct SegmentTimeline {
    #[serde(rename = "S", default)]
    segments: Vec<TimelineEntry>,
}

#[derive(Debug, Clone, Deserialize)]
struct TimelineEntry {
    #[serde(rename = "@r", default)]
    repeat: i64,
}

impl SegmentTemplate {
    fn segment_count(&self) -> usize {
        self.timeline.as_ref().map_or(0, |t| {
            t.segments
                .iter()
                .map(|s| usize::try_from(s.repeat.max(0)).unwrap_or(0) + 1)
                .sum()
        })
    }
}

/// Decodes a base64 manifest into a stream descriptor.
///
/// JSON manifests name a direct URL. DASH manifests are parsed structurally,
/// picking the highest-bandwidth representation, and scraped with regexes if
/// that yields no segments.
pub fn parse_manifest(manifest_b64: &str) -> Result<StreamDescriptor> {
    let bytes = STANDARD
        .decode(manifest_b64.trim())
        .map_err(|e| manifest_error(format!("invalid base64: {e}")))?;
    let text = String::from_utf8_lossy(&bytes);

    if text.trim_start().starts_with('{') {
        let manifest: JsonManifest = serde_json::from_str(&text)
            .map_err(|e| manifest_error(format!("invalid JSON manifest: {e}")))?;
        debug!(mime = %manifest.mime_type, codecs = %manifest.codecs, "JSON manifest");

        let url = manifest
            .urls
            .into_iter()
            .next()
            .ok_or_else(|| manifest_error("no URLs in manifest".to_string()))?;

        return Ok(StreamDescriptor::Direct {
            url,
            mime_type: Some(manifest.mime_type).filter(|m| !m.is_empty()),
        });
    }

    if let Some(descriptor) = parse_dash_structured(&text) {
        return Ok(descriptor);
    }

    debug!("Structured DASH parse found no segments, scraping manifest");
    parse_dash_regex(&text)
}

fn manifest_error(reason: String) -> Error {
    Error::UnexpectedResponse {
        service: "tidal",
        reason,
        preview: String::new(),
    }
}

fn parse_dash_structured(text: &str) -> Option<StreamDescriptor> {
    let mpd: Mpd = match quick_xml::de::from_str(text) {
        Ok(mpd) => mpd,
        Err(e) => {
            trace!(?e, "DASH manifest is not valid XML");
            return None;
        }
    };

    let mut selected: Option<SegmentTemplate> = None;
    let mut best_bandwidth = 0;

    for set in mpd.periods.iter().flat_map(|p| &p.adaptation_sets) {
        if selected.is_none() {
            selected.clone_from(&set.segment_template);
        }

        for rep in &set.representations {
            if let Some(template) = &rep.segment_template {
                if rep.bandwidth > best_bandwidth {
                    best_bandwidth = rep.bandwidth;
                    selected = Some(template.clone());
                    let codecs = if rep.codecs.is_empty() { &set.codecs } else { &rep.codecs };
                    trace!(bandwidth = rep.bandwidth, %codecs, "Picked representation");
                }
            }
        }
    }

    let template = selected?;
    let count = template.segment_count();
    if count == 0 || template.initialization.is_empty() || template.media.is_empty() {
        return None;
    }

    debug!(segments = count, bandwidth = best_bandwidth, "Parsed DASH manifest");
    Some(StreamDescriptor::Segmented {
        init_url: template.initialization.clone(),
        media_urls: numbered_urls(&template.media, count),
    })
}

fn parse_dash_regex(text: &str) -> Result<StreamDescriptor> {
    let attr = |re: &Regex| {
        re.captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().replace("&amp;", "&"))
    };

    let init_url = attr(&INIT_ATTR).ok_or_else(|| manifest_error("no initialization URL".to_string()))?;
    let media = attr(&MEDIA_ATTR).unwrap_or_default();

    let count: usize = SEGMENT_TAG
        .find_iter(text)
        .map(|tag| {
            REPEAT_ATTR
                .captures(tag.as_str())
                .and_then(|c| c.get(1))
                .and_then(|r| r.as_str().parse::<usize>().ok())
                .unwrap_or(0)
                + 1
        })
        .sum();

    if count == 0 || media.is_empty() {
        return Err(manifest_error("no segments in DASH manifest".to_string()));
    }

    debug!(segments = count, "Scraped DASH manifest");
    Ok(StreamDescriptor::Segmented {
        init_url,
        media_urls: numbered_urls(&media, count),
    })
}

/// `$Number$` replaced by 1..=count.
fn numbered_urls(template: &str, count: usize) -> Vec<String> {
    (1..=count)
        .map(|n| template.replace("$Number$", &n.to_string()))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn encode(s: &str) -> String {
        STANDARD.encode(s)
    }

    pub fn dash(base: &str, repeats: &[u32]) -> String {
        let entries = repeats
            .iter()
            .map(|r| format!(r#"<S d="176128" r="{r}"/>"#))
            .collect::<String>();

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static">
  <Period id="0">
    <AdaptationSet id="0" contentType="audio" mimeType="audio/mp4">
      <Representation id="low" codecs="mp4a.40.2" bandwidth="96000">
        <SegmentTemplate timescale="44100" initialization="{base}/low/init.mp4" media="{base}/low/$Number$.mp4" startNumber="1">
          <SegmentTimeline><S d="176128"/></SegmentTimeline>
        </SegmentTemplate>
      </Representation>
      <Representation id="high" codecs="flac" bandwidth="1411000">
        <SegmentTemplate timescale="44100" initialization="{base}/seg/init.mp4?a=1&amp;b=2" media="{base}/seg/$Number$.mp4" startNumber="1">
          <SegmentTimeline>{entries}</SegmentTimeline>
        </SegmentTemplate>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#
        )
    }

    #[test]
    fn json_manifest_is_direct() {
        let m = encode(r#"{"mimeType":"audio/flac","codecs":"flac","urls":["https://cdn/x.flac"]}"#);
        let d = parse_manifest(&m).expect("manifest");

        assert!(d.is_flac());
        assert_eq!(
            d,
            StreamDescriptor::Direct {
                url: "https://cdn/x.flac".to_string(),
                mime_type: Some("audio/flac".to_string()),
            }
        );
    }

    #[test]
    fn aac_json_manifest_needs_transcoding() {
        let m = encode(r#"{"mimeType":"audio/mp4","urls":["https://cdn/x.m4a"]}"#);
        assert!(!parse_manifest(&m).expect("manifest").is_flac());
    }

    #[test]
    fn json_manifest_without_urls_fails() {
        let m = encode(r#"{"mimeType":"audio/flac","urls":[]}"#);
        assert!(parse_manifest(&m).is_err());
    }

    #[test]
    fn dash_picks_highest_bandwidth() {
        let m = encode(&dash("https://cdn", &[2, 0]));
        let StreamDescriptor::Segmented {
            init_url,
            media_urls,
        } = parse_manifest(&m).expect("manifest")
        else {
            panic!("expected segments");
        };

        assert_eq!(init_url, "https://cdn/seg/init.mp4?a=1&b=2");
        assert_eq!(
            media_urls,
            vec![
                "https://cdn/seg/1.mp4",
                "https://cdn/seg/2.mp4",
                "https://cdn/seg/3.mp4",
                "https://cdn/seg/4.mp4",
            ]
        );
    }

    #[test]
    fn malformed_dash_falls_back_to_regex() {
        // Unclosed tags break the XML parser but not the scrape.
        let broken = r#"<MPD><Period><AdaptationSet>
            <SegmentTemplate initialization="https://cdn/i.mp4?x=1&amp;y=2" media="https://cdn/$Number$.mp4">
            <SegmentTimeline><S d="1" r="1"/><S d="1"/>"#;
        let d = parse_manifest(&encode(broken)).expect("manifest");

        assert_eq!(
            d,
            StreamDescriptor::Segmented {
                init_url: "https://cdn/i.mp4?x=1&y=2".to_string(),
                media_urls: vec![
                    "https://cdn/1.mp4".to_string(),
                    "https://cdn/2.mp4".to_string(),
                    "https://cdn/3.mp4".to_string(),
                ],
            }
        );
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_manifest("%%%").is_err());
        assert!(parse_manifest(&encode("<MPD></MPD>")).is_err());
    }
}
