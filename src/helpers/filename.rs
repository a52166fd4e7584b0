use std::path::{Component, Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::request::{Container, TrackRequest};

pub const UNKNOWN: &str = "Unknown";

static ILLEGAL_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[<>:"\\|?*/]"#).expect("Invalid regex"));
static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("Invalid regex"));
static UNDERSCORE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"_+").expect("Invalid regex"));
static TRACK_DOT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{track\}\.\s*").expect("Invalid regex"));
static TRACK_DASH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{track\}\s*-\s*").expect("Invalid regex"));
static TRACK_BARE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{track\}\s*").expect("Invalid regex"));

const ARTIST_DELIMITERS: &[&str] = &[", ", " & ", " feat. ", " ft. ", " featuring "];

/// The subset of a request that decides the output file name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilenameFields<'a> {
    pub title: &'a str,
    pub artist: &'a str,
    pub album: &'a str,
    pub album_artist: &'a str,
    pub release_date: &'a str,
    pub playlist: &'a str,
    pub creator: &'a str,
    /// Number used for `{track}` and the preset prefix. Zero means none.
    pub number: u32,
    pub disc_number: u32,
    pub include_track_number: bool,
}

impl<'a> FilenameFields<'a> {
    /// The only place request flags are folded into filename inputs. Both the
    /// existence check and every handler's save path go through here.
    pub fn from_request(req: &'a TrackRequest) -> Self {
        let (artist, album_artist) = if req.use_first_artist_only {
            (first_artist(&req.artist_name), first_artist(&req.album_artist))
        } else {
            (req.artist_name.as_str(), req.album_artist.as_str())
        };

        let number = if req.use_album_track_number && req.track_number > 0 {
            req.track_number
        } else {
            req.position
        };

        Self {
            title: &req.track_name,
            artist,
            album: &req.album_name,
            album_artist,
            release_date: &req.release_date,
            playlist: &req.playlist_name,
            creator: &req.playlist_owner,
            number,
            disc_number: req.disc_number,
            include_track_number: req.include_track_number,
        }
    }
}

/// Builds `<stem>.<ext>` for a track.
///
/// A template containing `{` is treated as a token template, anything else as
/// one of the presets `title-artist` (default), `artist-title` or `title`.
pub fn build_filename(fields: &FilenameFields<'_>, template: &str, container: Container) -> String {
    let stem = if template.contains('{') {
        token_stem(fields, template)
    } else {
        preset_stem(fields, template)
    };

    format!("{}.{}", stem, container.extension())
}

/// Full path the finished file for `req` must end up at.
pub fn expected_path(req: &TrackRequest, container: Container) -> PathBuf {
    let fields = FilenameFields::from_request(req);
    Path::new(&req.output_dir).join(build_filename(&fields, &req.filename_format, container))
}

fn token_stem(fields: &FilenameFields<'_>, template: &str) -> String {
    let year = fields.release_date.get(..4).unwrap_or_default();
    let disc = if fields.disc_number > 0 {
        fields.disc_number.to_string()
    } else {
        String::new()
    };

    let mut out = template
        .replace("{title}", &sanitize(fields.title))
        .replace("{artist}", &sanitize(fields.artist))
        .replace("{album}", &sanitize(fields.album))
        .replace("{album_artist}", &sanitize(fields.album_artist))
        .replace("{year}", year)
        .replace("{date}", &sanitize(fields.release_date))
        .replace("{playlist}", &sanitize(fields.playlist))
        .replace("{creator}", &sanitize(fields.creator))
        .replace("{disc}", &disc);

    if fields.number > 0 {
        out = out.replace("{track}", &format!("{:02}", fields.number));
    } else {
        out = TRACK_DOT.replace_all(&out, "").into_owned();
        out = TRACK_DASH.replace_all(&out, "").into_owned();
        out = TRACK_BARE.replace_all(&out, "").into_owned();
    }

    tidy_stem(&out)
}

fn preset_stem(fields: &FilenameFields<'_>, preset: &str) -> String {
    let title = sanitize(fields.title);
    let artist = sanitize(fields.artist);

    let stem = match preset {
        "artist-title" => format!("{artist} - {title}"),
        "title" => title,
        _ => format!("{title} - {artist}"),
    };

    if fields.include_track_number && fields.number > 0 {
        format!("{:02}. {}", fields.number, stem)
    } else {
        stem
    }
}

// Literal template text is user input too: it goes through the same
// sanitizer as the substituted values.
fn tidy_stem(stem: &str) -> String {
    let cleaned = sanitize(stem);
    let trimmed = cleaned.trim_matches(|c: char| c == ' ' || c == '.' || c == '-' || c == '_');

    if trimmed.is_empty() {
        UNKNOWN.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Makes one path component safe for every common filesystem. Never empty.
pub fn sanitize(name: &str) -> String {
    let replaced = ILLEGAL_CHARS.replace_all(name, " ");

    let cleaned = replaced
        .chars()
        .filter(|&c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .collect::<String>();

    let trimmed = cleaned.trim().trim_matches(|c: char| c == '.' || c == ' ');
    let collapsed = WHITESPACE_RUN.replace_all(trimmed, " ");
    let collapsed = UNDERSCORE_RUN.replace_all(&collapsed, "_");
    let result = collapsed.trim_matches(|c: char| c == '_' || c == ' ' || c == '.');

    if result.is_empty() {
        UNKNOWN.to_string()
    } else {
        result.to_string()
    }
}

pub fn first_artist(artists: &str) -> &str {
    let lower = artists.to_lowercase();

    // Lowercasing can change byte lengths outside ASCII, so only trust an
    // index that still lands on a boundary of the original string.
    ARTIST_DELIMITERS
        .iter()
        .filter_map(|d| lower.find(d))
        .min()
        .filter(|&idx| artists.is_char_boundary(idx))
        .map_or(artists, |idx| artists[..idx].trim())
}

/// Sanitizes every component of a user supplied directory, keeping the root
/// and any drive prefix intact.
pub fn sanitize_folder_path(folder: &str) -> PathBuf {
    let normalized = folder.trim().replace('\\', "/");
    if normalized.is_empty() {
        return PathBuf::from(".");
    }

    let mut out = PathBuf::new();

    for (i, part) in normalized.split('/').enumerate() {
        if i == 0 {
            if part.is_empty() {
                out.push(Component::RootDir.as_os_str());
                continue;
            }
            if part.len() == 2 && part.as_bytes()[1] == b':' {
                out.push(format!("{part}/"));
                continue;
            }
        }

        match part {
            "" => {}
            "." | ".." => out.push(part),
            _ => out.push(sanitize_folder_name(part)),
        }
    }

    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

/// Hidden directories keep their leading dot.
fn sanitize_folder_name(part: &str) -> String {
    match part.strip_prefix('.') {
        Some(rest) if !rest.starts_with('.') && !rest.trim().is_empty() => format!(".{}", sanitize(rest)),
        _ => sanitize(part),
    }
}
