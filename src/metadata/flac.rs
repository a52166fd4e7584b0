use std::{
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom},
    path::Path,
};

use lofty::{
    config::{ParseOptions, WriteOptions},
    flac::FlacFile,
    ogg::{tag::VorbisComments, OggPictureStorage},
    picture::{Picture, PictureType},
    prelude::*,
};
use tracing::{trace, warn};

use super::Metadata;
use crate::{
    error::{Error, Result},
    processor::probe::TagSummary,
};

const LYRIC_KEYS: &[&str] = &["LYRICS", "UNSYNCEDLYRICS", "SYNCEDLYRICS"];

fn open(path: &Path) -> Result<(File, FlacFile)> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let flac = FlacFile::read_from(&mut file, ParseOptions::new()).map_err(|e| Error::embed(path, e))?;
    Ok((file, flac))
}

fn save(path: &Path, mut file: File, flac: &FlacFile) -> Result<()> {
    file.seek(SeekFrom::Start(0))?;
    flac.save_to(&mut file, WriteOptions::default())
        .map_err(|e| Error::embed(path, e))
}

fn set(vc: &mut VorbisComments, key: &str, value: &str) {
    if !value.is_empty() {
        vc.insert(key.to_string(), value.to_string());
    }
}

fn set_number(vc: &mut VorbisComments, key: &str, value: u32) {
    if value > 0 {
        vc.insert(key.to_string(), value.to_string());
    }
}

/// Merges `meta` into the file's Vorbis comments and replaces its front cover.
pub fn embed(path: &Path, meta: &Metadata, cover: Option<&[u8]>) -> Result<()> {
    let (file, mut flac) = open(path)?;
    let mut vc = flac.vorbis_comments().cloned().unwrap_or_default();

    set(&mut vc, "TITLE", &meta.title);
    set(&mut vc, "ARTIST", &meta.artist);
    set(&mut vc, "ALBUM", &meta.album);
    set(&mut vc, "ALBUMARTIST", &meta.album_artist);
    set(&mut vc, "DATE", &meta.date);
    set_number(&mut vc, "TRACKNUMBER", meta.track_number);
    set_number(&mut vc, "TOTALTRACKS", meta.total_tracks);
    set_number(&mut vc, "DISCNUMBER", meta.disc_number);
    set_number(&mut vc, "TOTALDISCS", meta.total_discs);
    set(&mut vc, "COPYRIGHT", &meta.copyright);
    set(&mut vc, "PUBLISHER", &meta.publisher);
    set(&mut vc, "DESCRIPTION", &meta.description);
    set(&mut vc, "ISRC", &meta.isrc);
    set(&mut vc, "GENRE", &meta.genre);
    set(&mut vc, "LYRICS", &meta.lyrics);
    set(&mut vc, "URL", &meta.url);
    flac.set_vorbis_comments(vc);

    if let Some(data) = cover {
        attach_cover(&mut flac, data);
    }

    save(path, file, &flac)
}

/// Swaps the front cover. An unreadable image leaves the existing pictures
/// alone.
fn attach_cover(flac: &mut FlacFile, data: &[u8]) {
    let mut picture = match Picture::from_reader(&mut &data[..]) {
        Ok(p) => p,
        Err(e) => {
            warn!(?e, "Cover is not a usable image, skipping it");
            return;
        }
    };
    picture.set_pic_type(PictureType::CoverFront);

    flac.remove_pictures();
    match flac.insert_picture(picture, None) {
        Ok(_) => trace!(bytes = data.len(), "Cover attached"),
        Err(e) => warn!(?e, "Failed to attach cover"),
    }
}

/// Replaces any lyric comments, leaving everything else untouched.
pub fn embed_lyrics(path: &Path, lyrics: &str) -> Result<()> {
    let (file, mut flac) = open(path)?;
    let mut vc = flac.vorbis_comments().cloned().unwrap_or_default();

    for key in LYRIC_KEYS {
        let _removed = vc.remove(key).count();
    }
    vc.insert("LYRICS".to_string(), lyrics.to_string());
    flac.set_vorbis_comments(vc);

    save(path, file, &flac)
}

pub fn read_tags(path: &Path) -> Result<TagSummary> {
    let mut file = File::open(path)?;
    let flac = FlacFile::read_from(&mut file, ParseOptions::new()).map_err(|e| Error::Decoder {
        reason: e.to_string(),
    })?;

    let Some(vc) = flac.vorbis_comments() else {
        return Ok(TagSummary::default());
    };
    let text = |k: &str| vc.get(k).map(ToString::to_string);
    let number = |k: &str| {
        vc.get(k)
            .and_then(|v| v.split('/').next())
            .and_then(|n| n.trim().parse().ok())
    };

    Ok(TagSummary {
        title: text("TITLE"),
        artist: text("ARTIST"),
        album: text("ALBUM"),
        album_artist: text("ALBUMARTIST"),
        track_number: number("TRACKNUMBER"),
        disc_number: number("DISCNUMBER"),
        year: text("DATE").map(|d| d.chars().take(4).collect()),
    })
}
