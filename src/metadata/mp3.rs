use std::path::Path;

use id3::{
    frame::{Comment, Lyrics, Picture, PictureType},
    ErrorKind, Frame, Tag, TagLike, Version,
};

use tracing::warn;

use super::{number_with_total, Metadata};
use crate::{
    error::{Error, Result},
    processor::probe::TagSummary,
};

fn load(path: &Path) -> Result<Tag> {
    match Tag::read_from_path(path) {
        Ok(tag) => Ok(tag),
        Err(e) if matches!(e.kind, ErrorKind::NoTag) => Ok(Tag::new()),
        Err(e) => Err(Error::embed(path, e)),
    }
}

fn store(path: &Path, tag: &Tag) -> Result<()> {
    tag.write_to_path(path, Version::Id3v23)
        .map_err(|e| Error::embed(path, e))
}

fn cover_mime(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(b"\x89PNG") {
        Some("image/png")
    } else if data.starts_with(&[0xff, 0xd8, 0xff]) {
        Some("image/jpeg")
    } else {
        None
    }
}

/// Writes an ID3v2.3 tag, replacing the front cover and keeping unrelated
/// frames already present.
pub fn embed(path: &Path, meta: &Metadata, cover: Option<&[u8]>) -> Result<()> {
    let mut tag = load(path)?;

    let text = |tag: &mut Tag, id: &str, value: &str| {
        if !value.is_empty() {
            tag.set_text(id, value);
        }
    };

    text(&mut tag, "TIT2", &meta.title);
    text(&mut tag, "TPE1", &meta.artist);
    text(&mut tag, "TALB", &meta.album);
    text(&mut tag, "TPE2", &meta.album_artist);
    text(&mut tag, "TYER", meta.year());
    if meta.track_number > 0 {
        tag.set_text("TRCK", number_with_total(meta.track_number, meta.total_tracks));
    }
    if meta.disc_number > 0 {
        tag.set_text("TPOS", number_with_total(meta.disc_number, meta.total_discs));
    }
    text(&mut tag, "TCOP", &meta.copyright);
    text(&mut tag, "TPUB", &meta.publisher);
    text(&mut tag, "TSRC", &meta.isrc);
    text(&mut tag, "TCON", &meta.genre);

    if !meta.url.is_empty() {
        tag.remove("WOAS");
        tag.add_frame(Frame::link("WOAS", meta.url.as_str()));
    }
    if !meta.description.is_empty() {
        tag.remove_comment(None, None);
        tag.add_frame(Comment {
            lang: "eng".to_string(),
            description: String::new(),
            text: meta.description.clone(),
        });
    }
    if !meta.lyrics.is_empty() {
        set_lyrics(&mut tag, &meta.lyrics);
    }

    if let Some(data) = cover {
        match cover_mime(data) {
            Some(mime_type) => {
                tag.remove_all_pictures();
                tag.add_frame(Picture {
                    mime_type: mime_type.to_string(),
                    picture_type: PictureType::CoverFront,
                    description: "Front cover".to_string(),
                    data: data.to_vec(),
                });
            }
            None => warn!("Cover is neither JPEG nor PNG, skipping it"),
        }
    }

    store(path, &tag)
}

fn set_lyrics(tag: &mut Tag, lyrics: &str) {
    tag.remove_all_lyrics();
    tag.add_frame(Lyrics {
        lang: "eng".to_string(),
        description: String::new(),
        text: lyrics.to_string(),
    });
}

pub fn embed_lyrics(path: &Path, lyrics: &str) -> Result<()> {
    let mut tag = load(path)?;
    set_lyrics(&mut tag, lyrics);
    store(path, &tag)
}

pub fn read_tags(path: &Path) -> Result<TagSummary> {
    let tag = match Tag::read_from_path(path) {
        Ok(tag) => tag,
        Err(e) if matches!(e.kind, ErrorKind::NoTag) => return Ok(TagSummary::default()),
        Err(e) => {
            return Err(Error::Decoder {
                reason: e.to_string(),
            })
        }
    };

    Ok(TagSummary {
        title: tag.title().map(ToString::to_string),
        artist: tag.artist().map(ToString::to_string),
        album: tag.album().map(ToString::to_string),
        album_artist: tag.album_artist().map(ToString::to_string),
        track_number: tag.track(),
        disc_number: tag.disc(),
        year: tag
            .get("TYER")
            .and_then(|f| f.content().text())
            .map(ToString::to_string)
            .or_else(|| tag.date_recorded().map(|d| d.year.to_string())),
    })
}
