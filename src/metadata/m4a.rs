use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

use tracing::{debug, warn};

use super::{number_with_total, Metadata};
use crate::{
    config::Config,
    error::{Error, Result},
    helpers::temp_path::TempPath,
    processor::ffmpeg::{Binary, Tool},
};

/// `<stem>.tmp.m4a` next to the file.
fn scratch_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().unwrap_or_default().to_os_string();
    let mut name = stem;
    name.push(".tmp.m4a");
    path.with_file_name(name)
}

fn push_metadata(args: &mut Vec<OsString>, key: &str, value: &str) {
    if !value.is_empty() {
        args.push("-metadata".into());
        args.push(format!("{key}={value}").into());
    }
}

fn embed_args(input: &Path, cover: Option<&Path>, meta: &Metadata, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-i".into(), input.into(), "-y".into()];

    match cover {
        Some(cover) => {
            args.extend(
                [
                    OsStr::new("-i"),
                    cover.as_os_str(),
                    OsStr::new("-map"),
                    OsStr::new("0:a"),
                    OsStr::new("-map"),
                    OsStr::new("1"),
                    OsStr::new("-c:a"),
                    OsStr::new("copy"),
                    OsStr::new("-c:v"),
                    OsStr::new("copy"),
                    OsStr::new("-disposition:v:0"),
                    OsStr::new("attached_pic"),
                ]
                .map(OsStr::to_os_string),
            );
        }
        None => {
            args.extend(
                ["-map", "0", "-codec", "copy"].map(OsString::from),
            );
        }
    }

    push_metadata(&mut args, "title", &meta.title);
    push_metadata(&mut args, "artist", &meta.artist);
    push_metadata(&mut args, "album", &meta.album);
    push_metadata(&mut args, "album_artist", &meta.album_artist);
    push_metadata(&mut args, "date", &meta.date);
    if meta.track_number > 0 {
        push_metadata(&mut args, "track", &number_with_total(meta.track_number, meta.total_tracks));
    }
    if meta.disc_number > 0 {
        push_metadata(&mut args, "disk", &number_with_total(meta.disc_number, meta.total_discs));
    }
    push_metadata(&mut args, "copyright", &meta.copyright);
    push_metadata(&mut args, "publisher", &meta.publisher);
    push_metadata(&mut args, "isrc", &meta.isrc);
    push_metadata(&mut args, "genre", &meta.genre);
    push_metadata(&mut args, "comment", &meta.description);
    push_metadata(&mut args, "lyrics", &meta.lyrics);

    args.extend([OsString::from("-f"), "ipod".into(), output.into()]);
    args
}

fn lyrics_args(input: &Path, lyrics: &str, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-i".into(),
        input.into(),
        "-map".into(),
        "0".into(),
        "-map_metadata".into(),
        "0".into(),
    ];
    push_metadata(&mut args, "lyrics-eng", lyrics);
    push_metadata(&mut args, "lyrics", lyrics);
    args.extend(["-codec", "copy", "-f", "ipod", "-y"].map(OsString::from));
    args.push(output.into());
    args
}

/// Rewrites the file through ffmpeg with `args`, swapping the result in
/// only when ffmpeg succeeds.
async fn rewrite(cfg: &Config, path: &Path, args: Vec<OsString>, scratch: TempPath) -> Result<()> {
    let ffmpeg = Tool::locate(cfg, Binary::Ffmpeg).map_err(|e| Error::embed(path, e))?;
    ffmpeg
        .run_checked(args)
        .await
        .map_err(|reason| Error::embed(path, reason))?;

    tokio::fs::rename(scratch.path(), path).await?;
    scratch.keep();
    debug!(?path, "Rewrote M4A tags");
    Ok(())
}

/// Remuxes with the new tags. When ffmpeg rejects the cover the tags are
/// written without it.
pub async fn embed(cfg: &Config, path: &Path, meta: &Metadata, cover: Option<&Path>) -> Result<()> {
    if let Some(cover) = cover {
        let scratch = TempPath::new(scratch_path(path));
        let args = embed_args(path, Some(cover), meta, scratch.path());
        match rewrite(cfg, path, args, scratch).await {
            Ok(()) => return Ok(()),
            Err(e) => warn!(?e, ?cover, "Embedding with cover failed, retrying without it"),
        }
    }

    let scratch = TempPath::new(scratch_path(path));
    let args = embed_args(path, None, meta, scratch.path());
    rewrite(cfg, path, args, scratch).await
}

pub async fn embed_lyrics(cfg: &Config, path: &Path, lyrics: &str) -> Result<()> {
    let scratch = TempPath::new(scratch_path(path));
    let args = lyrics_args(path, lyrics, scratch.path());
    rewrite(cfg, path, args, scratch).await
}
