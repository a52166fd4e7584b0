use std::{
    env,
    ffi::{OsStr, OsString},
    fmt::Display,
    path::{Path, PathBuf},
    process::{Output, Stdio},
};

use tokio::process::Command;
use tracing::{debug, trace};

use crate::{
    config::Config,
    error::{Error, Result},
};

const ALLOWED_NAMES: &[&str] = &["ffmpeg", "ffmpeg.exe", "ffprobe", "ffprobe.exe"];
const STDERR_TAIL: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binary {
    Ffmpeg,
    Ffprobe,
}
impl Display for Binary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ffmpeg => f.write_str("ffmpeg"),
            Self::Ffprobe => f.write_str("ffprobe"),
        }
    }
}
impl Binary {
    fn file_name(self) -> String {
        if cfg!(windows) {
            format!("{self}.exe")
        } else {
            self.to_string()
        }
    }
}

/// Finds `binary` in the install directory, then (if allowed) on `PATH`, and
/// validates whatever was found.
pub fn locate(cfg: &Config, binary: Binary) -> Result<PathBuf> {
    let name = binary.file_name();

    let local = cfg.ffmpeg_dir.join(&name);
    if local.is_file() {
        validate_executable(&local)?;
        return Ok(local);
    }

    if cfg.ffmpeg_search_path {
        if let Some(found) = search_path(&name) {
            validate_executable(&found)?;
            return Ok(found);
        }
    }

    Err(Error::Decoder {
        reason: format!("{binary} not found in {} or on PATH", cfg.ffmpeg_dir.display()),
    })
}

fn search_path(name: &str) -> Option<PathBuf> {
    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var)
        .filter(|dir| dir.is_absolute())
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Refuses anything that is not an absolute path to an executable file named
/// like one of the decoder binaries.
pub fn validate_executable(path: &Path) -> Result<()> {
    let reject = |reason: String| Err(Error::Decoder { reason });

    if path.as_os_str().is_empty() {
        return reject("empty path".to_string());
    }
    if !path.is_absolute() {
        return reject(format!("path must be absolute: {}", path.display()));
    }

    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) => return reject(format!("cannot stat {}: {e}", path.display())),
    };
    if meta.is_dir() {
        return reject(format!("path is a directory: {}", path.display()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return reject(format!("file is not executable: {}", path.display()));
        }
    }

    let name = path.file_name().and_then(OsStr::to_str).unwrap_or_default();
    if !ALLOWED_NAMES.contains(&name) {
        return reject(format!("invalid executable name: {name}"));
    }

    Ok(())
}

/// A validated decoder binary.
#[derive(Debug, Clone)]
pub struct Tool {
    path: PathBuf,
}

impl Tool {
    pub fn locate(cfg: &Config, binary: Binary) -> Result<Self> {
        locate(cfg, binary).map(|path| Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs the tool to completion, capturing stdout and stderr.
    #[tracing::instrument(skip(self, args), fields(tool = ?self.path))]
    pub async fn run<I, S>(&self, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args = args
            .into_iter()
            .map(|a| a.as_ref().to_os_string())
            .collect::<Vec<OsString>>();
        trace!(?args, "Running decoder");

        let output = Command::new(&self.path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        debug!(status = ?output.status, "Decoder finished");
        Ok(output)
    }

    /// Runs the tool and turns a non-zero exit into a readable reason.
    pub async fn run_checked<I, S>(&self, args: I) -> std::result::Result<Output, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run(args).await.map_err(|e| e.to_string())?;

        if output.status.success() {
            Ok(output)
        } else {
            Err(format!(
                "exit code {:?}: {}",
                output.status.code(),
                stderr_tail(&output.stderr)
            ))
        }
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();

    let mut start = text.len().saturating_sub(STDERR_TAIL);
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Re-encodes `input` (any container ffmpeg reads) to FLAC at `output`.
pub async fn transcode_to_flac(cfg: &Config, input: &Path, output: &Path) -> Result<()> {
    let ffmpeg = Tool::locate(cfg, Binary::Ffmpeg).map_err(|e| Error::Transcode {
        reason: e.to_string(),
        preserved: None,
    })?;

    ffmpeg
        .run_checked([
            OsStr::new("-y"),
            OsStr::new("-i"),
            input.as_os_str(),
            OsStr::new("-vn"),
            OsStr::new("-c:a"),
            OsStr::new("flac"),
            output.as_os_str(),
        ])
        .await
        .map(|_| ())
        .map_err(|reason| Error::Transcode {
            reason,
            preserved: None,
        })
}

/// Decrypts an encrypted MP4 stream with `key`, copying streams unchanged.
pub async fn decrypt(cfg: &Config, input: &Path, output: &Path, key: &str) -> Result<()> {
    let ffmpeg = Tool::locate(cfg, Binary::Ffmpeg).map_err(|e| Error::Decrypt {
        reason: e.to_string(),
    })?;

    ffmpeg
        .run_checked([
            OsStr::new("-decryption_key"),
            OsStr::new(key),
            OsStr::new("-i"),
            input.as_os_str(),
            OsStr::new("-c"),
            OsStr::new("copy"),
            OsStr::new("-y"),
            output.as_os_str(),
        ])
        .await
        .map(|_| ())
        .map_err(|reason| Error::Decrypt { reason })
}
