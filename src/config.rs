use std::{env, path::PathBuf};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
                                      AppleWebKit/537.36 (KHTML, like Gecko) \
                                      Chrome/145.0.0.0 Safari/537.36";

const DEFAULT_TIDAL_APIS: &[&str] = &[
    "https://api.monochrome.tf",
    "https://arran.monochrome.tf",
    "https://triton.squid.wtf",
    "https://hifi-one.spotisaver.net",
    "https://hifi-two.spotisaver.net",
    "https://tidal.kinoplus.online",
    "https://tidal-api.binimum.org",
];

const DEFAULT_QOBUZ_RELAYS: &[&str] = &[
    "https://dab.yeet.su/api/stream?trackId=",
    "https://dabmusic.xyz/api/stream?trackId=",
    "https://qobuz.squid.wtf/api/download-music?track_id=",
];

/// Endpoints and paths for every external collaborator.
///
/// Defaults point at the public services; every field can be overridden with a
/// `TUNEFETCH_*` environment variable (see [`Config::from_env`]).
#[derive(Debug, Clone)]
pub struct Config {
    pub songlink_base: String,
    pub deezer_api_base: String,
    pub tidal_apis: Vec<String>,
    pub amazon_api_base: String,
    pub qobuz_search_base: String,
    pub qobuz_app_id: String,
    pub qobuz_relays: Vec<String>,
    pub deezer_relay_url: String,
    pub spotify_lyrics_base: String,
    pub lrclib_base: String,
    pub musicbrainz_base: String,
    /// Source used to backfill missing album facts. Backfill is skipped when unset.
    pub track_info_base: Option<String>,
    pub ffmpeg_dir: PathBuf,
    pub ffmpeg_search_path: bool,
    pub user_agent: String,
    pub description_tag: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            songlink_base: "https://api.song.link/v1-alpha.1".to_string(),
            deezer_api_base: "https://api.deezer.com".to_string(),
            tidal_apis: DEFAULT_TIDAL_APIS.iter().map(ToString::to_string).collect(),
            amazon_api_base: "https://amzn.afkarxyz.fun/api".to_string(),
            qobuz_search_base: "https://www.qobuz.com/api.json/0.2".to_string(),
            qobuz_app_id: "798273057".to_string(),
            qobuz_relays: DEFAULT_QOBUZ_RELAYS.iter().map(ToString::to_string).collect(),
            deezer_relay_url: "https://yoinkify.lol/api/download".to_string(),
            spotify_lyrics_base: "https://spotify-lyrics-api-pi.vercel.app".to_string(),
            lrclib_base: "https://lrclib.net/api".to_string(),
            musicbrainz_base: "https://musicbrainz.org/ws/2".to_string(),
            track_info_base: None,
            ffmpeg_dir: default_ffmpeg_dir(),
            ffmpeg_search_path: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            description_tag: "https://github.com/afkarxyz/SpotiFLAC".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        override_string(&mut cfg.songlink_base, "TUNEFETCH_SONGLINK_BASE");
        override_string(&mut cfg.deezer_api_base, "TUNEFETCH_DEEZER_API_BASE");
        override_list(&mut cfg.tidal_apis, "TUNEFETCH_TIDAL_APIS");
        override_string(&mut cfg.amazon_api_base, "TUNEFETCH_AMAZON_API_BASE");
        override_string(&mut cfg.qobuz_search_base, "TUNEFETCH_QOBUZ_SEARCH_BASE");
        override_string(&mut cfg.qobuz_app_id, "TUNEFETCH_QOBUZ_APP_ID");
        override_list(&mut cfg.qobuz_relays, "TUNEFETCH_QOBUZ_RELAYS");
        override_string(&mut cfg.deezer_relay_url, "TUNEFETCH_DEEZER_RELAY_URL");
        override_string(&mut cfg.spotify_lyrics_base, "TUNEFETCH_SPOTIFY_LYRICS_BASE");
        override_string(&mut cfg.lrclib_base, "TUNEFETCH_LRCLIB_BASE");
        override_string(&mut cfg.musicbrainz_base, "TUNEFETCH_MUSICBRAINZ_BASE");
        override_string(&mut cfg.user_agent, "TUNEFETCH_USER_AGENT");
        override_string(&mut cfg.description_tag, "TUNEFETCH_DESCRIPTION_TAG");

        if let Some(base) = non_empty_var("TUNEFETCH_TRACK_INFO_BASE") {
            cfg.track_info_base = Some(base);
        }
        if let Some(dir) = non_empty_var("TUNEFETCH_FFMPEG_DIR") {
            cfg.ffmpeg_dir = PathBuf::from(dir);
        }
        if let Some(flag) = non_empty_var("TUNEFETCH_FFMPEG_SEARCH_PATH") {
            cfg.ffmpeg_search_path = !matches!(flag.to_ascii_lowercase().as_str(), "0" | "false" | "no");
        }

        cfg
    }
}

fn default_ffmpeg_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(env::temp_dir)
        .join(".tunefetch")
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn override_string(target: &mut String, key: &str) {
    if let Some(v) = non_empty_var(key) {
        *target = v;
    }
}

fn override_list(target: &mut Vec<String>, key: &str) {
    if let Some(v) = non_empty_var(key) {
        let items = v
            .split(',')
            .map(str::trim)
            .filter(|x| !x.is_empty())
            .map(ToString::to_string)
            .collect::<Vec<_>>();

        if !items.is_empty() {
            *target = items;
        }
    }
}

#[cfg(test)]
pub(crate) fn for_mock(base: &str, ffmpeg_dir: PathBuf) -> Config {
    Config {
        songlink_base: format!("{base}/songlink"),
        deezer_api_base: format!("{base}/deezer-api"),
        tidal_apis: vec![format!("{base}/tidal")],
        amazon_api_base: format!("{base}/amazon"),
        qobuz_search_base: format!("{base}/qobuz-api"),
        qobuz_app_id: "test".to_string(),
        qobuz_relays: vec![format!("{base}/qobuz-relay/stream?trackId=")],
        deezer_relay_url: format!("{base}/deezer-relay"),
        spotify_lyrics_base: format!("{base}/spotify-lyrics"),
        lrclib_base: format!("{base}/lrclib"),
        musicbrainz_base: format!("{base}/musicbrainz"),
        track_info_base: None,
        ffmpeg_dir,
        ffmpeg_search_path: false,
        user_agent: "tunefetch-tests".to_string(),
        description_tag: "tunefetch".to_string(),
    }
}
