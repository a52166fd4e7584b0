use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Queued,
    Downloading,
    Completed,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueItem {
    pub id: String,
    pub track_name: String,
    pub artist_name: String,
    pub album_name: String,
    pub spotify_id: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    pub size_mb: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a finished download looked like, for history views.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub spotify_id: String,
    pub title: String,
    pub artists: String,
    pub album: String,
    /// `m:ss`
    pub duration: String,
    pub cover_url: String,
    pub quality: String,
    pub format: String,
    pub path: PathBuf,
}

/// Receives progress for every item the downloader works on.
///
/// Calls are notifications: implementations must not block and cannot fail
/// a download.
pub trait QueueSink: std::fmt::Debug + Send + Sync {
    fn add_item(&self, id: &str, track_name: &str, artist_name: &str, album_name: &str, spotify_id: &str);

    fn start_item(&self, id: &str);

    fn complete_item(&self, id: &str, path: &Path, size_mb: f64);

    fn skip_item(&self, id: &str, path: &Path);

    fn fail_item(&self, id: &str, message: &str);

    fn record_history(&self, entry: HistoryEntry);
}

/// In-process queue state, safe to read while downloads run.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    items: Mutex<HashMap<String, QueueItem>>,
    history: Mutex<Vec<HistoryEntry>>,
}

impl MemoryQueue {
    pub fn item(&self, id: &str) -> Option<QueueItem> {
        self.items.lock().get(id).cloned()
    }

    pub fn items(&self) -> Vec<QueueItem> {
        self.items.lock().values().cloned().collect()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().clone()
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut QueueItem)) {
        let mut items = self.items.lock();
        let item = items.entry(id.to_string()).or_insert_with(|| QueueItem {
            id: id.to_string(),
            track_name: String::new(),
            artist_name: String::new(),
            album_name: String::new(),
            spotify_id: String::new(),
            status: ItemStatus::Queued,
            file: None,
            size_mb: 0.0,
            error: None,
        });
        f(item);
        trace!(id, status = ?item.status, "Queue item updated");
    }
}

impl QueueSink for MemoryQueue {
    fn add_item(&self, id: &str, track_name: &str, artist_name: &str, album_name: &str, spotify_id: &str) {
        self.update(id, |item| {
            item.track_name = track_name.to_string();
            item.artist_name = artist_name.to_string();
            item.album_name = album_name.to_string();
            item.spotify_id = spotify_id.to_string();
            item.status = ItemStatus::Queued;
        });
    }

    fn start_item(&self, id: &str) {
        self.update(id, |item| item.status = ItemStatus::Downloading);
    }

    fn complete_item(&self, id: &str, path: &Path, size_mb: f64) {
        self.update(id, |item| {
            item.status = ItemStatus::Completed;
            item.file = Some(path.to_path_buf());
            item.size_mb = size_mb;
        });
    }

    fn skip_item(&self, id: &str, path: &Path) {
        self.update(id, |item| {
            item.status = ItemStatus::Skipped;
            item.file = Some(path.to_path_buf());
        });
    }

    fn fail_item(&self, id: &str, message: &str) {
        self.update(id, |item| {
            item.status = ItemStatus::Failed;
            item.error = Some(message.to_string());
        });
    }

    fn record_history(&self, entry: HistoryEntry) {
        self.history.lock().push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_move_through_their_states() {
        let queue = MemoryQueue::default();
        queue.add_item("a", "Song", "Artist", "Album", "abc");
        assert_eq!(queue.item("a").map(|i| i.status), Some(ItemStatus::Queued));

        queue.start_item("a");
        queue.complete_item("a", Path::new("/music/Song.flac"), 5.5);

        let item = queue.item("a").expect("item");
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.track_name, "Song");
        assert_eq!(item.file.as_deref(), Some(Path::new("/music/Song.flac")));
        assert!((item.size_mb - 5.5).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_items_are_created_on_update() {
        let queue = MemoryQueue::default();
        queue.fail_item("b", "Download failed: nope");

        let item = queue.item("b").expect("item");
        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.error.as_deref(), Some("Download failed: nope"));
        assert_eq!(queue.items().len(), 1);
    }
}
